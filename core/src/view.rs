//! Presentation binding: read-only derivations over the conversation store.

use crate::models::{Delivery, Message, MessageType};
use crate::store::{ConversationStore, LoadState, Presence};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Display;
use tokio::time::Instant;

pub const TOMBSTONE_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub peer_id: Option<String>,
    pub peer_name: Option<String>,
    pub state: LoadState,
    pub peer_is_typing: bool,
    pub status_text: String,
    pub groups: Vec<DayGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub label: String,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub id: String,
    pub body: String,
    pub kind: MessageType,
    pub caption: Option<String>,
    pub reply_to: Option<String>,
    pub is_mine: bool,
    pub is_tombstone: bool,
    pub time: String,
    pub delivery: Delivery,
    pub reactions: Vec<ReactionChip>,
}

/// All reactions with one emoji.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionChip {
    pub emoji: String,
    pub count: usize,
    pub mine: bool,
}

impl ConversationView {
    pub fn derive<Tz>(store: &ConversationStore, now: Instant, wall_now: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let Some(active) = store.active() else {
            return Self {
                peer_id: None,
                peer_name: None,
                state: LoadState::Empty,
                peer_is_typing: false,
                status_text: String::new(),
                groups: Vec::new(),
            };
        };

        let peer_is_typing = store.is_typing(&active.peer_id, now);
        let presence = store.presence(&active.peer_id);

        Self {
            peer_id: Some(active.peer_id.clone()),
            peer_name: active.peer.as_ref().map(|p| p.full_name.clone()),
            state: active.state.clone(),
            peer_is_typing,
            status_text: presence_text(peer_is_typing, presence, wall_now),
            groups: group_by_day(&active.log, store.user_id(), wall_now),
        }
    }
}

/// Typing, then online, then last seen, then "Offline".
pub fn presence_text<Tz>(typing: bool, presence: Option<&Presence>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if typing {
        return "Typing...".to_string();
    }
    match presence {
        Some(p) if p.online => "Online".to_string(),
        Some(Presence {
            last_seen: Some(at),
            ..
        }) => last_seen_text(at, now),
        _ => "Offline".to_string(),
    }
}

/// Groups visible messages under their calendar-day labels.
pub fn group_by_day<Tz>(log: &[Message], viewer: &str, now: &DateTime<Tz>) -> Vec<DayGroup>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut groups: Vec<DayGroup> = Vec::new();

    for msg in log.iter().filter(|m| !m.is_hidden_for(viewer)) {
        let label = day_label(&msg.created_at, now);
        let view = message_view(msg, viewer, &now.timezone());

        match groups.iter_mut().find(|g| g.label == label) {
            Some(group) => group.messages.push(view),
            None => groups.push(DayGroup {
                label,
                messages: vec![view],
            }),
        }
    }
    groups
}

fn message_view<Tz>(msg: &Message, viewer: &str, tz: &Tz) -> MessageView
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let tombstone = msg.is_deleted_for_everyone;
    MessageView {
        id: msg.id.clone(),
        body: if tombstone {
            TOMBSTONE_TEXT.to_string()
        } else {
            msg.body.clone()
        },
        kind: if tombstone { MessageType::Text } else { msg.kind },
        caption: msg.caption.clone().filter(|_| !tombstone),
        reply_to: msg.reply_to.clone(),
        is_mine: msg.sender.id == viewer,
        is_tombstone: tombstone,
        time: time_label(&msg.created_at, tz),
        delivery: msg.delivery.clone(),
        reactions: if tombstone {
            Vec::new()
        } else {
            reaction_chips(msg, viewer)
        },
    }
}

/// One chip per emoji, in first-reacted order.
pub fn reaction_chips(msg: &Message, viewer: &str) -> Vec<ReactionChip> {
    let mut chips: Vec<ReactionChip> = Vec::new();
    for reaction in &msg.reactions {
        let mine = reaction.user_id == viewer;
        match chips.iter_mut().find(|c| c.emoji == reaction.emoji) {
            Some(chip) => {
                chip.count += 1;
                chip.mine |= mine;
            }
            None => chips.push(ReactionChip {
                emoji: reaction.emoji.clone(),
                count: 1,
                mine,
            }),
        }
    }
    chips
}

/// `Today`, `Yesterday`, or e.g. `1 Mar 2025`, in the timezone of `now`.
pub fn day_label<Tz>(at: &DateTime<Utc>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let local = at.with_timezone(&now.timezone());
    match relative_day(&local, now) {
        Some(label) => label.to_string(),
        None => local.format("%-d %b %Y").to_string(),
    }
}

pub fn time_label<Tz>(at: &DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%H:%M").to_string()
}

pub fn last_seen_text<Tz>(at: &DateTime<Utc>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let local = at.with_timezone(&now.timezone());
    let time = local.format("%I:%M %p");
    match relative_day(&local, now) {
        Some(day) => format!("Last seen {} at {}", day, time),
        None => format!("Last seen {} at {}", local.format("%d %b %Y"), time),
    }
}

fn relative_day<Tz: TimeZone>(local: &DateTime<Tz>, now: &DateTime<Tz>) -> Option<&'static str> {
    let day = local.date_naive();
    let today = now.date_naive();
    if day == today {
        Some("Today")
    } else if today.pred_opt() == Some(day) {
        Some("Yesterday")
    } else {
        None
    }
}
