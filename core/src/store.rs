//! Conversation store: the per-peer message log and everything merged into it.
//!
//! REST results, optimistic sends and WebSocket events all land here. The
//! store is a plain synchronous state machine; [`StoreHandle`] shares it
//! between the inbound event handler and the outbound composer and publishes
//! a revision counter after every mutation.

use crate::config::SyncConfig;
use crate::events::{InboundEvent, ReactionChange};
use crate::models::{DeleteScope, Delivery, HistoryResponse, Message, User};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// ============================================================================
// State types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Loaded,
    /// History fetch failed; retry by selecting the peer again.
    Failed(String),
}

/// Identifies one history request so late responses can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub peer_id: String,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct ActiveConversation {
    pub peer_id: String,
    pub peer: Option<User>,
    pub state: LoadState,
    pub log: Vec<Message>,
    fetch_seq: u64,
    /// Early events already folded into the current history baseline.
    replayed: Vec<(String, PendingOp)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationSummary {
    pub peer_id: String,
    pub last_message: Option<Message>,
    pub unread: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    SendFailed,
    ReactionFailed,
    DeleteFailed,
    ClearFailed,
    HistoryFailed,
}

/// Transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Reaction(ReactionChange),
    Deletion {
        scope: DeleteScope,
        user_id: String,
    },
}

/// Reactions and deletions that arrived before their message.
#[derive(Debug)]
struct PendingOps {
    queue: VecDeque<(String, PendingOp)>,
    capacity: usize,
}

impl PendingOps {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, message_id: &str, op: PendingOp) {
        if self.queue.len() >= self.capacity {
            if let Some((dropped, _)) = self.queue.pop_front() {
                tracing::warn!("Pending event buffer full, dropping event for {}", dropped);
            }
        }
        self.queue.push_back((message_id.to_string(), op));
    }

    fn take_matching(&mut self, ids: &HashSet<&str>) -> Vec<(String, PendingOp)> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for (id, op) in self.queue.drain(..) {
            if ids.contains(id.as_str()) {
                taken.push((id, op));
            } else {
                kept.push_back((id, op));
            }
        }
        self.queue = kept;
        taken
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug)]
pub struct ConversationStore {
    user_id: String,
    active: Option<ActiveConversation>,
    summaries: HashMap<String, ConversationSummary>,
    presence: HashMap<String, Presence>,
    typing: HashMap<String, Instant>,
    pending: PendingOps,
    notices: VecDeque<Notice>,
    quiet_period: Duration,
    next_fetch_seq: u64,
}

impl ConversationStore {
    pub fn new(user_id: &str, sync: &SyncConfig) -> Self {
        Self {
            user_id: user_id.to_string(),
            active: None,
            summaries: HashMap::new(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            pending: PendingOps::new(sync.max_pending_events),
            notices: VecDeque::new(),
            quiet_period: Duration::from_millis(sync.typing_quiet_period_ms),
            next_fetch_seq: 0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn active(&self) -> Option<&ActiveConversation> {
        self.active.as_ref()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.peer_id.as_str())
    }

    pub fn load_state(&self) -> LoadState {
        self.active
            .as_ref()
            .map(|a| a.state.clone())
            .unwrap_or(LoadState::Empty)
    }

    pub fn log(&self) -> &[Message] {
        self.active.as_ref().map(|a| a.log.as_slice()).unwrap_or(&[])
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.log().iter().find(|m| m.id == message_id)
    }

    pub fn presence(&self, user_id: &str) -> Option<&Presence> {
        self.presence.get(user_id)
    }

    pub fn summary(&self, peer_id: &str) -> Option<&ConversationSummary> {
        self.summaries.get(peer_id)
    }

    /// Summaries ordered by most recent message first.
    pub fn summaries(&self) -> Vec<&ConversationSummary> {
        let mut all: Vec<_> = self.summaries.values().collect();
        all.sort_by(|a, b| {
            let at = |s: &ConversationSummary| s.last_message.as_ref().map(|m| m.created_at);
            at(*b).cmp(&at(*a)).then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        all
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending.len()
    }

    /// The counterpart of a message in the active log, or the active peer.
    pub fn peer_for_message(&self, message_id: &str) -> Option<String> {
        self.message(message_id)
            .and_then(|m| m.counterpart(&self.user_id))
            .or_else(|| self.active_peer())
            .map(str::to_string)
    }

    // ------------------------------------------------------------------------
    // Selection and history
    // ------------------------------------------------------------------------

    /// Makes `peer_id` the active conversation and returns the ticket its
    /// history response must present.
    pub fn select_peer(&mut self, peer_id: &str) -> FetchTicket {
        self.next_fetch_seq += 1;
        let seq = self.next_fetch_seq;

        // Re-selecting the same peer keeps unsent drafts.
        let drafts: Vec<Message> = match self.active.take() {
            Some(prev) if prev.peer_id == peer_id => {
                prev.log.into_iter().filter(Message::is_draft).collect()
            }
            _ => Vec::new(),
        };

        self.active = Some(ActiveConversation {
            peer_id: peer_id.to_string(),
            peer: None,
            state: LoadState::Loading,
            log: drafts,
            fetch_seq: seq,
            replayed: Vec::new(),
        });
        self.summary_entry(peer_id).unread = 0;

        FetchTicket {
            peer_id: peer_id.to_string(),
            seq,
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.peer_id == ticket.peer_id && a.fetch_seq == ticket.seq)
    }

    /// Replaces the active log with server history. Returns false when the
    /// ticket is stale.
    pub fn apply_history(&mut self, ticket: &FetchTicket, history: HistoryResponse) -> bool {
        if !self.is_current(ticket) {
            tracing::debug!("Discarding stale history for {}", ticket.peer_id);
            return false;
        }
        let user_id = self.user_id.clone();
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let mut messages = history.messages;
        messages.sort_by_key(|m| m.created_at);

        let mut seen = HashSet::new();
        let mut log: Vec<Message> = Vec::with_capacity(messages.len());
        for mut msg in messages {
            if seen.insert(msg.id.clone()) {
                msg.delivery = Delivery::Sent;
                log.push(msg);
            }
        }

        let confirmed_clients: HashSet<String> =
            log.iter().filter_map(|m| m.client_id.clone()).collect();
        for draft in active.log.drain(..).filter(Message::is_draft) {
            let covered = draft
                .client_id
                .as_ref()
                .is_some_and(|c| confirmed_clients.contains(c));
            if !covered {
                log.push(draft);
            }
        }

        let ids: HashSet<&str> = log.iter().map(|m| m.id.as_str()).collect();
        let mut ops = std::mem::take(&mut active.replayed);
        ops.extend(self.pending.take_matching(&ids));
        for (message_id, op) in &ops {
            if !reflected_in(&log, message_id, op) {
                apply_op(&mut log, &user_id, message_id, op);
            }
        }

        active.replayed = ops;
        active.log = log;
        active.state = LoadState::Loaded;
        active.peer = history
            .participants
            .iter()
            .find(|u| u.id == active.peer_id)
            .or_else(|| history.participants.iter().find(|u| u.id != user_id))
            .cloned();

        let peer_id = active.peer_id.clone();
        let peer_online = active.peer.as_ref().map(|p| p.is_online);
        let last = active.log.iter().rev().find(|m| !m.is_draft()).cloned();

        if let Some(online) = peer_online {
            self.presence.entry(peer_id.clone()).or_insert(Presence {
                online,
                last_seen: None,
            });
        }
        if let Some(last) = last {
            self.summary_entry(&peer_id).last_message = Some(last);
        }
        true
    }

    pub fn fail_history(&mut self, ticket: &FetchTicket, reason: &str) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        if let Some(active) = self.active.as_mut() {
            active.state = LoadState::Failed(reason.to_string());
        }
        self.push_notice(NoticeKind::HistoryFailed, reason);
        true
    }

    /// Drops the active conversation entirely (chat closed).
    pub fn close_active(&mut self) {
        self.active = None;
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Shows a locally-originated draft at the tail of the log.
    pub fn append_optimistic(&mut self, draft: Message) {
        let Some(peer_id) = draft.counterpart(&self.user_id).map(str::to_string) else {
            return;
        };
        self.summary_entry(&peer_id).last_message = Some(draft.clone());
        if let Some(active) = self.active.as_mut().filter(|a| a.peer_id == peer_id) {
            if !active.log.iter().any(|m| m.id == draft.id) {
                active.log.push(draft);
            }
        }
    }

    /// Collapses the draft `temp_id` and its server-confirmed copy into one entry.
    pub fn reconcile_sent(&mut self, temp_id: &str, mut confirmed: Message) {
        confirmed.delivery = Delivery::Sent;
        let Some(peer_id) = confirmed.counterpart(&self.user_id).map(str::to_string) else {
            return;
        };
        self.summary_entry(&peer_id).last_message = Some(confirmed.clone());

        let user_id = self.user_id.clone();
        let Some(active) = self.active.as_mut().filter(|a| a.peer_id == peer_id) else {
            return;
        };

        let existing = active.log.iter().position(|m| m.id == confirmed.id);
        let draft = active.log.iter().position(|m| m.id == temp_id);
        match (existing, draft) {
            (Some(_), Some(d)) => {
                // The echo already landed.
                active.log.remove(d);
            }
            (Some(_), None) => {}
            (None, Some(d)) => {
                let draft = active.log.remove(d);
                if confirmed.client_id.is_none() {
                    confirmed.client_id = draft.client_id;
                }
                let at = insert_ordered(&mut active.log, confirmed);
                replay_for(&mut self.pending, &mut active.log, &user_id, at);
            }
            (None, None) => {
                if active.state == LoadState::Loaded {
                    let at = insert_ordered(&mut active.log, confirmed);
                    replay_for(&mut self.pending, &mut active.log, &user_id, at);
                }
            }
        }
    }

    pub fn mark_failed(&mut self, temp_id: &str, reason: &str) {
        if let Some(draft) = self.draft_mut(temp_id) {
            draft.delivery = Delivery::Failed {
                reason: reason.to_string(),
            };
        }
        self.push_notice(NoticeKind::SendFailed, reason);
    }

    /// Moves a failed draft back to pending and returns it for resending.
    pub fn mark_pending(&mut self, temp_id: &str) -> Option<Message> {
        let draft = self.draft_mut(temp_id)?;
        if !matches!(draft.delivery, Delivery::Failed { .. }) {
            return None;
        }
        draft.delivery = Delivery::Pending;
        Some(draft.clone())
    }

    pub fn discard_draft(&mut self, temp_id: &str) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let before = active.log.len();
        active.log.retain(|m| !(m.id == temp_id && m.is_draft()));
        before != active.log.len()
    }

    fn draft_mut(&mut self, temp_id: &str) -> Option<&mut Message> {
        self.active
            .as_mut()?
            .log
            .iter_mut()
            .find(|m| m.id == temp_id && m.is_draft())
    }

    // ------------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------------

    pub fn apply_event(&mut self, event: InboundEvent, now: Instant, wall_now: DateTime<Utc>) {
        match event {
            InboundEvent::MessageReceived(msg) => self.receive_message(msg),
            InboundEvent::ReactionChanged { message_id, change } => {
                self.apply_reaction(&message_id, change);
            }
            InboundEvent::MessageDeleted {
                message_id,
                scope,
                user_id,
            } => {
                self.apply_deletion(&message_id, scope, user_id.as_deref());
            }
            InboundEvent::ChatCleared { user_id, by } => {
                let peer = if user_id == self.user_id { by } else { Some(user_id) };
                match peer {
                    Some(peer) => self.apply_clear(&peer),
                    None => tracing::debug!("chat_cleared without a counterpart, ignoring"),
                }
            }
            InboundEvent::TypingChanged { user_id, is_typing } => {
                self.set_typing(&user_id, is_typing, now);
            }
            InboundEvent::PresenceChanged {
                user_id,
                online,
                last_seen,
            } => {
                self.set_presence(&user_id, online, last_seen, wall_now);
            }
            InboundEvent::Ignored { .. } => {}
        }
    }

    /// Merges a pushed message, collapsing it with a matching own draft.
    pub fn receive_message(&mut self, mut msg: Message) {
        msg.delivery = Delivery::Sent;
        let Some(peer_id) = msg.counterpart(&self.user_id).map(str::to_string) else {
            return;
        };
        let from_me = msg.sender.id == self.user_id;
        let is_active = self.active_peer() == Some(peer_id.as_str());

        let summary = self.summary_entry(&peer_id);
        summary.last_message = Some(msg.clone());
        if !from_me && !is_active {
            summary.unread += 1;
        }

        let user_id = self.user_id.clone();
        let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.peer_id == peer_id && a.state == LoadState::Loaded)
        else {
            return;
        };

        if active.log.iter().any(|m| m.id == msg.id) {
            return;
        }

        if from_me {
            if let Some(d) = find_draft_for(&active.log, &msg) {
                let draft = active.log.remove(d);
                if msg.client_id.is_none() {
                    msg.client_id = draft.client_id;
                }
            }
        }

        let at = insert_ordered(&mut active.log, msg);
        replay_for(&mut self.pending, &mut active.log, &user_id, at);
    }

    pub fn apply_reaction(&mut self, message_id: &str, change: ReactionChange) {
        if let ReactionChange::Toggle { user_id, .. } = &change {
            if *user_id == self.user_id {
                // Own reactions are applied locally before they are sent.
                return;
            }
        }
        let op = PendingOp::Reaction(change);
        if !self.apply_to_log(message_id, &op) {
            self.pending.push(message_id, op);
        }
    }

    /// Applies the current user's reaction locally; returns the previous one.
    pub fn apply_local_reaction(
        &mut self,
        message_id: &str,
        emoji: &str,
    ) -> crate::error::Result<Option<String>> {
        let user_id = self.user_id.clone();
        let msg = self
            .message_mut(message_id)
            .ok_or_else(|| crate::error::Error::UnknownMessage(message_id.to_string()))?;
        Ok(msg.toggle_reaction(&user_id, emoji))
    }

    /// Puts the current user's reaction back to `previous`.
    pub fn restore_reaction(&mut self, message_id: &str, previous: Option<&str>) {
        let user_id = self.user_id.clone();
        if let Some(msg) = self.message_mut(message_id) {
            msg.set_reaction(&user_id, previous);
        }
    }

    /// Applies a deletion now, or holds it until the message appears.
    pub fn apply_deletion(&mut self, message_id: &str, scope: DeleteScope, user_id: Option<&str>) {
        let op = PendingOp::Deletion {
            scope,
            user_id: user_id.unwrap_or(self.user_id.as_str()).to_string(),
        };
        if scope == DeleteScope::ForEveryone {
            for summary in self.summaries.values_mut() {
                if let Some(last) = summary.last_message.as_mut().filter(|m| m.id == message_id) {
                    last.is_deleted_for_everyone = true;
                }
            }
        }
        if !self.apply_to_log(message_id, &op) {
            self.pending.push(message_id, op);
        }
    }

    /// Reverts a local "delete for me".
    pub fn unhide(&mut self, message_id: &str) {
        let user_id = self.user_id.clone();
        if let Some(msg) = self.message_mut(message_id) {
            msg.deleted_for.retain(|u| *u != user_id);
        }
    }

    /// Purges everything exchanged with `peer_id`. Idempotent.
    pub fn apply_clear(&mut self, peer_id: &str) {
        let summary = self.summary_entry(peer_id);
        summary.last_message = None;
        summary.unread = 0;

        let user_id = self.user_id.clone();
        if let Some(active) = self.active.as_mut().filter(|a| a.peer_id == peer_id) {
            active.log.retain(|m| !m.is_between(&user_id, peer_id));
            active.replayed.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Typing and presence
    // ------------------------------------------------------------------------

    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, now: Instant) {
        if is_typing {
            self.typing.insert(user_id.to_string(), now + self.quiet_period);
        } else {
            self.typing.remove(user_id);
        }
    }

    /// Drops typing entries whose quiet period has elapsed. Returns true if any expired.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        let before = self.typing.len();
        self.typing.retain(|_, deadline| *deadline > now);
        before != self.typing.len()
    }

    pub fn is_typing(&self, user_id: &str, now: Instant) -> bool {
        self.typing.get(user_id).is_some_and(|deadline| *deadline > now)
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.values().min().copied()
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn set_presence(
        &mut self,
        user_id: &str,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let entry = self.presence.entry(user_id.to_string()).or_default();
        entry.online = online;
        if !online {
            entry.last_seen = Some(last_seen.unwrap_or(now));
            self.typing.remove(user_id);
        }
    }

    // ------------------------------------------------------------------------
    // Notices
    // ------------------------------------------------------------------------

    pub fn push_notice(&mut self, kind: NoticeKind, text: &str) {
        self.notices.push_back(Notice {
            kind,
            text: text.to_string(),
        });
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn summary_entry(&mut self, peer_id: &str) -> &mut ConversationSummary {
        self.summaries
            .entry(peer_id.to_string())
            .or_insert_with(|| ConversationSummary {
                peer_id: peer_id.to_string(),
                ..Default::default()
            })
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.active
            .as_mut()?
            .log
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    fn apply_to_log(&mut self, message_id: &str, op: &PendingOp) -> bool {
        let user_id = self.user_id.clone();
        match self.active.as_mut() {
            Some(active) => apply_op(&mut active.log, &user_id, message_id, op),
            None => false,
        }
    }
}

/// Applies `op` to the message in `log`; false if the message is not there.
fn apply_op(log: &mut Vec<Message>, user_id: &str, message_id: &str, op: &PendingOp) -> bool {
    let Some(at) = log.iter().position(|m| m.id == message_id) else {
        return false;
    };
    match op {
        PendingOp::Reaction(ReactionChange::Toggle { user_id: reactor, emoji }) => {
            log[at].toggle_reaction(reactor, emoji);
        }
        PendingOp::Reaction(ReactionChange::Snapshot(reactions)) => {
            // At most one reaction per user; the last listed wins.
            let msg = &mut log[at];
            msg.reactions.clear();
            for r in reactions {
                msg.set_reaction(&r.user_id, Some(r.emoji.as_str()));
            }
        }
        PendingOp::Deletion {
            scope: DeleteScope::ForEveryone,
            ..
        } => {
            log.remove(at);
        }
        PendingOp::Deletion {
            scope: DeleteScope::ForMe,
            user_id: target,
        } => {
            log[at].hide_for(target);
            if target != user_id {
                tracing::debug!("Message {} hidden for {}", message_id, target);
            }
        }
    }
    true
}

/// Whether a server baseline already shows the effect of a held toggle.
fn reflected_in(log: &[Message], message_id: &str, op: &PendingOp) -> bool {
    match op {
        PendingOp::Reaction(ReactionChange::Toggle { user_id, emoji }) => log
            .iter()
            .find(|m| m.id == message_id)
            .is_some_and(|m| m.reaction_of(user_id) == Some(emoji.as_str())),
        _ => false,
    }
}

/// Replays held events for the message at `at` after it entered the log.
fn replay_for(pending: &mut PendingOps, log: &mut Vec<Message>, user_id: &str, at: usize) {
    let Some(id) = log.get(at).map(|m| m.id.clone()) else {
        return;
    };
    let ids: HashSet<&str> = [id.as_str()].into_iter().collect();
    for (message_id, op) in pending.take_matching(&ids) {
        apply_op(log, user_id, &message_id, &op);
    }
}

/// Inserts a confirmed message by creation time, ahead of any drafts.
fn insert_ordered(log: &mut Vec<Message>, msg: Message) -> usize {
    let at = log
        .iter()
        .position(|m| m.is_draft() || m.created_at > msg.created_at)
        .unwrap_or(log.len());
    log.insert(at, msg);
    at
}

/// Finds the own draft an echoed message corresponds to: by correlation id,
/// or when the echo carries none, the oldest pending draft with equal content.
fn find_draft_for(log: &[Message], echo: &Message) -> Option<usize> {
    match &echo.client_id {
        Some(client_id) => log
            .iter()
            .position(|m| m.is_draft() && m.client_id.as_ref() == Some(client_id)),
        None => log.iter().position(|m| {
            m.delivery == Delivery::Pending && m.body == echo.body && m.kind == echo.kind
        }),
    }
}

// ============================================================================
// Shared handle
// ============================================================================

/// Shared access to the store. Every `update` bumps the published revision.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<ConversationStore>>,
    revision: Arc<watch::Sender<u64>>,
}

impl StoreHandle {
    pub fn new(store: ConversationStore) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(store)),
            revision: Arc::new(tx),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&ConversationStore) -> T) -> T {
        f(&self.inner.lock())
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ConversationStore) -> T) -> T {
        let out = {
            let mut store = self.inner.lock();
            f(&mut store)
        };
        self.revision.send_modify(|r| *r += 1);
        out
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageType, OutgoingMessage, Reaction};
    use chrono::TimeZone;

    const ME: &str = "me";
    const PEER: &str = "peer";

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, 0).unwrap()
    }

    fn msg(id: &str, from: &str, to: &str, body: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            sender: User::with_id(from),
            receiver: Some(User::with_id(to)),
            body: body.to_string(),
            kind: MessageType::Text,
            created_at: at(minute),
            caption: None,
            reply_to: None,
            reactions: Vec::new(),
            deleted_for: Vec::new(),
            is_deleted_for_everyone: false,
            client_id: None,
            delivery: Delivery::Sent,
        }
    }

    fn history(messages: Vec<Message>) -> HistoryResponse {
        HistoryResponse {
            messages,
            participants: vec![
                User {
                    is_online: true,
                    ..User::with_id(PEER)
                },
                User::with_id(ME),
            ],
        }
    }

    fn loaded(messages: Vec<Message>) -> ConversationStore {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let ticket = store.select_peer(PEER);
        assert!(store.apply_history(&ticket, history(messages)));
        store
    }

    fn ids(store: &ConversationStore) -> Vec<&str> {
        store.log().iter().map(|m| m.id.as_str()).collect()
    }

    fn draft(store: &mut ConversationStore, client_id: &str, body: &str) -> String {
        let draft = Message::draft(ME, PEER, &OutgoingMessage::text(body), client_id, at(30));
        let temp_id = draft.id.clone();
        store.append_optimistic(draft);
        temp_id
    }

    fn confirmed(id: &str, client_id: Option<&str>, body: &str) -> Message {
        Message {
            client_id: client_id.map(str::to_string),
            ..msg(id, ME, PEER, body, 30)
        }
    }

    #[test]
    fn test_rest_confirmation_before_echo() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "hi", 1)]);
        let temp = draft(&mut store, "1", "hello");
        assert_eq!(temp, "tmp-1");
        assert_eq!(ids(&store), vec!["m-1", "tmp-1"]);
        assert!(store.message("tmp-1").unwrap().is_draft());

        store.reconcile_sent(&temp, confirmed("m-42", Some("1"), "hello"));
        store.receive_message(confirmed("m-42", Some("1"), "hello"));

        assert_eq!(ids(&store), vec!["m-1", "m-42"]);
        let sent = store.message("m-42").unwrap();
        assert_eq!(sent.body, "hello");
        assert_eq!(sent.delivery, Delivery::Sent);
    }

    #[test]
    fn test_reconciled_message_keeps_creation_order() {
        let mut store = loaded(vec![msg("m-0", PEER, ME, "a", 1)]);
        let temp = draft(&mut store, "c1", "hi");
        store.receive_message(msg("p-1", PEER, ME, "yo", 5));
        assert_eq!(ids(&store), vec!["m-0", "p-1", "tmp-c1"]);

        let sent = Message {
            created_at: at(2),
            ..confirmed("m-1", Some("c1"), "hi")
        };
        store.reconcile_sent(&temp, sent);

        assert_eq!(ids(&store), vec!["m-0", "m-1", "p-1"]);
        assert!(store
            .log()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_echoed_message_keeps_creation_order() {
        let mut store = loaded(vec![]);
        draft(&mut store, "c1", "hi");
        store.receive_message(msg("p-1", PEER, ME, "yo", 5));

        store.receive_message(Message {
            created_at: at(2),
            ..confirmed("m-1", Some("c1"), "hi")
        });

        assert_eq!(ids(&store), vec!["m-1", "p-1"]);
        assert_eq!(store.message("m-1").unwrap().client_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_echo_before_rest_confirmation() {
        let mut store = loaded(vec![]);
        let temp = draft(&mut store, "1", "hello");

        store.receive_message(confirmed("m-42", Some("1"), "hello"));
        assert_eq!(ids(&store), vec!["m-42"]);

        store.reconcile_sent(&temp, confirmed("m-42", Some("1"), "hello"));
        assert_eq!(ids(&store), vec!["m-42"]);
    }

    #[test]
    fn test_echo_without_correlation_matches_content() {
        let mut store = loaded(vec![]);
        let temp = draft(&mut store, "1", "hello");

        store.receive_message(confirmed("m-42", None, "hello"));
        assert_eq!(ids(&store), vec!["m-42"]);
        assert_eq!(store.message("m-42").unwrap().client_id.as_deref(), Some("1"));

        store.reconcile_sent(&temp, confirmed("m-42", None, "hello"));
        assert_eq!(ids(&store), vec!["m-42"]);
    }

    #[test]
    fn test_identical_texts_reconcile_separately() {
        let mut store = loaded(vec![]);
        let first = draft(&mut store, "a", "ok");
        let second = draft(&mut store, "b", "ok");

        store.receive_message(confirmed("m-2", Some("b"), "ok"));
        assert_eq!(ids(&store), vec!["tmp-a", "m-2"]);

        store.reconcile_sent(&first, confirmed("m-1", Some("a"), "ok"));
        store.reconcile_sent(&second, confirmed("m-2", Some("b"), "ok"));
        store.receive_message(confirmed("m-1", Some("a"), "ok"));
        assert_eq!(ids(&store), vec!["m-1", "m-2"]);
    }

    #[test]
    fn test_failed_send_is_retained() {
        let mut store = loaded(vec![]);
        let temp = draft(&mut store, "1", "hello");

        store.mark_failed(&temp, "HTTP 500");
        let failed = store.message(&temp).unwrap();
        assert!(matches!(failed.delivery, Delivery::Failed { .. }));
        assert_eq!(store.take_notices()[0].kind, NoticeKind::SendFailed);

        let again = store.mark_pending(&temp).unwrap();
        assert_eq!(again.delivery, Delivery::Pending);
        assert!(store.mark_pending(&temp).is_none());

        assert!(store.discard_draft(&temp));
        assert!(store.log().is_empty());
    }

    #[test]
    fn test_reaction_toggle_and_replace() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "hi", 1)]);

        assert_eq!(store.apply_local_reaction("m-1", "👍").unwrap(), None);
        store.apply_local_reaction("m-1", "👍").unwrap();
        assert_eq!(store.message("m-1").unwrap().reaction_of(ME), None);

        store.apply_local_reaction("m-1", "👍").unwrap();
        store.apply_local_reaction("m-1", "❤️").unwrap();
        let reactions = &store.message("m-1").unwrap().reactions;
        assert_eq!(reactions.iter().filter(|r| r.user_id == ME).count(), 1);
        assert_eq!(store.message("m-1").unwrap().reaction_of(ME), Some("❤️"));

        store.restore_reaction("m-1", Some("👍"));
        assert_eq!(store.message("m-1").unwrap().reaction_of(ME), Some("👍"));
        assert!(store.apply_local_reaction("nope", "👍").is_err());
    }

    #[test]
    fn test_peer_reaction_sequence_keeps_one_per_user() {
        let mut store = loaded(vec![msg("m-1", ME, PEER, "hi", 1)]);
        for emoji in ["👍", "❤️", "😂", "😂", "🔥"] {
            store.apply_reaction(
                "m-1",
                ReactionChange::Toggle {
                    user_id: PEER.to_string(),
                    emoji: emoji.to_string(),
                },
            );
            let count = store.message("m-1").unwrap().reactions.len();
            assert!(count <= 1);
        }
        assert_eq!(store.message("m-1").unwrap().reaction_of(PEER), Some("🔥"));

        store.apply_reaction(
            "m-1",
            ReactionChange::Snapshot(vec![
                Reaction {
                    emoji: "👍".to_string(),
                    user_id: PEER.to_string(),
                },
                Reaction {
                    emoji: "😂".to_string(),
                    user_id: PEER.to_string(),
                },
            ]),
        );
        assert_eq!(store.message("m-1").unwrap().reactions.len(), 1);
        assert_eq!(store.message("m-1").unwrap().reaction_of(PEER), Some("😂"));
    }

    #[test]
    fn test_own_reaction_echo_ignored() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "hi", 1)]);
        store.apply_local_reaction("m-1", "👍").unwrap();
        store.apply_reaction(
            "m-1",
            ReactionChange::Toggle {
                user_id: ME.to_string(),
                emoji: "👍".to_string(),
            },
        );
        assert_eq!(store.message("m-1").unwrap().reaction_of(ME), Some("👍"));
    }

    #[test]
    fn test_early_reaction_applied_after_history() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let ticket = store.select_peer(PEER);

        store.apply_reaction(
            "m-1",
            ReactionChange::Toggle {
                user_id: PEER.to_string(),
                emoji: "🔥".to_string(),
            },
        );
        assert_eq!(store.pending_event_count(), 1);

        let payload = history(vec![msg("m-1", ME, PEER, "hi", 1)]);
        store.apply_history(&ticket, payload.clone());
        assert_eq!(store.message("m-1").unwrap().reaction_of(PEER), Some("🔥"));
        assert_eq!(store.pending_event_count(), 0);

        // Same payload again yields the same state.
        store.apply_history(&ticket, payload);
        assert_eq!(store.message("m-1").unwrap().reaction_of(PEER), Some("🔥"));
        assert_eq!(store.log().len(), 1);
    }

    #[test]
    fn test_buffered_reaction_already_in_history() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let other = store.select_peer("alice");
        store.apply_history(&other, history(vec![]));

        // Reaction on a message from a conversation that is not open.
        store.apply_reaction(
            "b-1",
            ReactionChange::Toggle {
                user_id: PEER.to_string(),
                emoji: "🔥".to_string(),
            },
        );
        assert_eq!(store.pending_event_count(), 1);

        let mut reacted = msg("b-1", PEER, ME, "yo", 1);
        reacted.reactions.push(Reaction {
            emoji: "🔥".to_string(),
            user_id: PEER.to_string(),
        });
        let payload = history(vec![reacted]);

        let ticket = store.select_peer(PEER);
        assert!(store.apply_history(&ticket, payload.clone()));
        assert_eq!(store.message("b-1").unwrap().reaction_of(PEER), Some("🔥"));
        assert_eq!(store.message("b-1").unwrap().reactions.len(), 1);
        assert_eq!(store.pending_event_count(), 0);

        let ticket = store.select_peer(PEER);
        assert!(store.apply_history(&ticket, payload));
        assert_eq!(store.message("b-1").unwrap().reaction_of(PEER), Some("🔥"));
    }

    #[test]
    fn test_early_reaction_applied_on_push() {
        let mut store = loaded(vec![]);
        store.apply_reaction(
            "m-7",
            ReactionChange::Toggle {
                user_id: PEER.to_string(),
                emoji: "👍".to_string(),
            },
        );
        store.receive_message(msg("m-7", PEER, ME, "late", 5));
        assert_eq!(store.message("m-7").unwrap().reaction_of(PEER), Some("👍"));
    }

    #[test]
    fn test_stale_history_discarded() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let old = store.select_peer("alice");
        let new = store.select_peer(PEER);

        assert!(!store.apply_history(&old, history(vec![msg("a-1", "alice", ME, "x", 1)])));
        assert_eq!(store.load_state(), LoadState::Loading);
        assert!(store.log().is_empty());
        assert!(!store.fail_history(&old, "late failure"));

        assert!(store.apply_history(&new, history(vec![msg("m-1", PEER, ME, "y", 1)])));
        assert_eq!(ids(&store), vec!["m-1"]);
        assert_eq!(store.load_state(), LoadState::Loaded);
        assert_eq!(store.active().unwrap().peer.as_ref().unwrap().id, PEER);
    }

    #[test]
    fn test_history_failure_is_retryable() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let ticket = store.select_peer(PEER);
        assert!(store.fail_history(&ticket, "Failed to fetch messages"));
        assert!(matches!(store.load_state(), LoadState::Failed(_)));

        let retry = store.select_peer(PEER);
        assert_eq!(store.load_state(), LoadState::Loading);
        assert!(store.apply_history(&retry, history(vec![])));
        assert_eq!(store.load_state(), LoadState::Loaded);
    }

    #[test]
    fn test_history_keeps_unconfirmed_drafts() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let ticket = store.select_peer(PEER);
        draft(&mut store, "1", "sent while loading");
        draft(&mut store, "2", "already stored");

        let server = vec![
            msg("m-1", PEER, ME, "old", 1),
            confirmed("m-2", Some("2"), "already stored"),
        ];
        store.apply_history(&ticket, history(server));
        assert_eq!(ids(&store), vec!["m-1", "m-2", "tmp-1"]);
    }

    #[test]
    fn test_history_sorted_and_deduplicated() {
        let store = loaded(vec![
            msg("m-2", PEER, ME, "second", 2),
            msg("m-1", ME, PEER, "first", 1),
            msg("m-2", PEER, ME, "second", 2),
        ]);
        assert_eq!(ids(&store), vec!["m-1", "m-2"]);
    }

    #[test]
    fn test_delete_for_everyone_removes() {
        let mut store = loaded(vec![
            msg("m-5", ME, PEER, "oops", 1),
            msg("m-6", PEER, ME, "ok", 2),
        ]);
        store.apply_deletion("m-5", DeleteScope::ForEveryone, None);
        assert_eq!(ids(&store), vec!["m-6"]);
    }

    #[test]
    fn test_early_deletion_applied_on_arrival() {
        let mut store = loaded(vec![]);
        store.apply_deletion("m-5", DeleteScope::ForEveryone, None);
        store.receive_message(msg("m-5", PEER, ME, "gone", 3));
        assert!(store.log().is_empty());

        store.apply_deletion("m-6", DeleteScope::ForMe, None);
        store.receive_message(msg("m-6", PEER, ME, "hidden", 4));
        assert!(store.message("m-6").unwrap().is_hidden_for(ME));
    }

    #[test]
    fn test_delete_for_me_and_unhide() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "hi", 1)]);
        store.apply_deletion("m-1", DeleteScope::ForMe, None);
        assert!(store.message("m-1").unwrap().is_hidden_for(ME));
        store.unhide("m-1");
        assert!(!store.message("m-1").unwrap().is_hidden_for(ME));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "a", 1), msg("m-2", ME, PEER, "b", 2)]);
        store.apply_clear(PEER);
        assert!(store.log().is_empty());
        assert!(store.summary(PEER).unwrap().last_message.is_none());

        store.apply_clear(PEER);
        assert!(store.log().is_empty());
        assert_eq!(store.load_state(), LoadState::Loaded);
    }

    #[test]
    fn test_clear_event_names_counterpart() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "a", 1)]);
        let now = Instant::now();
        store.apply_event(
            InboundEvent::ChatCleared {
                user_id: ME.to_string(),
                by: Some(PEER.to_string()),
            },
            now,
            at(5),
        );
        assert!(store.log().is_empty());
    }

    #[test]
    fn test_typing_expires_after_quiet_period() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        let t0 = Instant::now();

        store.set_typing(PEER, true, t0);
        assert!(store.is_typing(PEER, t0 + Duration::from_millis(1999)));
        assert!(!store.is_typing(PEER, t0 + Duration::from_millis(2000)));

        // A refresh pushes the deadline out.
        store.set_typing(PEER, true, t0 + Duration::from_millis(1500));
        assert!(!store.expire_typing(t0 + Duration::from_millis(2500)));
        assert!(store.expire_typing(t0 + Duration::from_millis(3500)));
        assert!(store.next_typing_deadline().is_none());

        store.set_typing(PEER, true, t0);
        store.set_typing(PEER, false, t0);
        assert!(!store.is_typing(PEER, t0));
    }

    #[test]
    fn test_presence_offline_stamps_last_seen() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        store.set_presence(PEER, true, None, at(1));
        assert!(store.presence(PEER).unwrap().online);

        store.set_presence(PEER, false, None, at(9));
        let presence = store.presence(PEER).unwrap();
        assert!(!presence.online);
        assert_eq!(presence.last_seen, Some(at(9)));

        store.set_presence(PEER, false, Some(at(7)), at(10));
        assert_eq!(store.presence(PEER).unwrap().last_seen, Some(at(7)));
    }

    #[test]
    fn test_message_for_other_peer_updates_summary_only() {
        let mut store = loaded(vec![]);
        store.receive_message(msg("b-1", "bob", ME, "psst", 3));
        store.receive_message(msg("b-2", "bob", ME, "hello?", 4));

        assert!(store.log().is_empty());
        let summary = store.summary("bob").unwrap();
        assert_eq!(summary.unread, 2);
        assert_eq!(summary.last_message.as_ref().unwrap().id, "b-2");
        assert_eq!(store.summaries()[0].peer_id, "bob");

        store.select_peer("bob");
        assert_eq!(store.summary("bob").unwrap().unread, 0);
    }

    #[test]
    fn test_message_while_loading_not_logged() {
        let mut store = ConversationStore::new(ME, &SyncConfig::default());
        store.select_peer(PEER);
        store.receive_message(msg("m-1", PEER, ME, "early", 1));
        assert!(store.log().is_empty());
        assert_eq!(store.summary(PEER).unwrap().last_message.as_ref().unwrap().id, "m-1");
    }

    #[test]
    fn test_pushed_messages_ordered_ahead_of_drafts() {
        let mut store = loaded(vec![msg("m-1", PEER, ME, "a", 1)]);
        draft(&mut store, "1", "mine");
        store.receive_message(msg("m-3", PEER, ME, "c", 3));
        store.receive_message(msg("m-2", PEER, ME, "b", 2));
        store.receive_message(msg("m-2", PEER, ME, "b", 2));
        assert_eq!(ids(&store), vec!["m-1", "m-2", "m-3", "tmp-1"]);
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let sync = SyncConfig {
            max_pending_events: 2,
            ..SyncConfig::default()
        };
        let mut store = ConversationStore::new(ME, &sync);
        for id in ["x", "y", "z"] {
            store.apply_deletion(id, DeleteScope::ForEveryone, None);
        }
        assert_eq!(store.pending_event_count(), 2);
    }

    #[test]
    fn test_handle_bumps_revision() {
        let handle = StoreHandle::new(ConversationStore::new(ME, &SyncConfig::default()));
        let rx = handle.subscribe();
        assert_eq!(handle.revision(), 0);

        handle.update(|s| s.select_peer(PEER));
        assert_eq!(handle.revision(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(handle.read(|s| s.active_peer().map(str::to_string)), Some(PEER.to_string()));
    }
}
