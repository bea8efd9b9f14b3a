//! Data models for ZeeChat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub profile_pic: String,
    #[serde(default)]
    pub is_online: bool,
}

impl User {
    pub fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }
}

/// The backend sends participants either populated or as a bare id.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserRef {
    Id(String),
    Full(User),
}

impl From<UserRef> for User {
    fn from(r: UserRef) -> Self {
        match r {
            UserRef::Id(id) => User::with_id(&id),
            UserRef::Full(user) => user,
        }
    }
}

fn user_or_id<'de, D>(deserializer: D) -> std::result::Result<User, D::Error>
where
    D: Deserializer<'de>,
{
    UserRef::deserialize(deserializer).map(User::from)
}

fn opt_user_or_id<'de, D>(deserializer: D) -> std::result::Result<Option<User>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<UserRef>::deserialize(deserializer)?.map(User::from))
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

/// Local delivery state; never part of the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Shown optimistically, waiting for the server.
    Pending,
    #[default]
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    #[serde(alias = "me", alias = "self")]
    ForMe,
    #[serde(alias = "everyone")]
    ForEveryone,
}

impl DeleteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteScope::ForMe => "for_me",
            DeleteScope::ForEveryone => "for_everyone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(deserialize_with = "user_or_id")]
    pub sender: User,
    #[serde(
        default,
        deserialize_with = "opt_user_or_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub receiver: Option<User>,
    /// Text, or the media reference for image/video/file messages.
    #[serde(rename = "message", default)]
    pub body: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub deleted_for: Vec<String>,
    #[serde(default)]
    pub is_deleted_for_everyone: bool,
    /// Client-generated correlation id echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    pub fn temp_id(client_id: &str) -> String {
        format!("tmp-{}", client_id)
    }

    /// Builds the locally-originated copy shown before the server confirms it.
    pub fn draft(
        sender_id: &str,
        peer_id: &str,
        outgoing: &OutgoingMessage,
        client_id: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::temp_id(client_id),
            sender: User::with_id(sender_id),
            receiver: Some(User::with_id(peer_id)),
            body: outgoing.wire_body(),
            kind: outgoing.kind,
            created_at,
            caption: outgoing.caption.clone(),
            reply_to: outgoing.reply_to.clone(),
            reactions: Vec::new(),
            deleted_for: Vec::new(),
            is_deleted_for_everyone: false,
            client_id: Some(client_id.to_string()),
            delivery: Delivery::Pending,
        }
    }

    /// True while the message exists only locally (pending or failed).
    pub fn is_draft(&self) -> bool {
        self.delivery != Delivery::Sent
    }

    pub fn receiver_id(&self) -> Option<&str> {
        self.receiver.as_ref().map(|u| u.id.as_str())
    }

    /// The other party of this message as seen by `viewer`.
    pub fn counterpart(&self, viewer: &str) -> Option<&str> {
        if self.sender.id == viewer {
            self.receiver_id()
        } else {
            Some(self.sender.id.as_str())
        }
    }

    /// Whether the message was exchanged between `a` and `b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        let sender = self.sender.id.as_str();
        match self.receiver_id() {
            Some(receiver) => {
                (sender == a && receiver == b) || (sender == b && receiver == a)
            }
            None => sender == a || sender == b,
        }
    }

    pub fn is_hidden_for(&self, user_id: &str) -> bool {
        self.deleted_for.iter().any(|u| u == user_id)
    }

    pub fn reaction_of(&self, user_id: &str) -> Option<&str> {
        self.reactions
            .iter()
            .find(|r| r.user_id == user_id)
            .map(|r| r.emoji.as_str())
    }

    /// Toggle/replace: same emoji clears it, a different emoji replaces it.
    /// Returns the user's previous reaction.
    pub fn toggle_reaction(&mut self, user_id: &str, emoji: &str) -> Option<String> {
        let previous = self.reaction_of(user_id).map(str::to_string);
        self.reactions.retain(|r| r.user_id != user_id);
        if previous.as_deref() != Some(emoji) {
            self.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.to_string(),
            });
        }
        previous
    }

    /// Sets the user's reaction to exactly `emoji` (or none).
    pub fn set_reaction(&mut self, user_id: &str, emoji: Option<&str>) {
        self.reactions.retain(|r| r.user_id != user_id);
        if let Some(emoji) = emoji {
            self.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.to_string(),
            });
        }
    }

    pub fn hide_for(&mut self, user_id: &str) {
        if !self.is_hidden_for(user_id) {
            self.deleted_for.push(user_id.to_string());
        }
    }
}

// ============================================================================
// Outgoing
// ============================================================================

/// A user's send intent before it becomes a draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: String,
    pub kind: MessageType,
    pub caption: Option<String>,
    pub media_url: Option<String>,
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Default::default()
        }
    }

    pub fn media(url: &str, kind: MessageType) -> Self {
        Self {
            kind,
            media_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    pub fn with_caption(mut self, caption: &str) -> Self {
        self.caption = Some(caption.to_string());
        self
    }

    pub fn replying_to(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }

    pub fn has_content(&self) -> bool {
        !self.body.trim().is_empty()
            || self.media_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Rebuilds the send intent behind a draft, for retries.
    pub fn from_draft(draft: &Message) -> Self {
        let base = match draft.kind {
            MessageType::Text => Self::text(&draft.body),
            kind => Self::media(&draft.body, kind),
        };
        Self {
            caption: draft.caption.clone(),
            reply_to: draft.reply_to.clone(),
            ..base
        }
    }

    /// What goes in the `message` field: the media reference wins over text.
    pub fn wire_body(&self) -> String {
        match &self.media_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => self.body.clone(),
        }
    }
}

// ============================================================================
// REST payloads
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub participants: Vec<User>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub client_id: String,
}

impl SendRequest {
    pub fn new(outgoing: &OutgoingMessage, client_id: &str) -> Self {
        Self {
            message: outgoing.wire_body(),
            kind: outgoing.kind,
            caption: outgoing.caption.clone(),
            media_url: outgoing.media_url.clone(),
            reply_to: outgoing.reply_to.clone(),
            client_id: client_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponse {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactRequest {
    pub message_id: String,
    pub emoji: String,
}

/// Acknowledgement of a reaction; some servers include the resulting set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReactResponse {
    #[serde(default)]
    pub reactions: Option<Vec<Reaction>>,
}
