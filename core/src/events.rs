//! WebSocket event types and the inbound frame normalizer.
//!
//! Frames on the wire are `{"type": ..., "payload": ...}`. Inbound frames are
//! decoded into the closed [`InboundEvent`] set; kinds this client does not
//! know decode to [`InboundEvent::Ignored`] instead of failing.

use crate::error::{Error, Result};
use crate::models::{DeleteScope, Message, Reaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MessageReceived(Message),
    ReactionChanged {
        message_id: String,
        change: ReactionChange,
    },
    MessageDeleted {
        message_id: String,
        scope: DeleteScope,
        user_id: Option<String>,
    },
    /// `user_id` names a party of the cleared chat; `by` is whoever cleared it.
    ChatCleared {
        user_id: String,
        by: Option<String>,
    },
    TypingChanged {
        user_id: String,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: String,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    Ignored {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactionChange {
    /// A single user's toggle/replace, as relayed from a peer.
    Toggle { user_id: String, emoji: String },
    /// The complete, authoritative reaction list for the message.
    Snapshot(Vec<Reaction>),
}

#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct ReceivePayload {
    message: Message,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionPayload {
    message_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    reactions: Option<Vec<Reaction>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletePayload {
    message_id: String,
    #[serde(rename = "type", alias = "scope", default = "default_delete_scope")]
    scope: DeleteScope,
    #[serde(default)]
    user_id: Option<String>,
}

fn default_delete_scope() -> DeleteScope {
    DeleteScope::ForEveryone
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearPayload {
    #[serde(alias = "peerId")]
    user_id: String,
    #[serde(default)]
    by: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    user_id: String,
    #[serde(default)]
    is_typing: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    user_id: String,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

/// Decodes one raw frame. Unknown kinds are `Ignored`; malformed frames are errors.
pub fn decode(text: &str) -> Result<InboundEvent> {
    let frame: Frame = serde_json::from_str(text)?;
    let payload = frame.payload;

    let event = match frame.kind.as_str() {
        "receive_message" | "new_message" => {
            let p: ReceivePayload = serde_json::from_value(payload)?;
            InboundEvent::MessageReceived(p.message)
        }
        "message_reacted" | "reaction_update" => {
            let p: ReactionPayload = serde_json::from_value(payload)?;
            let change = match (p.reactions, p.user_id, p.emoji) {
                (Some(reactions), _, _) => ReactionChange::Snapshot(reactions),
                (None, Some(user_id), Some(emoji)) => ReactionChange::Toggle { user_id, emoji },
                _ => {
                    return Err(Error::WebSocket(format!(
                        "{} without reactions or userId/emoji",
                        frame.kind
                    )))
                }
            };
            InboundEvent::ReactionChanged {
                message_id: p.message_id,
                change,
            }
        }
        "message_deleted" => {
            let p: DeletePayload = serde_json::from_value(payload)?;
            InboundEvent::MessageDeleted {
                message_id: p.message_id,
                scope: p.scope,
                user_id: p.user_id,
            }
        }
        "chat_cleared" => {
            let p: ClearPayload = serde_json::from_value(payload)?;
            InboundEvent::ChatCleared {
                user_id: p.user_id,
                by: p.by,
            }
        }
        "user_typing" | "typing" => {
            let p: TypingPayload = serde_json::from_value(payload)?;
            InboundEvent::TypingChanged {
                user_id: p.user_id,
                is_typing: p.is_typing.unwrap_or(true),
            }
        }
        "stop_typing" => {
            let p: TypingPayload = serde_json::from_value(payload)?;
            InboundEvent::TypingChanged {
                user_id: p.user_id,
                is_typing: false,
            }
        }
        "user_online" | "user_offline" => {
            let p: PresencePayload = serde_json::from_value(payload)?;
            InboundEvent::PresenceChanged {
                user_id: p.user_id,
                online: frame.kind == "user_online",
                last_seen: p.last_seen,
            }
        }
        _ => InboundEvent::Ignored { kind: frame.kind },
    };

    Ok(event)
}

/// Decodes a frame, logging and dropping it when malformed.
pub fn normalize(text: &str) -> Option<InboundEvent> {
    match decode(text) {
        Ok(InboundEvent::Ignored { kind }) => {
            tracing::debug!("Ignoring unknown event kind: {}", kind);
            None
        }
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!("Dropping malformed frame: {}", e);
            None
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    Typing {
        to: String,
    },
    StopTyping {
        to: String,
    },
    ReactMessage {
        to: String,
        #[serde(rename = "messageId")]
        message_id: String,
        emoji: String,
    },
    DeleteMessage {
        to: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "type")]
        scope: DeleteScope,
    },
    ClearChat {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::StopTyping { .. } => "stop_typing",
            OutboundEvent::ReactMessage { .. } => "react_message",
            OutboundEvent::DeleteMessage { .. } => "delete_message",
            OutboundEvent::ClearChat { .. } => "clear_chat",
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
