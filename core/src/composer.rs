//! Outbound composer: user intents become a REST call plus a socket emit.
//!
//! REST is the durable path; socket emits only shorten fan-out latency and
//! are never awaited for confirmation.

use crate::api::ChatApi;
use crate::connection::Transport;
use crate::error::{Error, Result};
use crate::events::{OutboundEvent, ReactionChange};
use crate::models::{DeleteScope, Message, OutgoingMessage, SendRequest};
use crate::store::{NoticeKind, StoreHandle};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct TypingSignal {
    last_sent: Instant,
    generation: u64,
}

pub struct OutboundComposer<A, T> {
    api: Arc<A>,
    transport: Arc<T>,
    store: StoreHandle,
    typing: Arc<Mutex<HashMap<String, TypingSignal>>>,
    quiet_period: Duration,
}

impl<A, T> Clone for OutboundComposer<A, T> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            typing: self.typing.clone(),
            quiet_period: self.quiet_period,
        }
    }
}

impl<A: ChatApi, T: Transport> OutboundComposer<A, T> {
    pub fn new(api: Arc<A>, transport: Arc<T>, store: StoreHandle) -> Self {
        let quiet_period = store.read(|s| s.quiet_period());
        Self {
            api,
            transport,
            store,
            typing: Arc::new(Mutex::new(HashMap::new())),
            quiet_period,
        }
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Shows the message optimistically, then persists it over REST.
    pub async fn send(&self, peer_id: &str, outgoing: OutgoingMessage) -> Result<Message> {
        if !outgoing.has_content() {
            return Err(Error::EmptyMessage);
        }

        let client_id = Uuid::new_v4().to_string();
        let user_id = self.store.read(|s| s.user_id().to_string());
        let draft = Message::draft(&user_id, peer_id, &outgoing, &client_id, Utc::now());
        let temp_id = draft.id.clone();

        self.store.update(|s| s.append_optimistic(draft));
        self.stop_typing(peer_id);

        self.deliver(peer_id, &temp_id, &outgoing, &client_id).await
    }

    /// Re-sends a failed draft under its original correlation id.
    pub async fn retry(&self, temp_id: &str) -> Result<Message> {
        let draft = self
            .store
            .update(|s| s.mark_pending(temp_id))
            .ok_or_else(|| Error::NotRetryable(temp_id.to_string()))?;

        let peer_id = draft
            .receiver_id()
            .map(str::to_string)
            .ok_or_else(|| Error::NotRetryable(temp_id.to_string()))?;
        let client_id = draft
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let outgoing = OutgoingMessage::from_draft(&draft);

        self.deliver(&peer_id, temp_id, &outgoing, &client_id).await
    }

    pub fn discard(&self, temp_id: &str) -> bool {
        self.store.update(|s| s.discard_draft(temp_id))
    }

    async fn deliver(
        &self,
        peer_id: &str,
        temp_id: &str,
        outgoing: &OutgoingMessage,
        client_id: &str,
    ) -> Result<Message> {
        let request = SendRequest::new(outgoing, client_id);
        match self.api.send_message(peer_id, &request).await {
            Ok(confirmed) => {
                tracing::debug!("Message {} confirmed as {}", temp_id, confirmed.id);
                self.store
                    .update(|s| s.reconcile_sent(temp_id, confirmed.clone()));
                Ok(confirmed)
            }
            Err(e) => {
                tracing::warn!("Send to {} failed: {}", peer_id, e);
                self.store
                    .update(|s| s.mark_failed(temp_id, &e.user_message()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------------

    /// Toggles or replaces the user's reaction. Rolled back if REST rejects it.
    pub async fn react(&self, message_id: &str, emoji: &str) -> Result<()> {
        let (previous, peer) = self.store.update(|s| {
            if s.message(message_id).is_some_and(Message::is_draft) {
                return Err(Error::UnknownMessage(message_id.to_string()));
            }
            let previous = s.apply_local_reaction(message_id, emoji)?;
            Ok((previous, s.peer_for_message(message_id)))
        })?;

        if let Some(peer) = &peer {
            self.transport.send(&OutboundEvent::ReactMessage {
                to: peer.clone(),
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            });
        }

        match self.api.react(message_id, emoji).await {
            Ok(ack) => {
                if let Some(reactions) = ack.reactions {
                    self.store.update(|s| {
                        s.apply_reaction(message_id, ReactionChange::Snapshot(reactions))
                    });
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Reaction on {} failed: {}", message_id, e);
                self.store.update(|s| {
                    s.restore_reaction(message_id, previous.as_deref());
                    s.push_notice(NoticeKind::ReactionFailed, &e.user_message());
                });
                // Toggling again undoes what the peer was already shown.
                if let Some(peer) = peer {
                    self.transport.send(&OutboundEvent::ReactMessage {
                        to: peer,
                        message_id: message_id.to_string(),
                        emoji: previous.unwrap_or_else(|| emoji.to_string()),
                    });
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Deletion and clearing
    // ------------------------------------------------------------------------

    pub async fn delete_message(&self, message_id: &str, scope: DeleteScope) -> Result<()> {
        let (is_draft, peer) = self.store.read(|s| {
            (
                s.message(message_id).map(Message::is_draft),
                s.peer_for_message(message_id),
            )
        });
        match is_draft {
            None => return Err(Error::UnknownMessage(message_id.to_string())),
            Some(true) => {
                self.discard(message_id);
                return Ok(());
            }
            Some(false) => {}
        }

        match scope {
            DeleteScope::ForMe => {
                self.store
                    .update(|s| s.apply_deletion(message_id, DeleteScope::ForMe, None));

                if let Err(e) = self.api.delete_message(message_id, scope).await {
                    tracing::warn!("Delete of {} failed: {}", message_id, e);
                    self.store.update(|s| {
                        s.unhide(message_id);
                        s.push_notice(NoticeKind::DeleteFailed, &e.user_message());
                    });
                    return Err(e);
                }
                Ok(())
            }
            DeleteScope::ForEveryone => {
                // Only the server knows whether we may; wait for it.
                if let Err(e) = self.api.delete_message(message_id, scope).await {
                    tracing::warn!("Delete of {} for everyone failed: {}", message_id, e);
                    self.store
                        .update(|s| s.push_notice(NoticeKind::DeleteFailed, &e.user_message()));
                    return Err(e);
                }

                self.store.update(|s| {
                    if s.message(message_id).is_some() {
                        s.apply_deletion(message_id, DeleteScope::ForEveryone, None);
                    }
                });
                if let Some(peer) = peer {
                    self.transport.send(&OutboundEvent::DeleteMessage {
                        to: peer,
                        message_id: message_id.to_string(),
                        scope,
                    });
                }
                Ok(())
            }
        }
    }

    /// Purges the conversation with `peer_id` on the server and locally.
    pub async fn clear_conversation(&self, peer_id: &str) -> Result<()> {
        if let Err(e) = self.api.clear_conversation(peer_id).await {
            tracing::warn!("Clearing chat with {} failed: {}", peer_id, e);
            self.store
                .update(|s| s.push_notice(NoticeKind::ClearFailed, &e.user_message()));
            return Err(e);
        }

        self.store.update(|s| s.apply_clear(peer_id));
        self.transport.send(&OutboundEvent::ClearChat {
            user_id: peer_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------------

    /// Signals input activity toward `peer_id`. Must run inside a Tokio runtime.
    pub fn notify_typing(&self, peer_id: &str) {
        let now = Instant::now();
        let refresh = self.quiet_period / 2;

        let (emit, generation) = {
            let mut typing = self.typing.lock();
            match typing.get_mut(peer_id) {
                Some(signal) => {
                    signal.generation += 1;
                    let emit = now >= signal.last_sent + refresh;
                    if emit {
                        signal.last_sent = now;
                    }
                    (emit, signal.generation)
                }
                None => {
                    typing.insert(
                        peer_id.to_string(),
                        TypingSignal {
                            last_sent: now,
                            generation: 0,
                        },
                    );
                    (true, 0)
                }
            }
        };

        if emit {
            self.transport.send(&OutboundEvent::Typing {
                to: peer_id.to_string(),
            });
        }

        let composer = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(composer.quiet_period).await;
            composer.stop_if_idle(&peer_id, generation);
        });
    }

    /// Emits `stop_typing` if a typing signal is outstanding for `peer_id`.
    pub fn stop_typing(&self, peer_id: &str) {
        if self.typing.lock().remove(peer_id).is_some() {
            self.transport.send(&OutboundEvent::StopTyping {
                to: peer_id.to_string(),
            });
        }
    }

    fn stop_if_idle(&self, peer_id: &str, generation: u64) {
        let idle = {
            let mut typing = self.typing.lock();
            let idle = typing
                .get(peer_id)
                .is_some_and(|s| s.generation == generation);
            if idle {
                typing.remove(peer_id);
            }
            idle
        };
        if idle {
            self.transport.send(&OutboundEvent::StopTyping {
                to: peer_id.to_string(),
            });
        }
    }
}
