//! Session lifecycle: wires the connection, the store and the composer.

use crate::api::{ApiClient, ChatApi};
use crate::composer::OutboundComposer;
use crate::config::{ClientConfig, SyncConfig};
use crate::connection::{ConnectionManager, Transport};
use crate::error::Result;
use crate::events;
use crate::events::InboundEvent;
use crate::store::{ConversationStore, StoreHandle};
use crate::view::ConversationView;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One signed-in user's view of their conversations.
pub struct ChatSession<A: ChatApi = ApiClient, T: Transport = ConnectionManager> {
    store: StoreHandle,
    api: Arc<A>,
    transport: Arc<T>,
    composer: OutboundComposer<A, T>,
    typing_wake: Arc<Notify>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Signs in over REST and the socket, and starts consuming events.
    pub async fn connect(config: &ClientConfig, user_id: &str, token: &str) -> Result<Self> {
        let api = ApiClient::new(config)?;
        api.set_token(token);

        let connection = Arc::new(ConnectionManager::new(config.clone()));
        connection.connect(token).await?;

        let session = Self::new(user_id, &config.sync, Arc::new(api), connection);
        session.attach();
        Ok(session)
    }
}

impl<A: ChatApi, T: Transport> ChatSession<A, T> {
    pub fn new(user_id: &str, sync: &SyncConfig, api: Arc<A>, transport: Arc<T>) -> Self {
        let store = StoreHandle::new(ConversationStore::new(user_id, sync));
        let composer = OutboundComposer::new(api.clone(), transport.clone(), store.clone());

        Self {
            store,
            api,
            transport,
            composer,
            typing_wake: Arc::new(Notify::new()),
            expiry: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn composer(&self) -> &OutboundComposer<A, T> {
        &self.composer
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Revision counter bumped on every store change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    /// Registers as the connection's consumer and starts typing expiry.
    /// Must run inside a Tokio runtime.
    pub fn attach(&self) {
        let store = self.store.clone();
        let wake = self.typing_wake.clone();

        self.transport.on_event(Arc::new(move |frame: String| {
            let Some(event) = events::normalize(&frame) else {
                return;
            };
            let started_typing =
                matches!(event, InboundEvent::TypingChanged { is_typing: true, .. });

            store.update(|s| s.apply_event(event, Instant::now(), Utc::now()));
            if started_typing {
                wake.notify_one();
            }
        }));

        let task = tokio::spawn(run_typing_expiry(
            self.store.clone(),
            self.typing_wake.clone(),
        ));
        if let Some(old) = self.expiry.lock().replace(task) {
            old.abort();
        }
        tracing::debug!("Session attached");
    }

    pub fn detach(&self) {
        self.transport.clear_handler();
        if let Some(task) = self.expiry.lock().take() {
            task.abort();
        }
        tracing::debug!("Session detached");
    }

    /// Opens the conversation with `peer_id` and loads its history.
    /// Calling it again after a failure retries the fetch.
    pub async fn select_peer(&self, peer_id: &str) -> Result<()> {
        let ticket = self.store.update(|s| s.select_peer(peer_id));

        match self.api.fetch_history(peer_id).await {
            Ok(history) => {
                let count = history.messages.len();
                if self.store.update(|s| s.apply_history(&ticket, history)) {
                    tracing::info!("Loaded {} messages with {}", count, peer_id);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("History fetch for {} failed: {}", peer_id, e);
                self.store
                    .update(|s| s.fail_history(&ticket, &e.user_message()));
                Err(e)
            }
        }
    }

    pub fn close_conversation(&self) {
        self.store.update(|s| s.close_active());
    }

    /// Current derived view, in the local timezone.
    pub fn view(&self) -> ConversationView {
        let now = Instant::now();
        let wall_now = Local::now();
        self.store
            .read(|s| ConversationView::derive(s, now, &wall_now))
    }
}

impl<A: ChatApi, T: Transport> Drop for ChatSession<A, T> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Sleeps until the earliest typing deadline and expires it; woken early
/// whenever a new typing signal arrives.
async fn run_typing_expiry(store: StoreHandle, wake: Arc<Notify>) {
    loop {
        match store.read(|s| s.next_typing_deadline()) {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let now = Instant::now();
                        let due =
                            store.read(|s| s.next_typing_deadline().is_some_and(|d| d <= now));
                        if due {
                            store.update(|s| s.expire_typing(now));
                        }
                    }
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}
