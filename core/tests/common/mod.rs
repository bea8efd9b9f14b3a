//! Shared fakes for the integration tests
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use zeechat_core::{
    ChatApi, DeleteScope, Delivery, Error, FrameHandler, HistoryResponse, Message, MessageType,
    OutboundEvent, ReactResponse, Result, SendRequest, Transport, User,
};

pub const ME: &str = "me";

pub fn message(id: &str, from: &str, to: &str, body: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        sender: User::with_id(from),
        receiver: Some(User::with_id(to)),
        body: body.to_string(),
        kind: MessageType::Text,
        created_at,
        caption: None,
        reply_to: None,
        reactions: Vec::new(),
        deleted_for: Vec::new(),
        is_deleted_for_everyone: false,
        client_id: None,
        delivery: Delivery::Sent,
    }
}

pub fn frame(kind: &str, payload: serde_json::Value) -> String {
    json!({ "type": kind, "payload": payload }).to_string()
}

pub fn receive_frame(id: &str, from: &str, to: &str, body: &str) -> String {
    frame(
        "receive_message",
        json!({
            "message": {
                "_id": id,
                "sender": { "_id": from, "fullName": "Sender" },
                "receiver": to,
                "message": body,
                "type": "text",
                "createdAt": Utc::now().to_rfc3339(),
            }
        }),
    )
}

/// In-memory REST backend.
#[derive(Default)]
pub struct FakeApi {
    histories: Mutex<HashMap<String, HistoryResponse>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    pub fail: AtomicBool,
    sent: AtomicUsize,
}

impl FakeApi {
    pub fn with_history(self, peer_id: &str, messages: Vec<Message>) -> Self {
        self.histories.lock().insert(
            peer_id.to_string(),
            HistoryResponse {
                messages,
                participants: vec![User::with_id(ME), User::with_id(peer_id)],
            },
        );
        self
    }

    /// Holds history fetches for `peer_id` until the returned gate is notified.
    pub fn gate(&self, peer_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(peer_id.to_string(), gate.clone());
        gate
    }

    fn outcome(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Http {
                status: 503,
                message: "try again later".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl ChatApi for FakeApi {
    async fn fetch_history(&self, peer_id: &str) -> Result<HistoryResponse> {
        let gate = self.gates.lock().get(peer_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.outcome()?;
        Ok(self
            .histories
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, peer_id: &str, request: &SendRequest) -> Result<Message> {
        self.outcome()?;
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        let mut msg = message(&format!("srv-{}", n), ME, peer_id, &request.message, Utc::now());
        msg.client_id = Some(request.client_id.clone());
        Ok(msg)
    }

    async fn react(&self, _message_id: &str, _emoji: &str) -> Result<ReactResponse> {
        self.outcome()?;
        Ok(ReactResponse::default())
    }

    async fn delete_message(&self, _message_id: &str, _scope: DeleteScope) -> Result<()> {
        self.outcome()
    }

    async fn clear_conversation(&self, _peer_id: &str) -> Result<()> {
        self.outcome()
    }
}

/// Transport that records emits and lets tests push inbound frames.
#[derive(Default)]
pub struct LoopbackTransport {
    handler: Mutex<Option<FrameHandler>>,
    pub sent: Mutex<Vec<OutboundEvent>>,
}

impl LoopbackTransport {
    /// Delivers a frame to the registered consumer. False if none is registered.
    pub fn inject(&self, frame: &str) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(frame.to_string());
                true
            }
            None => false,
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|e| e.kind()).collect()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, event: &OutboundEvent) -> bool {
        self.sent.lock().push(event.clone());
        true
    }

    fn on_event(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn clear_handler(&self) {
        *self.handler.lock() = None;
    }
}
