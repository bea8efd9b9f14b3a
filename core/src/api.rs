//! HTTP API client for the messages endpoints

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder, Response};
use std::future::Future;

/// The REST surface the sync core depends on.
pub trait ChatApi: Send + Sync + 'static {
    fn fetch_history(&self, peer_id: &str) -> impl Future<Output = Result<HistoryResponse>> + Send;

    fn send_message(
        &self,
        peer_id: &str,
        request: &SendRequest,
    ) -> impl Future<Output = Result<Message>> + Send;

    fn react(
        &self,
        message_id: &str,
        emoji: &str,
    ) -> impl Future<Output = Result<ReactResponse>> + Send;

    fn delete_message(
        &self,
        message_id: &str,
        scope: DeleteScope,
    ) -> impl Future<Output = Result<()>> + Send;

    fn clear_conversation(&self, peer_id: &str) -> impl Future<Output = Result<()>> + Send;
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn auth_header(&self) -> Option<String> {
        self.token.lock().as_ref().map(|t| format!("Bearer {}", t))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}/api/messages/{}", self.base_url, path));

        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }
        req
    }

    /// Maps non-2xx responses to `Error::Http`, keeping the server's `message` text.
    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        Err(Error::Http {
            status: status.as_u16(),
            message,
        })
    }
}

impl ChatApi for ApiClient {
    async fn fetch_history(&self, peer_id: &str) -> Result<HistoryResponse> {
        let resp = self.request(Method::GET, peer_id).send().await?;
        let history: HistoryResponse = Self::check(resp).await?.json().await?;
        Ok(history)
    }

    async fn send_message(&self, peer_id: &str, request: &SendRequest) -> Result<Message> {
        let resp = self
            .request(Method::POST, &format!("send/{}", peer_id))
            .json(request)
            .send()
            .await?;
        let data: SendResponse = Self::check(resp).await?.json().await?;
        Ok(data.message)
    }

    async fn react(&self, message_id: &str, emoji: &str) -> Result<ReactResponse> {
        let body = ReactRequest {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        };
        let resp = self.request(Method::POST, "react").json(&body).send().await?;
        let text = Self::check(resp).await?.text().await?;

        // The ack body is optional.
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }

    async fn delete_message(&self, message_id: &str, scope: DeleteScope) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &format!("message/{}", message_id))
            .query(&[("type", scope.as_str())])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn clear_conversation(&self, peer_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &format!("clear/{}", peer_id))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
