//! Error types for ZeeChat Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Message has no body or media")]
    EmptyMessage,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Message cannot be retried: {0}")]
    NotRetryable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short human-readable text for transient notifications.
    pub fn user_message(&self) -> String {
        match self {
            Error::Http { message, .. } => message.clone(),
            Error::Network(_) => "Network unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Error::Network(e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}
