//! Configuration management for ZeeChat clients

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Inactivity window after which a typing indicator expires.
    pub typing_quiet_period_ms: u64,
    pub request_timeout_secs: u64,
    /// Upper bound on reactions/deletions held for messages not yet seen.
    pub max_pending_events: usize,
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_quiet_period_ms: 2000,
            request_timeout_secs: 30,
            max_pending_events: 512,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 5000,
                use_tls: false,
                ws_path: default_ws_path(),
            },
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server: ServerConfig {
                host: host.to_string(),
                port,
                use_tls,
                ws_path: default_ws_path(),
            },
            sync: SyncConfig::default(),
        }
    }

    /// Loads the config at `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.server.use_tls { "wss" } else { "ws" };
        format!(
            "{}://{}:{}{}",
            scheme, self.server.host, self.server.port, self.server.ws_path
        )
    }

    /// Socket URL carrying the session token as the `token` query parameter.
    pub fn ws_url_with_token(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.ws_url())?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.sync.typing_quiet_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }
}
