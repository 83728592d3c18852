use chatrelay_core::WebhookCrypto;
use std::time::Duration;

/// Configuration for connecting to a chatrelay gateway.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// WebSocket URL of the gateway (`wss://host/ws`).
    pub url: String,
    /// Shared relay token. Empty when the gateway runs without one.
    pub auth_token: String,
    /// Identity announced in the handshake.
    pub user_id: String,
    /// Platform the client serves (`"wecom"`).
    pub platform: String,
    /// HTTP base for the callback and media proxy. Derived from `url` when unset.
    pub http_base: Option<String>,
    /// Upload outbound files through the gateway media proxy.
    pub proxy_media: bool,
    /// Webhook crypto for decrypting `raw` frames locally.
    pub crypto: Option<WebhookCrypto>,
    /// Interval between `ping` frames.
    pub heartbeat_interval: Duration,
    /// Bound on dialing and on the `auth_result` wait.
    pub auth_timeout: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Largest reconnect delay.
    pub backoff_cap: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            auth_token: String::new(),
            user_id: whoami(),
            platform: "wecom".into(),
            http_base: None,
            proxy_media: false,
            crypto: None,
            heartbeat_interval: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl ConnectConfig {
    /// Deadline for the next inbound frame: three heartbeats, at least 15s.
    pub fn read_timeout(&self) -> Duration {
        (self.heartbeat_interval * 3).max(Duration::from_secs(15))
    }

    /// HTTP base URL of the gateway.
    pub fn http_base(&self) -> String {
        match &self.http_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => http_base_from_ws(&self.url),
        }
    }
}

/// `ws://host:port/ws` → `http://host:port`, `wss://…` → `https://…`.
pub fn http_base_from_ws(url: &str) -> String {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        ("https", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        ("http", rest)
    } else {
        return url.trim_end_matches('/').to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    format!("{scheme}://{authority}")
}

/// Get the current system username as a default.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "agent".to_string())
}
