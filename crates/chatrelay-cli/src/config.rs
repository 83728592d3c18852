//! Client configuration at `~/.chatrelay/client.toml`.
//!
//! `[gateway]` says where to dial, `[wecom]` optionally holds local platform
//! credentials (direct media) and callback secrets (raw relay mode), and
//! `[agent]` says where messages go.

use anyhow::{Context, Result};
use chatrelay_client::ConnectConfig;
use chatrelay_core::WebhookCrypto;
use chatrelay_platform::{WeComApi, WeComConfig, DEFAULT_API_BASE};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    pub wecom: Option<WeComSection>,
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[gateway]` section.
#[derive(Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub auth_token: String,
    /// Identity announced in the handshake. Defaults to the login name.
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// HTTP base of the gateway, when it differs from the WebSocket host.
    pub http_base: Option<String>,
    #[serde(default)]
    pub proxy_media: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_url(),
            auth_token: String::new(),
            user_id: String::new(),
            platform: default_platform(),
            http_base: None,
            proxy_media: false,
            heartbeat_secs: default_heartbeat(),
        }
    }
}

impl fmt::Debug for GatewaySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySection")
            .field("url", &self.url)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("http_base", &self.http_base)
            .field("proxy_media", &self.proxy_media)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish_non_exhaustive()
    }
}

/// `[wecom]` section. Every field is optional: application credentials
/// enable direct media, callback secrets enable raw mode.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct WeComSection {
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: String,
    pub api_base: Option<String>,
    pub token: String,
    pub encoding_aes_key: String,
}

impl fmt::Debug for WeComSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeComSection")
            .field("corp_id", &self.corp_id)
            .field("agent_id", &self.agent_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// `[agent]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// HTTP endpoint messages are POSTed to. Unset means echo mode.
    pub url: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_agent_timeout(),
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_platform() -> String {
    "wecom".to_string()
}
fn default_heartbeat() -> u64 {
    5
}
fn default_agent_timeout() -> u64 {
    120
}

/// Default config location.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".chatrelay")
        .join("client.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Connection settings for the relay client.
    pub fn connect_config(&self) -> Result<ConnectConfig> {
        let gw = &self.gateway;
        if !gw.url.starts_with("ws://") && !gw.url.starts_with("wss://") {
            anyhow::bail!("gateway.url must start with ws:// or wss://, got '{}'", gw.url);
        }
        if gw.heartbeat_secs == 0 {
            anyhow::bail!("gateway.heartbeat_secs must be at least 1");
        }

        let mut config = ConnectConfig {
            url: gw.url.clone(),
            auth_token: gw.auth_token.clone(),
            platform: gw.platform.clone(),
            http_base: gw.http_base.clone(),
            proxy_media: gw.proxy_media,
            crypto: self.crypto()?,
            heartbeat_interval: Duration::from_secs(gw.heartbeat_secs),
            ..Default::default()
        };
        if !gw.user_id.is_empty() {
            config.user_id = gw.user_id.clone();
        }
        Ok(config)
    }

    /// Webhook crypto for raw relay mode, when the secrets are configured.
    pub fn crypto(&self) -> Result<Option<WebhookCrypto>> {
        let Some(wecom) = &self.wecom else {
            return Ok(None);
        };
        if wecom.encoding_aes_key.is_empty() {
            return Ok(None);
        }
        WebhookCrypto::new(&wecom.token, &wecom.encoding_aes_key, &wecom.corp_id)
            .map(Some)
            .context("invalid [wecom] callback secrets")
    }

    /// Direct platform access, when application credentials are configured.
    pub fn platform(&self) -> Result<Option<WeComApi>> {
        let Some(wecom) = &self.wecom else {
            return Ok(None);
        };
        if wecom.corp_secret.is_empty() {
            return Ok(None);
        }
        let api = WeComApi::new(WeComConfig {
            corp_id: wecom.corp_id.clone(),
            corp_secret: wecom.corp_secret.clone(),
            agent_id: wecom.agent_id.clone(),
            api_base: wecom
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
        .context("invalid [wecom] credentials")?;
        Ok(Some(api))
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse("");
        let connect = cfg.connect_config().unwrap();
        assert_eq!(connect.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(connect.platform, "wecom");
        assert_eq!(connect.heartbeat_interval, Duration::from_secs(5));
        assert!(!connect.user_id.is_empty());
        assert!(connect.crypto.is_none());
        assert!(cfg.platform().unwrap().is_none());
        assert!(cfg.agent.url.is_none());
    }

    #[test]
    fn full_file_maps_onto_connect_config() {
        let cfg = parse(&format!(
            r#"
[gateway]
url = "wss://relay.example.com/ws"
auth_token = "s3cret"
user_id = "bot"
proxy_media = true
heartbeat_secs = 10

[wecom]
corp_id = "wwcorp"
corp_secret = "app-secret"
agent_id = "1000002"
token = "cbtoken"
encoding_aes_key = "{KEY}"

[agent]
url = "http://127.0.0.1:9000/chat"
timeout_secs = 30
"#
        ));
        let connect = cfg.connect_config().unwrap();
        assert_eq!(connect.url, "wss://relay.example.com/ws");
        assert_eq!(connect.auth_token, "s3cret");
        assert_eq!(connect.user_id, "bot");
        assert!(connect.proxy_media);
        assert_eq!(connect.http_base(), "https://relay.example.com");
        assert_eq!(connect.crypto.unwrap().receive_id(), "wwcorp");
        assert!(cfg.platform().unwrap().is_some());
        assert_eq!(cfg.agent.timeout_secs, 30);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse("[gateway]\nurl = \"http://x\"").connect_config().is_err());
        assert!(parse("[gateway]\nheartbeat_secs = 0").connect_config().is_err());
        let bad_key = parse("[wecom]\nencoding_aes_key = \"short\"");
        assert!(bad_key.connect_config().is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let cfg = parse("[gateway]\nauth_token = \"s3cret\"\n[wecom]\ncorp_secret = \"app-secret\"");
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("s3cret"));
        assert!(!dbg.contains("app-secret"));
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.gateway.url, default_url());
    }
}
