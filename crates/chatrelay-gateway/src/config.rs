//! Gateway configuration: TOML file + CLI overrides.

use anyhow::{bail, Context};
use chatrelay_core::{RelayResult, WebhookCrypto};
use chatrelay_platform::{WeComConfig, DEFAULT_API_BASE};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// What the gateway forwards to the client for a webhook delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Decrypt on the gateway and forward `message` frames.
    #[default]
    Decrypted,
    /// Verify the signature only and forward the envelope as a `raw` frame.
    Raw,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayMode::Decrypted => "decrypted",
            RelayMode::Raw => "raw",
        })
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    pub wecom: Option<WeComSection>,
    #[serde(default)]
    pub fallback: FallbackSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret clients present in the auth handshake. Empty disables
    /// the check.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub relay_mode: RelayMode,
    /// Connection attempts allowed per remote IP per minute.
    #[serde(default = "default_auth_rate_limit")]
    pub auth_rate_limit: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth_token: String::new(),
            forward_timeout_secs: default_forward_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            relay_mode: RelayMode::default(),
            auth_rate_limit: default_auth_rate_limit(),
        }
    }
}

/// `[wecom]` section: application credentials plus the callback secrets.
#[derive(Clone, Deserialize)]
pub struct WeComSection {
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: String,
    /// Callback verification token.
    pub token: String,
    /// 43-character callback `EncodingAESKey`.
    pub encoding_aes_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
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

impl WeComSection {
    pub fn api_config(&self) -> WeComConfig {
        WeComConfig {
            corp_id: self.corp_id.clone(),
            corp_secret: self.corp_secret.clone(),
            agent_id: self.agent_id.clone(),
            api_base: self.api_base.clone(),
        }
    }

    pub fn crypto(&self) -> RelayResult<WebhookCrypto> {
        WebhookCrypto::new(&self.token, &self.encoding_aes_key, &self.corp_id)
    }
}

/// `[fallback]` section: what users hear while no client is connected.
#[derive(Clone, Deserialize)]
pub struct FallbackSection {
    #[serde(default = "default_fallback_text")]
    pub text: String,
    /// Base URL of an OpenAI-compatible API (`https://api.openai.com/v1`).
    /// When set, offline replies are generated by the model and `text` is
    /// only used if that fails.
    pub model_endpoint: Option<String>,
    pub model_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            text: default_fallback_text(),
            model_endpoint: None,
            model_api_key: None,
            model: default_model(),
        }
    }
}

impl fmt::Debug for FallbackSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackSection")
            .field("text", &self.text)
            .field("model_endpoint", &self.model_endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_forward_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    90
}
fn default_auth_rate_limit() -> u32 {
    5
}
fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}
fn default_fallback_text() -> String {
    "The assistant is offline right now. Please try again later.".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// CLI values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub relay_mode: Option<RelayMode>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub forward_timeout: Duration,
    pub idle_timeout: Duration,
    pub relay_mode: RelayMode,
    pub auth_rate_limit: u32,
    pub wecom: WeComSection,
    pub fallback: FallbackSection,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(path: &Path, overrides: &Overrides) -> anyhow::Result<Self> {
        let expanded = expand_tilde(path);
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)
                .with_context(|| format!("cannot read {}", expanded.display()))?;
            parse(&content).with_context(|| format!("invalid config {}", expanded.display()))?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        Self::resolve(file, overrides)
    }

    pub fn from_toml(content: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        Self::resolve(parse(content)?, overrides)
    }

    fn resolve(file: ConfigFile, overrides: &Overrides) -> anyhow::Result<Self> {
        let Some(wecom) = file.wecom else {
            bail!("missing [wecom] section: corp_id, corp_secret, agent_id, token and encoding_aes_key are required");
        };
        wecom.crypto().context("invalid [wecom] callback secrets")?;

        let server = file.server;
        let auth_token = Some(server.auth_token).filter(|t| !t.is_empty());
        Ok(Self {
            bind: overrides.bind.clone().unwrap_or(server.bind),
            port: overrides.port.unwrap_or(server.port),
            auth_token,
            forward_timeout: Duration::from_secs(server.forward_timeout_secs),
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            relay_mode: overrides.relay_mode.unwrap_or(server.relay_mode),
            auth_rate_limit: server.auth_rate_limit.max(1),
            wecom,
            fallback: file.fallback,
        })
    }
}

fn parse(content: &str) -> anyhow::Result<ConfigFile> {
    toml::from_str(content).context("config parse error")
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
