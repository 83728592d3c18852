//! WeCom application API client.

use crate::text::{split_text, MAX_TEXT_BYTES};
use crate::PlatformApi;
use async_trait::async_trait;
use chatrelay_core::{MediaAsset, MediaKind, RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://qyapi.weixin.qq.com";

/// Errcodes meaning the access token is invalid or expired.
const TOKEN_EXPIRED: [i64; 2] = [40014, 42001];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct WeComConfig {
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl fmt::Debug for WeComConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeComConfig")
            .field("corp_id", &self.corp_id)
            .field("agent_id", &self.agent_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        let refresh_skew = Duration::from_secs(60);
        self.expires_at > Instant::now() + refresh_skew
    }
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(flatten)]
    status: ApiStatus,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(flatten)]
    status: ApiStatus,
    #[serde(default)]
    media_id: String,
}

/// A successful API reply with its body read.
struct Reply {
    content_type: Option<String>,
    disposition: Option<String>,
    body: Vec<u8>,
}

enum Call {
    Done(Reply),
    TokenExpired,
}

/// HTTP client for one WeCom application.
pub struct WeComApi {
    config: WeComConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl WeComApi {
    pub fn new(config: WeComConfig) -> RelayResult<Self> {
        if config.corp_id.is_empty() || config.corp_secret.is_empty() {
            return Err(RelayError::Config(
                "wecom corp_id and corp_secret are required".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/cgi-bin/{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn access_token(&self) -> RelayResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.is_valid() {
                return Ok(cached.token.clone());
            }
        }

        debug!(corp_id = %self.config.corp_id, "fetching access token");
        let resp = self
            .http
            .get(self.url("gettoken"))
            .query(&[
                ("corpid", self.config.corp_id.as_str()),
                ("corpsecret", self.config.corp_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;
        let body: TokenResponse = parse_json(resp).await?;
        if body.status.errcode != 0 || body.access_token.is_empty() {
            return Err(RelayError::Downstream(format!(
                "gettoken failed ({}): {}",
                body.status.errcode, body.status.errmsg
            )));
        }

        let ttl = if body.expires_in == 0 { 7200 } else { body.expires_in }.max(120);
        let token = body.access_token;
        *guard = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Run `request` with a fresh token, retrying once with a new token when
    /// the platform reports the cached one as expired.
    async fn with_token<F>(&self, request: F) -> RelayResult<Reply>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        for attempt in 0..2 {
            let token = self.access_token().await?;
            match self.call(request(&token)).await? {
                Call::Done(resp) => return Ok(resp),
                Call::TokenExpired if attempt == 0 => {
                    warn!("access token rejected, refreshing");
                    self.invalidate_token().await;
                }
                Call::TokenExpired => {}
            }
        }
        Err(RelayError::Downstream("access token rejected twice".into()))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> RelayResult<Call> {
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Downstream(format!("wecom api ({status}): {body}")));
        }
        let content_type = header(&resp, reqwest::header::CONTENT_TYPE);
        let disposition = header(&resp, reqwest::header::CONTENT_DISPOSITION);
        let body = resp.bytes().await.map_err(transport)?.to_vec();

        let json = content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("json") || ct.starts_with("text/plain"));
        if json {
            let api: ApiStatus = serde_json::from_slice(&body).map_err(bad_json)?;
            if TOKEN_EXPIRED.contains(&api.errcode) {
                return Ok(Call::TokenExpired);
            }
            if api.errcode != 0 {
                return Err(RelayError::Downstream(format!(
                    "wecom api error {}: {}",
                    api.errcode, api.errmsg
                )));
            }
        }
        Ok(Call::Done(Reply {
            content_type,
            disposition,
            body,
        }))
    }

    async fn send_message(&self, payload: serde_json::Value) -> RelayResult<()> {
        self.with_token(|token| {
            self.http
                .post(self.url("message/send"))
                .query(&[("access_token", token)])
                .json(&payload)
        })
        .await?;
        Ok(())
    }

    fn agent_id(&self) -> serde_json::Value {
        match self.config.agent_id.parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => json!(self.config.agent_id),
        }
    }
}

#[async_trait]
impl PlatformApi for WeComApi {
    fn name(&self) -> &str {
        "wecom"
    }

    async fn send_text(&self, to_user: &str, text: &str) -> RelayResult<()> {
        for chunk in split_text(text, MAX_TEXT_BYTES) {
            self.send_message(json!({
                "touser": to_user,
                "msgtype": "text",
                "agentid": self.agent_id(),
                "text": { "content": chunk },
            }))
            .await?;
        }
        debug!(to_user, bytes = text.len(), "text sent");
        Ok(())
    }

    async fn send_media(&self, to_user: &str, kind: MediaKind, media_id: &str) -> RelayResult<()> {
        let msgtype = kind.as_str();
        let mut payload = json!({
            "touser": to_user,
            "msgtype": msgtype,
            "agentid": self.agent_id(),
        });
        payload[msgtype] = json!({ "media_id": media_id });
        self.send_message(payload).await?;
        debug!(to_user, %kind, media_id, "media sent");
        Ok(())
    }

    async fn upload_media(
        &self,
        kind: MediaKind,
        filename: &str,
        bytes: Vec<u8>,
    ) -> RelayResult<String> {
        let size = bytes.len();
        let reply = self
            .with_token(|token| {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(filename.to_string());
                self.http
                    .post(self.url("media/upload"))
                    .query(&[("access_token", token), ("type", kind.as_str())])
                    .multipart(reqwest::multipart::Form::new().part("media", part))
            })
            .await?;
        let body: UploadResponse = serde_json::from_slice(&reply.body).map_err(bad_json)?;
        if body.media_id.is_empty() {
            return Err(RelayError::Downstream(format!(
                "upload returned no media_id ({}): {}",
                body.status.errcode, body.status.errmsg
            )));
        }
        debug!(%kind, filename, size, media_id = %body.media_id, "media uploaded");
        Ok(body.media_id)
    }

    async fn download_media(&self, media_id: &str) -> RelayResult<MediaAsset> {
        let reply = self
            .with_token(|token| {
                self.http
                    .get(self.url("media/get"))
                    .query(&[("access_token", token), ("media_id", media_id)])
            })
            .await?;

        let content_type = reply
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = reply
            .disposition
            .as_deref()
            .and_then(disposition_filename)
            .unwrap_or_else(|| media_id.to_string());
        Ok(MediaAsset {
            kind: kind_from_content_type(&content_type, &filename),
            filename,
            content_type,
            bytes: reply.body,
        })
    }
}

fn transport(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::Transport(e.to_string())
    }
}

fn header(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn parse_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> RelayResult<T> {
    let bytes = resp.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(bad_json)
}

fn bad_json(e: serde_json::Error) -> RelayError {
    RelayError::Downstream(format!("wecom api returned bad json: {e}"))
}

/// Extract `filename` from a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let name = part.strip_prefix("filename=")?;
        let name = name.trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

fn kind_from_content_type(content_type: &str, filename: &str) -> MediaKind {
    match content_type.split('/').next() {
        Some("image") => MediaKind::Image,
        Some("audio") => MediaKind::Voice,
        Some("video") => MediaKind::Video,
        _ => MediaKind::from_filename(filename),
    }
}
