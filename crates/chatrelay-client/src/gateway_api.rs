//! HTTP side channels on the gateway: the push-callback and the media proxy.

use chatrelay_core::messages::{MEDIA_FILENAME_HEADER, SESSION_HEADER};
use chatrelay_core::{MediaAsset, MediaKind, OutgoingResponse, RelayError, RelayResult};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct UploadReply {
    media_id: String,
}

/// Gateway HTTP client bound to one session.
#[derive(Clone)]
pub struct GatewayApi {
    http: reqwest::Client,
    base: String,
    session_id: String,
}

impl GatewayApi {
    pub fn new(http: reqwest::Client, base: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
            session_id: session_id.into(),
        }
    }

    /// `POST /callback/response`.
    pub async fn post_response(&self, response: &OutgoingResponse) -> RelayResult<()> {
        let resp = self
            .http
            .post(format!("{}/callback/response", self.base))
            .header(SESSION_HEADER, &self.session_id)
            .timeout(REQUEST_TIMEOUT)
            .json(response)
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }

    /// `POST /media/upload?kind=&filename=` with the raw bytes as body.
    pub async fn upload_media(
        &self,
        kind: MediaKind,
        filename: &str,
        bytes: Vec<u8>,
    ) -> RelayResult<String> {
        let resp = self
            .http
            .post(format!("{}/media/upload", self.base))
            .query(&[("kind", kind.as_str()), ("filename", filename)])
            .header(SESSION_HEADER, &self.session_id)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(REQUEST_TIMEOUT)
            .body(bytes)
            .send()
            .await
            .map_err(transport)?;
        let reply: UploadReply = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::Protocol(format!("media upload reply: {e}")))?;
        Ok(reply.media_id)
    }

    /// `GET /media/{media_id}`.
    pub async fn download_media(&self, kind: MediaKind, media_id: &str) -> RelayResult<MediaAsset> {
        let resp = self
            .http
            .get(format!("{}/media/{media_id}", self.base))
            .header(SESSION_HEADER, &self.session_id)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let resp = check(resp).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = resp
            .headers()
            .get(MEDIA_FILENAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(media_id)
            .to_string();
        let bytes = resp.bytes().await.map_err(transport)?.to_vec();
        Ok(MediaAsset {
            kind,
            filename,
            content_type,
            bytes,
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

async fn check(resp: reqwest::Response) -> RelayResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RelayError::Auth(format!("gateway refused session ({status}): {body}"))
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RelayError::Transport(format!("gateway unavailable ({status}): {body}"))
        }
        _ => RelayError::Downstream(format!("gateway returned {status}: {body}")),
    })
}
