//! HTTP side channels for the connected client: push-callback, media proxy
//! and health. Everything except health requires the live session id in
//! `X-Session-ID`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatrelay_core::messages::{MEDIA_FILENAME_HEADER, SESSION_HEADER};
use chatrelay_core::{ErrorKind, MediaKind, OutgoingResponse, RelayError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::server::Gateway;

/// Check `X-Session-ID` against the live session.
async fn authorize(gateway: &Gateway, headers: &HeaderMap) -> Result<(), Response> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !session_id.is_empty() && gateway.registry().is_current(session_id).await {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "unknown session" }))).into_response())
    }
}

fn failure(e: &RelayError) -> Response {
    let status = match e.kind() {
        ErrorKind::Protocol | ErrorKind::Parse => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// `POST /callback/response`.
pub async fn callback_response(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(response): Json<OutgoingResponse>,
) -> Response {
    if let Err(denied) = authorize(&gateway, &headers).await {
        return denied;
    }
    match gateway.relay_response(&response).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => {
            warn!(channel_id = %response.channel_id, error = %e, "callback relay failed");
            failure(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub kind: String,
    pub filename: String,
}

/// `POST /media/upload?kind=&filename=`, body = file bytes.
pub async fn upload_media(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&gateway, &headers).await {
        return denied;
    }
    let kind: MediaKind = match query.kind.parse() {
        Ok(kind) => kind,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    };
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "empty upload" }))).into_response();
    }

    let size = body.len();
    match gateway
        .platform()
        .upload_media(kind, &query.filename, body.to_vec())
        .await
    {
        Ok(media_id) => {
            debug!(kind = %kind, filename = %query.filename, size, "media uploaded via proxy");
            Json(json!({ "media_id": media_id })).into_response()
        }
        Err(e) => {
            warn!(filename = %query.filename, error = %e, "proxy upload failed");
            failure(&e)
        }
    }
}

/// `GET /media/{media_id}`.
pub async fn download_media(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(media_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&gateway, &headers).await {
        return denied;
    }
    match gateway.platform().download_media(&media_id).await {
        Ok(asset) => {
            let mut out = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&asset.content_type) {
                out.insert(CONTENT_TYPE, value);
            }
            if let Ok(value) = HeaderValue::from_str(&asset.filename) {
                out.insert(HeaderName::from_static(MEDIA_FILENAME_HEADER), value);
            }
            (out, asset.bytes).into_response()
        }
        Err(e) => {
            warn!(media_id = %media_id, error = %e, "proxy download failed");
            failure(&e)
        }
    }
}

/// `GET /health`.
pub async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let client = gateway.registry().current().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "relay_mode": gateway.relay_mode().to_string(),
        "client_connected": client.is_some(),
        "client_user": client.as_ref().map(|c| c.info().user_id.clone()),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use crate::server::tests::{connect_client, start, wait_for_registration, wait_until};
    use chatrelay_core::messages::{MEDIA_FILENAME_HEADER, SESSION_HEADER};
    use chatrelay_core::OutgoingResponse;

    #[tokio::test]
    async fn callback_requires_live_session() {
        let h = start("").await;
        let (_ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;

        let http = reqwest::Client::new();
        let url = format!("http://{}/callback/response", h.addr);
        let body = OutgoingResponse {
            channel_id: "zhangsan".into(),
            text: "done".into(),
            ..Default::default()
        };

        let denied = http
            .post(&url)
            .header(SESSION_HEADER, "agent-0-deadbeef")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status().as_u16(), 401);

        let ok = http
            .post(&url)
            .header(SESSION_HEADER, &auth.session_id)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status().as_u16(), 200);
        wait_until(|| !h.platform.texts().is_empty()).await;
        assert_eq!(h.platform.texts(), vec![("zhangsan".into(), "done".into())]);
    }

    #[tokio::test]
    async fn callback_without_channel_is_bad_request() {
        let h = start("").await;
        let (_ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/callback/response", h.addr))
            .header(SESSION_HEADER, &auth.session_id)
            .json(&OutgoingResponse {
                text: "orphan".into(),
                ..Default::default()
            })
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn media_proxy_round_trip() {
        let h = start("").await;
        let (_ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;
        let http = reqwest::Client::new();

        let upload: serde_json::Value = http
            .post(format!("http://{}/media/upload", h.addr))
            .query(&[("kind", "image"), ("filename", "chart.png")])
            .header(SESSION_HEADER, &auth.session_id)
            .body(vec![1u8; 12])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(upload["media_id"], "image-chart.png-12");

        let download = http
            .get(format!("http://{}/media/MEDIA9", h.addr))
            .header(SESSION_HEADER, &auth.session_id)
            .send()
            .await
            .unwrap();
        assert_eq!(download.status().as_u16(), 200);
        assert_eq!(download.headers()["content-type"], "application/pdf");
        assert_eq!(download.headers()[MEDIA_FILENAME_HEADER], "report.pdf");
        assert_eq!(download.bytes().await.unwrap().as_ref(), b"bytes of MEDIA9");

        let missing = http
            .get(format!("http://{}/media/missing", h.addr))
            .header(SESSION_HEADER, &auth.session_id)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 502);

        let bad_kind = http
            .post(format!("http://{}/media/upload", h.addr))
            .query(&[("kind", "sticker"), ("filename", "x")])
            .header(SESSION_HEADER, &auth.session_id)
            .body(vec![1u8])
            .send()
            .await
            .unwrap();
        assert_eq!(bad_kind.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn media_proxy_requires_session() {
        let h = start("").await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/media/MEDIA9", h.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn health_reports_client() {
        let h = start("").await;
        let url = format!("http://{}/health", h.addr);

        let before: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(before["status"], "ok");
        assert_eq!(before["client_connected"], false);
        assert_eq!(before["relay_mode"], "decrypted");

        let (_ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;
        let after: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(after["client_connected"], true);
        assert_eq!(after["client_user"], "agent");
    }
}
