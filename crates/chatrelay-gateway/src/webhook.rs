//! WeCom callback endpoint.
//!
//! GET answers the URL-verification challenge. POST acknowledges with
//! `success` as soon as the envelope is verified; forwarding to the client
//! or the fallback reply happens in the background, so platform retries are
//! never triggered by a slow or absent client.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatrelay_core::{EncryptedEnvelope, ErrorKind, RelayError};
use serde::Deserialize;
use tracing::{error, warn};

use crate::server::Gateway;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallbackQuery {
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub echostr: Option<String>,
}

/// `GET /webhook/wecom`: decrypt `echostr` and echo the plaintext.
pub async fn verify_url(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(echostr) = query.echostr.filter(|e| !e.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing echostr").into_response();
    };
    match gateway
        .crypto()
        .verify_url(&query.msg_signature, &query.timestamp, &query.nonce, &echostr)
    {
        Ok(plain) => plain.into_response(),
        Err(e) => rejection(e),
    }
}

/// `POST /webhook/wecom`: message delivery.
pub async fn receive(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    let envelope = match EncryptedEnvelope::from_callback(
        &query.msg_signature,
        &query.timestamp,
        &query.nonce,
        &body,
    ) {
        Ok(envelope) => envelope,
        Err(e) => return rejection(e),
    };
    match gateway.ingest(envelope).await {
        Ok(()) => "success".into_response(),
        Err(e) => rejection(e),
    }
}

fn rejection(e: RelayError) -> Response {
    match e.kind() {
        ErrorKind::Integrity => {
            warn!(error = %e, "webhook integrity check failed, possible forgery");
            (StatusCode::FORBIDDEN, "forbidden").into_response()
        }
        ErrorKind::Parse => {
            warn!(error = %e, "malformed webhook request");
            (StatusCode::BAD_REQUEST, "bad request").into_response()
        }
        _ => {
            // Acknowledged so the platform does not retry into the same fault.
            error!(error = %e, "webhook handling failed");
            "success".into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::server::tests::{
        connect_client, next_frame, start, wait_for_registration, wait_until, Harness,
    };
    use crate::registry::{FrameWriter, SessionHandle, SessionInfo};
    use async_trait::async_trait;
    use chatrelay_core::{EncryptedEnvelope, Frame, ReceivedMessage, RelayError, RelayResult};
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn text_message(msg_id: &str, from: &str, content: &str) -> ReceivedMessage {
        ReceivedMessage {
            to_user: "wwcorp".into(),
            from_user: from.into(),
            create_time: "1700000000".into(),
            msg_type: "text".into(),
            content: content.into(),
            msg_id: msg_id.into(),
            agent_id: "1000002".into(),
            ..Default::default()
        }
    }

    fn seal(h: &Harness, msg: &ReceivedMessage) -> EncryptedEnvelope {
        h.gateway
            .crypto()
            .encrypt(msg.to_xml().as_bytes(), "1700000000", "nonce42")
            .unwrap()
    }

    fn callback_body(envelope: &EncryptedEnvelope) -> String {
        format!(
            "<xml><ToUserName><![CDATA[wwcorp]]></ToUserName><Encrypt><![CDATA[{}]]></Encrypt>\
             <AgentID><![CDATA[1000002]]></AgentID></xml>",
            envelope.encrypt
        )
    }

    async fn post(h: &Harness, envelope: &EncryptedEnvelope) -> (u16, String) {
        let resp = reqwest::Client::new()
            .post(format!("http://{}/webhook/wecom", h.addr))
            .query(&[
                ("msg_signature", envelope.signature.as_str()),
                ("timestamp", envelope.timestamp.as_str()),
                ("nonce", envelope.nonce.as_str()),
            ])
            .body(callback_body(envelope))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn url_verification_echoes_plaintext() {
        let h = start("").await;
        let challenge = h
            .gateway
            .crypto()
            .encrypt(b"echo-1234", "1700000000", "n1")
            .unwrap();

        let url = format!("http://{}/webhook/wecom", h.addr);
        let resp = reqwest::Client::new()
            .get(&url)
            .query(&[
                ("msg_signature", challenge.signature.as_str()),
                ("timestamp", "1700000000"),
                ("nonce", "n1"),
                ("echostr", challenge.encrypt.as_str()),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "echo-1234");

        let forged = reqwest::Client::new()
            .get(&url)
            .query(&[
                ("msg_signature", "0000"),
                ("timestamp", "1700000000"),
                ("nonce", "n1"),
                ("echostr", challenge.encrypt.as_str()),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(forged.status().as_u16(), 403);
    }

    #[tokio::test]
    async fn text_is_forwarded_to_connected_client() {
        let h = start("").await;
        let (mut ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;

        let envelope = seal(&h, &text_message("1001", "zhangsan", "hello agent"));
        assert_eq!(post(&h, &envelope).await, (200, "success".to_string()));

        match next_frame(&mut ws).await {
            Some(Frame::Message(msg)) => {
                assert_eq!(msg.id, "1001");
                assert_eq!(msg.text, "hello agent");
                assert_eq!(msg.channel_id, "zhangsan");
                assert_eq!(msg.platform, "wecom");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
        assert!(h.platform.texts().is_empty());
    }

    #[tokio::test]
    async fn no_client_gets_fallback_reply() {
        let h = start("").await;
        let envelope = seal(&h, &text_message("1002", "lisi", "anyone there?"));

        assert_eq!(post(&h, &envelope).await, (200, "success".to_string()));
        wait_until(|| !h.platform.texts().is_empty()).await;

        let texts = h.platform.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].0, "lisi");
        assert!(texts[0].1.contains("offline"));
    }

    #[tokio::test]
    async fn forged_signature_is_rejected() {
        let h = start("").await;
        let mut envelope = seal(&h, &text_message("1003", "lisi", "hi"));
        envelope.signature = "f".repeat(40);

        let (status, _) = post(&h, &envelope).await;
        assert_eq!(status, 403);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.platform.texts().is_empty());
    }

    #[tokio::test]
    async fn corrupted_ciphertext_is_rejected() {
        let h = start("").await;
        let mut envelope = seal(&h, &text_message("1004", "lisi", "hi"));
        // Flip a character in the last cipher block and re-sign, so only the
        // padding and receive-id checks can catch it.
        let mut bytes = envelope.encrypt.into_bytes();
        let at = bytes.len() - 5;
        bytes[at] = if bytes[at] == b'A' { b'B' } else { b'A' };
        envelope.encrypt = String::from_utf8(bytes).unwrap();
        envelope.signature = h.gateway.crypto().signature(
            &envelope.timestamp,
            &envelope.nonce,
            &envelope.encrypt,
        );

        let (status, _) = post(&h, &envelope).await;
        assert_eq!(status, 403);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let h = start("").await;
        let resp = reqwest::Client::new()
            .post(format!(
                "http://{}/webhook/wecom?msg_signature=a&timestamp=1&nonce=2",
                h.addr
            ))
            .body("<xml><ToUserName>x</ToUserName></xml>")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn retried_msg_id_is_dropped() {
        let h = start("").await;
        let envelope = seal(&h, &text_message("1005", "wangwu", "once"));

        assert_eq!(post(&h, &envelope).await.0, 200);
        assert_eq!(post(&h, &envelope).await.0, 200);
        wait_until(|| !h.platform.texts().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.platform.texts().len(), 1);
    }

    #[tokio::test]
    async fn events_and_media_are_dropped_in_decrypted_mode() {
        let h = start("").await;
        let event = ReceivedMessage {
            msg_type: "event".into(),
            event: "enter_agent".into(),
            from_user: "lisi".into(),
            ..Default::default()
        };
        let image = ReceivedMessage {
            msg_type: "image".into(),
            media_id: "MEDIA1".into(),
            msg_id: "1006".into(),
            from_user: "lisi".into(),
            ..Default::default()
        };
        assert_eq!(post(&h, &seal(&h, &event)).await.0, 200);
        assert_eq!(post(&h, &seal(&h, &image)).await.0, 200);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.platform.texts().is_empty());
    }

    #[tokio::test]
    async fn raw_mode_forwards_envelope() {
        let h = start("relay_mode = \"raw\"").await;
        let (mut ws, auth) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &auth.session_id).await;

        let image = ReceivedMessage {
            msg_type: "image".into(),
            media_id: "MEDIA1".into(),
            msg_id: "1007".into(),
            from_user: "lisi".into(),
            ..Default::default()
        };
        let envelope = seal(&h, &image);
        assert_eq!(post(&h, &envelope).await.0, 200);

        match next_frame(&mut ws).await {
            Some(Frame::Raw(raw)) => {
                assert_eq!(raw, envelope);
                let plain = h.gateway.crypto().decrypt(&raw).unwrap();
                let inner = ReceivedMessage::from_bytes(&plain).unwrap();
                assert_eq!(inner.media_id, "MEDIA1");
            }
            other => panic!("expected raw frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn raw_mode_fallback_decrypts_sender() {
        let h = start("relay_mode = \"raw\"").await;
        let envelope = seal(&h, &text_message("1008", "zhaoliu", "ping?"));

        assert_eq!(post(&h, &envelope).await.0, 200);
        wait_until(|| !h.platform.texts().is_empty()).await;
        assert_eq!(h.platform.texts()[0].0, "zhaoliu");
    }

    /// Writer whose socket is already gone.
    struct Broken;

    #[async_trait]
    impl FrameWriter for Broken {
        async fn send_text(&mut self, _text: String) -> RelayResult<()> {
            Err(RelayError::Transport("connection reset".into()))
        }

        async fn close(&mut self, _code: u16, _reason: &str) {}
    }

    /// Writer whose peer stopped reading.
    struct Stuck;

    #[async_trait]
    impl FrameWriter for Stuck {
        async fn send_text(&mut self, _text: String) -> RelayResult<()> {
            std::future::pending().await
        }

        async fn close(&mut self, _code: u16, _reason: &str) {}
    }

    async fn install(h: &Harness, writer: Box<dyn FrameWriter>) {
        let handle = SessionHandle::new(
            SessionInfo {
                session_id: "agent-1-deadbeef".into(),
                user_id: "agent".into(),
                platform: "wecom".into(),
                client_version: "test".into(),
            },
            writer,
            CancellationToken::new(),
        );
        h.gateway.registry().register(handle).await;
    }

    #[tokio::test]
    async fn failed_write_to_client_falls_back() {
        let h = start("forward_timeout_secs = 1").await;
        install(&h, Box::new(Broken)).await;

        let envelope = seal(&h, &text_message("1009", "lisi", "are you there?"));
        assert_eq!(post(&h, &envelope).await, (200, "success".to_string()));
        wait_until(|| !h.platform.texts().is_empty()).await;

        let texts = h.platform.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].0, "lisi");
        assert!(texts[0].1.contains("offline"));
    }

    #[tokio::test]
    async fn write_timeout_falls_back_after_webhook_returns() {
        let h = start("forward_timeout_secs = 1").await;
        install(&h, Box::new(Stuck)).await;

        let envelope = seal(&h, &text_message("1010", "lisi", "hello?"));
        let started = Instant::now();
        assert_eq!(post(&h, &envelope).await, (200, "success".to_string()));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(h.platform.texts().is_empty());

        wait_until(|| !h.platform.texts().is_empty()).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(h.platform.texts()[0].0, "lisi");
    }
}
