//! Gateway core: shared state, the client channel and the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chatrelay_core::messages::{CLOSE_AUTH_REJECTED, CLOSE_NORMAL};
use chatrelay_core::{
    constant_time_eq, decode_frame, encode_frame, generate_session_id, AuthHandshake, AuthResult,
    EncryptedEnvelope, Frame, IncomingMessage, OutgoingResponse, ReceivedMessage, RelayError,
    RelayResult, WebhookCrypto,
};
use chatrelay_platform::PlatformApi;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, RelayMode};
use crate::dedup::DedupCache;
use crate::fallback::Fallback;
use crate::rate_limit::RateLimiter;
use crate::registry::{FrameWriter, SessionHandle, SessionInfo, SessionRegistry};
use crate::{api, webhook};

/// How long a new connection may take to send its auth frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Largest body accepted by the media proxy upload.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
/// Responses queued per session before the receive loop waits.
const RELAY_QUEUE: usize = 64;

/// Inbound webhook delivery on its way to the client.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(IncomingMessage),
    Raw(EncryptedEnvelope),
}

/// Result of a write to the client.
#[derive(Debug, PartialEq, Eq)]
pub enum Forward {
    Delivered { session_id: String },
    /// No session, write timeout or closed socket.
    Unreachable(String),
}

pub struct Gateway {
    config: GatewayConfig,
    crypto: WebhookCrypto,
    platform: Arc<dyn PlatformApi>,
    registry: SessionRegistry,
    fallback: Fallback,
    auth_limiter: Mutex<RateLimiter>,
    dedup: Mutex<DedupCache>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig, platform: Arc<dyn PlatformApi>) -> RelayResult<Arc<Self>> {
        let crypto = config.wecom.crypto()?;
        Ok(Arc::new(Self {
            crypto,
            platform,
            registry: SessionRegistry::new(),
            fallback: Fallback::new(&config.fallback),
            auth_limiter: Mutex::new(RateLimiter::new(config.auth_rate_limit, RATE_WINDOW)),
            dedup: Mutex::new(DedupCache::default()),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    pub fn crypto(&self) -> &WebhookCrypto {
        &self.crypto
    }

    pub fn platform(&self) -> &dyn PlatformApi {
        self.platform.as_ref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn relay_mode(&self) -> RelayMode {
        self.config.relay_mode
    }

    // ── Client channel ──────────────────────────────────────────────────

    /// Full lifecycle of one client connection: auth, register, receive
    /// loop, cleanup.
    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (sink, mut stream) = socket.split();
        let mut writer: Box<dyn FrameWriter> = Box::new(WsWriter { sink });

        let first = match tokio::time::timeout(AUTH_TIMEOUT, first_text(&mut stream)).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!(remote = %remote, "connection closed before auth");
                return;
            }
            Err(_) => {
                warn!(remote = %remote, "auth timeout");
                reject(writer.as_mut(), "auth timeout").await;
                return;
            }
        };

        let handshake = match check_handshake(decode_frame(&first), self.config.auth_token.as_deref())
        {
            Ok(handshake) => handshake,
            Err(reason) => {
                warn!(remote = %remote, reason, "auth rejected");
                reject(writer.as_mut(), reason).await;
                return;
            }
        };

        let session_id = generate_session_id(&handshake.user_id);
        match encode_frame(&Frame::AuthResult(AuthResult::accepted(&session_id))) {
            Ok(text) => {
                if let Err(e) = writer.send_text(text).await {
                    debug!(remote = %remote, error = %e, "client left during auth");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot encode auth result");
                return;
            }
        }

        let session = SessionHandle::new(
            SessionInfo {
                session_id: session_id.clone(),
                user_id: handshake.user_id,
                platform: handshake.platform,
                client_version: handshake.client_version,
            },
            writer,
            self.shutdown.child_token(),
        );
        self.registry.register(session.clone()).await;
        info!(
            session_id = %session_id,
            user_id = %session.info().user_id,
            platform = %session.info().platform,
            client_version = %session.info().client_version,
            remote = %remote,
            "client connected"
        );

        self.receive_loop(&session, stream).await;

        if self.registry.remove_if(&session_id).await {
            info!(session_id = %session_id, "client disconnected");
        } else {
            debug!(session_id = %session_id, "stale connection ended");
        }
    }

    /// Read frames until the socket closes or the session is cancelled.
    async fn receive_loop(self: &Arc<Self>, session: &SessionHandle, mut stream: SplitStream<WebSocket>) {
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE);
        let relay = tokio::spawn(Arc::clone(self).relay_worker(session.id().to_string(), relay_rx));
        let cancel = session.cancel_token().clone();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = session.id(), "session cancelled");
                    break;
                }
                next = stream.next() => next,
            };
            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    self.registry.touch(session.id()).await;
                    continue;
                }
                Some(Err(e)) => {
                    debug!(session_id = session.id(), error = %e, "read error");
                    break;
                }
            };
            self.registry.touch(session.id()).await;

            match decode_frame(text.as_str()) {
                Ok(Frame::Response(resp)) => {
                    if relay_tx.send(resp).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Ping(hb)) => {
                    if let Err(e) = session.send(&Frame::Pong(hb)).await {
                        debug!(session_id = session.id(), error = %e, "pong failed");
                        break;
                    }
                }
                Ok(Frame::Pong(_)) => {}
                Ok(Frame::Error(notice)) => {
                    warn!(session_id = session.id(), code = notice.code, message = %notice.message, "client reported error");
                }
                Ok(other) => {
                    warn!(session_id = session.id(), kind = other.kind(), "unexpected frame from client");
                }
                Err(e) => {
                    warn!(session_id = session.id(), error = %e, "dropping malformed frame");
                }
            }
        }

        // Responses already queued are still relayed.
        drop(relay_tx);
        let _ = relay.await;
    }

    /// Relays a session's `response` frames in arrival order.
    async fn relay_worker(self: Arc<Self>, session_id: String, mut rx: mpsc::Receiver<OutgoingResponse>) {
        while let Some(resp) = rx.recv().await {
            if let Err(e) = self.relay_response(&resp).await {
                warn!(session_id = %session_id, channel_id = %resp.channel_id, error = %e, "failed to relay response");
            }
        }
    }

    /// Deliver a client response on the platform: text first, then files.
    pub async fn relay_response(&self, resp: &OutgoingResponse) -> RelayResult<()> {
        if resp.channel_id.is_empty() {
            return Err(RelayError::Protocol("response has no channel_id".into()));
        }
        if !resp.text.trim().is_empty() {
            self.platform.send_text(&resp.channel_id, &resp.text).await?;
        }
        for file in &resp.files {
            match &file.media_id {
                Some(media_id) => {
                    self.platform
                        .send_media(&resp.channel_id, file.kind, media_id)
                        .await?
                }
                None => warn!(file = %file.name, "file without media_id skipped"),
            }
        }
        debug!(channel_id = %resp.channel_id, message_id = %resp.message_id, files = resp.files.len(), "response relayed");
        Ok(())
    }

    // ── Webhook delivery ────────────────────────────────────────────────

    /// Verify (and in decrypted mode, decrypt and classify) an envelope,
    /// then hand it to a background forward-or-fallback task.
    ///
    /// Errors are integrity or parse failures of the request itself.
    pub async fn ingest(self: &Arc<Self>, envelope: EncryptedEnvelope) -> RelayResult<()> {
        let inbound = match self.config.relay_mode {
            RelayMode::Raw => {
                self.crypto.verify_signature(
                    &envelope.signature,
                    &envelope.timestamp,
                    &envelope.nonce,
                    &envelope.encrypt,
                )?;
                if !self.dedup.lock().await.first_seen(&envelope.encrypt) {
                    debug!("duplicate delivery dropped");
                    return Ok(());
                }
                Inbound::Raw(envelope)
            }
            RelayMode::Decrypted => {
                let plain = self.crypto.decrypt(&envelope)?;
                let received = ReceivedMessage::from_bytes(&plain)?;
                if received.msg_type != "text" {
                    debug!(msg_type = %received.msg_type, event = %received.event, "dropping non-text message");
                    return Ok(());
                }
                if let Some(key) = received.dedup_key() {
                    if !self.dedup.lock().await.first_seen(&key) {
                        debug!(msg_id = %key, "duplicate delivery dropped");
                        return Ok(());
                    }
                }
                let Some(msg) = received.to_incoming(self.platform.name()) else {
                    return Ok(());
                };
                Inbound::Message(msg)
            }
        };

        tokio::spawn(Arc::clone(self).forward_or_fallback(inbound));
        Ok(())
    }

    async fn forward_or_fallback(self: Arc<Self>, inbound: Inbound) {
        let frame = match &inbound {
            Inbound::Message(msg) => Frame::Message(msg.clone()),
            Inbound::Raw(envelope) => Frame::Raw(envelope.clone()),
        };
        match self.forward_to_client(&frame).await {
            Forward::Delivered { session_id } => {
                debug!(session_id = %session_id, kind = frame.kind(), "forwarded to client");
            }
            Forward::Unreachable(reason) => {
                info!(reason = %reason, "client unreachable, sending fallback reply");
                let target = match inbound {
                    Inbound::Message(msg) => Some((msg.user_id, msg.text)),
                    Inbound::Raw(envelope) => self.sender_of(&envelope),
                };
                match target {
                    Some((user, text)) => self.fallback_reply(&user, &text).await,
                    None => debug!("no sender to reply to"),
                }
            }
        }
    }

    /// Write a frame to the live session under the forward deadline.
    pub async fn forward_to_client(&self, frame: &Frame) -> Forward {
        let Some(session) = self.registry.current().await else {
            return Forward::Unreachable("no client connected".into());
        };
        match tokio::time::timeout(self.config.forward_timeout, session.send(frame)).await {
            Ok(Ok(())) => Forward::Delivered {
                session_id: session.id().to_string(),
            },
            Ok(Err(e)) => Forward::Unreachable(e.to_string()),
            Err(_) => Forward::Unreachable("write timed out".into()),
        }
    }

    /// Sender and text of a raw envelope, decrypted only for the fallback.
    fn sender_of(&self, envelope: &EncryptedEnvelope) -> Option<(String, String)> {
        let plain = match self.crypto.decrypt(envelope) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(error = %e, "cannot decrypt envelope for fallback");
                return None;
            }
        };
        let msg = ReceivedMessage::from_bytes(&plain).ok()?.to_incoming(self.platform.name())?;
        Some((msg.user_id, msg.text))
    }

    /// Answer `user` on the platform while the client is away.
    pub async fn fallback_reply(&self, user: &str, text: &str) {
        let reply = self.fallback.reply_for(text).await;
        if let Err(e) = self.platform.send_text(user, &reply).await {
            warn!(user = %user, error = %e, "fallback reply failed");
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Evict an idle session and garbage-collect the caches.
    pub async fn sweep(&self) {
        if let Some(idle) = self.registry.take_idle(self.config.idle_timeout).await {
            warn!(session_id = idle.id(), "evicting idle session");
            idle.close(CLOSE_NORMAL, "idle timeout").await;
        }
        self.dedup.lock().await.gc();
        self.auth_limiter.lock().await.gc();
    }

    async fn sweep_loop(self: Arc<Self>) {
        let period = (self.config.idle_timeout / 3).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Close the live session with 1000 and stop all tasks.
    pub async fn shutdown(&self) {
        if let Some(session) = self.registry.take().await {
            info!(session_id = session.id(), "closing client session");
            session.close(CLOSE_NORMAL, "gateway shutting down").await;
        }
        self.shutdown.cancel();
    }
}

/// Build the HTTP surface.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/webhook/wecom", get(webhook::verify_url).post(webhook::receive))
        .route("/callback/response", post(api::callback_response))
        .route(
            "/media/upload",
            post(api::upload_media).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/media/{media_id}", get(api::download_media))
        .route("/health", get(api::health))
        .with_state(gateway)
}

/// Serve until [`Gateway::shutdown`] is called.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> std::io::Result<()> {
    let sweeper = tokio::spawn(Arc::clone(&gateway).sweep_loop());
    let shutdown = gateway.shutdown.clone();
    let app = router(gateway);

    let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    sweeper.abort();
    result
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    if !gateway.auth_limiter.lock().await.check_and_record(remote.ip()) {
        warn!(remote = %remote, "connection rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
    }
    ws.on_upgrade(move |socket| gateway.handle_socket(socket, remote))
}

/// Validate the first frame of a connection.
fn check_handshake(
    frame: RelayResult<Frame>,
    expected_token: Option<&str>,
) -> Result<AuthHandshake, &'static str> {
    let Ok(Frame::Auth(handshake)) = frame else {
        return Err("expected auth");
    };
    if let Some(expected) = expected_token {
        if !constant_time_eq(expected.as_bytes(), handshake.token.as_bytes()) {
            return Err("invalid token");
        }
    }
    if handshake.user_id.trim().is_empty() {
        return Err("missing user_id");
    }
    Ok(handshake)
}

async fn reject(writer: &mut dyn FrameWriter, reason: &str) {
    if let Ok(text) = encode_frame(&Frame::AuthResult(AuthResult::rejected(reason))) {
        let _ = writer.send_text(text).await;
    }
    writer.close(CLOSE_AUTH_REJECTED, reason).await;
}

async fn first_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> RelayResult<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RelayError::Transport(format!("WS send error: {e}")))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::config_toml;
    use crate::config::Overrides;
    use chatrelay_core::messages::CLOSE_SESSION_REPLACED;
    use chatrelay_core::{ErrorNotice, Heartbeat, MediaAsset, MediaKind};
    use std::sync::Mutex as StdMutex;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    /// Platform double that records what the gateway sends.
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        pub texts: StdMutex<Vec<(String, String)>>,
        pub media: StdMutex<Vec<(String, MediaKind, String)>>,
    }

    impl FakePlatform {
        pub fn texts(&self) -> Vec<(String, String)> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlatformApi for FakePlatform {
        fn name(&self) -> &str {
            "wecom"
        }

        async fn send_text(&self, to_user: &str, text: &str) -> RelayResult<()> {
            self.texts.lock().unwrap().push((to_user.into(), text.into()));
            Ok(())
        }

        async fn send_media(&self, to_user: &str, kind: MediaKind, media_id: &str) -> RelayResult<()> {
            self.media
                .lock()
                .unwrap()
                .push((to_user.into(), kind, media_id.into()));
            Ok(())
        }

        async fn upload_media(&self, kind: MediaKind, filename: &str, bytes: Vec<u8>) -> RelayResult<String> {
            Ok(format!("{kind}-{filename}-{}", bytes.len()))
        }

        async fn download_media(&self, media_id: &str) -> RelayResult<MediaAsset> {
            if media_id == "missing" {
                return Err(RelayError::Downstream("errcode 40007".into()));
            }
            Ok(MediaAsset {
                kind: MediaKind::File,
                filename: "report.pdf".into(),
                content_type: "application/pdf".into(),
                bytes: format!("bytes of {media_id}").into_bytes(),
            })
        }
    }

    pub(crate) struct Harness {
        pub addr: SocketAddr,
        pub gateway: Arc<Gateway>,
        pub platform: Arc<FakePlatform>,
    }

    pub(crate) async fn start(server_extra: &str) -> Harness {
        let config = GatewayConfig::from_toml(&config_toml(server_extra), &Overrides::default())
            .unwrap();
        let platform = Arc::new(FakePlatform::default());
        let gateway = Gateway::new(config, platform.clone()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&gateway)));
        Harness {
            addr,
            gateway,
            platform,
        }
    }

    pub(crate) async fn connect_client(addr: SocketAddr, token: &str) -> (Client, AuthResult) {
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let auth = encode_frame(&Frame::Auth(AuthHandshake {
            user_id: "agent".into(),
            platform: "wecom".into(),
            token: token.into(),
            client_version: "test".into(),
        }))
        .unwrap();
        ws.send(WsMessage::Text(auth)).await.unwrap();
        let result = match next_frame(&mut ws).await {
            Some(Frame::AuthResult(result)) => result,
            other => panic!("expected auth_result, got {other:?}"),
        };
        (ws, result)
    }

    /// Next decoded frame, or `None` on close.
    pub(crate) async fn next_frame(ws: &mut Client) -> Option<Frame> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")?;
            match msg {
                Ok(WsMessage::Text(text)) => return Some(decode_frame(&text).unwrap()),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Close code the gateway sent, skipping any frames before it.
    async fn close_code(ws: &mut Client) -> Option<u16> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")?;
            match msg {
                Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    pub(crate) async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn handshake_checks() {
        let auth = |token: &str, user: &str| -> RelayResult<Frame> {
            Ok(Frame::Auth(AuthHandshake {
                user_id: user.into(),
                platform: "wecom".into(),
                token: token.into(),
                client_version: String::new(),
            }))
        };
        assert!(check_handshake(auth("s3cret", "bob"), Some("s3cret")).is_ok());
        assert!(check_handshake(auth("anything", "bob"), None).is_ok());
        assert_eq!(
            check_handshake(auth("wrong", "bob"), Some("s3cret")).unwrap_err(),
            "invalid token"
        );
        assert_eq!(
            check_handshake(Ok(Frame::Ping(Heartbeat::default())), None).unwrap_err(),
            "expected auth"
        );
        assert_eq!(
            check_handshake(Err(RelayError::Protocol("bad".into())), None).unwrap_err(),
            "expected auth"
        );
        assert_eq!(check_handshake(auth("", " "), None).unwrap_err(), "missing user_id");
    }

    #[tokio::test]
    async fn auth_accepted_registers_session() {
        let h = start("").await;
        let (_ws, result) = connect_client(h.addr, "relay-secret").await;

        assert!(result.success);
        assert!(result.session_id.starts_with("agent-"));
        wait_for_registration(&h.gateway, &result.session_id).await;
    }

    pub(crate) async fn wait_for_registration(gateway: &Gateway, session_id: &str) {
        for _ in 0..100 {
            if gateway.registry().is_current(session_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} never registered");
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_and_closed() {
        let h = start("").await;
        let (mut ws, result) = connect_client(h.addr, "nope").await;

        assert!(!result.success);
        assert_eq!(result.error, "invalid token");
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_AUTH_REJECTED));
        assert!(h.gateway.registry().current().await.is_none());
    }

    #[tokio::test]
    async fn non_auth_first_frame_is_rejected() {
        let h = start("").await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", h.addr)).await.unwrap();
        let ping = encode_frame(&Frame::Ping(Heartbeat::now())).unwrap();
        ws.send(WsMessage::Text(ping)).await.unwrap();

        match next_frame(&mut ws).await {
            Some(Frame::AuthResult(result)) => {
                assert!(!result.success);
                assert_eq!(result.error, "expected auth");
            }
            other => panic!("expected auth_result, got {other:?}"),
        }
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_AUTH_REJECTED));
    }

    #[tokio::test]
    async fn newer_session_evicts_older() {
        let h = start("").await;
        let (mut first, first_result) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &first_result.session_id).await;

        let (_second, second_result) = connect_client(h.addr, "relay-secret").await;
        assert_eq!(close_code(&mut first).await, Some(CLOSE_SESSION_REPLACED));
        wait_for_registration(&h.gateway, &second_result.session_id).await;

        // The old connection's task ends without touching the new slot.
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.gateway.registry().is_current(&second_result.session_id).await);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let h = start("").await;
        let (mut ws, _) = connect_client(h.addr, "relay-secret").await;
        let ping = encode_frame(&Frame::Ping(Heartbeat { ts: 77 })).unwrap();
        ws.send(WsMessage::Text(ping)).await.unwrap();

        assert_eq!(next_frame(&mut ws).await, Some(Frame::Pong(Heartbeat { ts: 77 })));
    }

    #[tokio::test]
    async fn response_frames_are_relayed_in_order() {
        let h = start("").await;
        let (mut ws, _) = connect_client(h.addr, "relay-secret").await;

        // Malformed and error frames do not end the session.
        ws.send(WsMessage::Text("{\"type\":\"bogus\"}".into())).await.unwrap();
        let notice = encode_frame(&Frame::Error(ErrorNotice {
            code: 500,
            message: "agent hiccup".into(),
        }))
        .unwrap();
        ws.send(WsMessage::Text(notice)).await.unwrap();

        for text in ["one", "two", "three"] {
            let resp = OutgoingResponse {
                channel_id: "zhangsan".into(),
                text: text.into(),
                ..Default::default()
            };
            ws.send(WsMessage::Text(encode_frame(&Frame::Response(resp)).unwrap()))
                .await
                .unwrap();
        }

        wait_until(|| h.platform.texts().len() == 3).await;
        let texts: Vec<String> = h.platform.texts().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn relay_response_sends_text_then_media() {
        let h = start("").await;
        let resp = OutgoingResponse {
            channel_id: "lisi".into(),
            text: "see attached".into(),
            files: vec![
                chatrelay_core::FileAttachment {
                    name: "chart.png".into(),
                    kind: MediaKind::Image,
                    media_id: Some("m-1".into()),
                    path: None,
                },
                chatrelay_core::FileAttachment::local("/tmp/never-uploaded.bin"),
            ],
            ..Default::default()
        };
        h.gateway.relay_response(&resp).await.unwrap();

        assert_eq!(h.platform.texts(), vec![("lisi".into(), "see attached".into())]);
        let media = h.platform.media.lock().unwrap().clone();
        assert_eq!(media, vec![("lisi".into(), MediaKind::Image, "m-1".into())]);

        let anonymous = OutgoingResponse {
            text: "hi".into(),
            ..Default::default()
        };
        assert!(h.gateway.relay_response(&anonymous).await.is_err());
    }

    #[tokio::test]
    async fn forward_without_client_is_unreachable() {
        let h = start("").await;
        let outcome = h
            .gateway
            .forward_to_client(&Frame::Ping(Heartbeat::default()))
            .await;
        assert_eq!(outcome, Forward::Unreachable("no client connected".into()));
    }

    #[tokio::test]
    async fn idle_session_is_swept() {
        let h = start("idle_timeout_secs = 1").await;
        let (mut ws, result) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &result.session_id).await;

        // No heartbeats: the sweeper closes the session.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        h.gateway.sweep().await;
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_NORMAL));
        assert!(h.gateway.registry().current().await.is_none());
    }

    #[tokio::test]
    async fn connection_attempts_are_rate_limited() {
        let h = start("auth_rate_limit = 2").await;
        for _ in 0..2 {
            let (ws, _) = connect_async(format!("ws://{}/ws", h.addr)).await.unwrap();
            drop(ws);
        }
        assert!(connect_async(format!("ws://{}/ws", h.addr)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_session_normally() {
        let h = start("").await;
        let (mut ws, result) = connect_client(h.addr, "relay-secret").await;
        wait_for_registration(&h.gateway, &result.session_id).await;

        h.gateway.shutdown().await;
        assert_eq!(close_code(&mut ws).await, Some(CLOSE_NORMAL));
    }
}
