//! The main relay client.
//!
//! `RelayClient` manages the connection lifecycle: dial, authenticate, serve
//! the session (heartbeat, single reader, ordered dispatch), and reconnect
//! with exponential backoff until cancelled or a fatal error ends it.

use std::sync::Arc;
use std::time::Duration;

use chatrelay_core::{
    AuthHandshake, AuthResult, Disposition, EncryptedEnvelope, FileAttachment, Frame, Heartbeat,
    IncomingMessage, MediaAsset, MediaKind, MediaRef, OutgoingResponse, ReceivedMessage,
    RelayError, RelayResult, PROTOCOL_VERSION,
};
use chatrelay_platform::PlatformApi;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ConnectConfig;
use crate::gateway_api::GatewayApi;
use crate::handler::{MessageHandler, FALLBACK_TEXT};
use crate::media::{inline_text, is_text_like, undelivered_note, upload_kind};
use crate::transport::{self, FrameSink, FrameStream, Inbound};

/// Pending messages between the reader and the dispatch worker.
const DISPATCH_QUEUE: usize = 256;

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected { session_id: String },
    /// Cancelled by the caller.
    Shutdown,
    /// Displaced by a newer client. Terminal.
    Evicted,
    /// Handshake refused or configuration unusable. Terminal.
    Rejected,
}

/// An authenticated connection, before it is served.
pub struct Connection {
    pub session_id: String,
    sink: FrameSink,
    stream: FrameStream,
}

/// Where replies for the current session go.
#[derive(Clone)]
struct Link {
    sink: FrameSink,
    api: GatewayApi,
}

enum Delivery {
    Direct,
    Proxied(FileAttachment),
    Appended(String),
}

struct Inner {
    config: ConnectConfig,
    handler: Arc<dyn MessageHandler>,
    platform: Option<Arc<dyn PlatformApi>>,
    http: reqwest::Client,
    state: watch::Sender<ConnectionState>,
}

/// The relay client. Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// `platform` enables direct media upload/download with local credentials.
    pub fn new(
        config: ConnectConfig,
        handler: Arc<dyn MessageHandler>,
        platform: Option<Arc<dyn PlatformApi>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                platform,
                http: reqwest::Client::new(),
                state,
            }),
        }
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    /// Connect, serve and reconnect until `cancel` fires (`Ok`) or a fatal
    /// error occurs (auth rejection, eviction, bad configuration).
    pub async fn run(&self, cancel: CancellationToken) -> RelayResult<()> {
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return self.shut_down(),
                r = self.connect() => r,
            };

            let outcome = match attempt {
                Ok(conn) => self.serve(conn, &cancel, &mut backoff).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => return self.shut_down(),
                Err(e) if e.is_fatal() => {
                    let state = match &e {
                        RelayError::Evicted => ConnectionState::Evicted,
                        _ => ConnectionState::Rejected,
                    };
                    warn!(error = %e, "giving up");
                    self.set_state(state);
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "connection lost"),
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return self.shut_down(),
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn shut_down(&self) -> RelayResult<()> {
        info!("relay client stopped");
        self.set_state(ConnectionState::Shutdown);
        Ok(())
    }

    /// Dial the gateway and complete the handshake.
    ///
    /// A refused or malformed handshake is an auth error (fatal); I/O
    /// failures and timeouts are transport errors (retried).
    pub async fn connect(&self) -> RelayResult<Connection> {
        let config = &self.inner.config;
        let (sink, mut stream) = transport::connect(&config.url, config.auth_timeout).await?;

        self.set_state(ConnectionState::Authenticating);
        sink.send(&Frame::Auth(AuthHandshake {
            user_id: config.user_id.clone(),
            platform: config.platform.clone(),
            token: config.auth_token.clone(),
            client_version: format!(
                "chatrelay-client/{} ({PROTOCOL_VERSION})",
                env!("CARGO_PKG_VERSION")
            ),
        }))
        .await?;

        let reply = time::timeout(config.auth_timeout, await_auth_result(&mut stream))
            .await
            .map_err(|_| RelayError::Timeout)??;

        if !reply.success {
            let reason = if reply.error.is_empty() {
                "handshake rejected".to_string()
            } else {
                reply.error
            };
            return Err(RelayError::Auth(reason));
        }

        Ok(Connection {
            session_id: reply.session_id,
            sink,
            stream,
        })
    }

    /// Serve one authenticated connection until it fails or `cancel` fires.
    async fn serve(
        &self,
        conn: Connection,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> RelayResult<()> {
        let Connection {
            session_id,
            sink,
            mut stream,
        } = conn;
        info!(session_id = %session_id, "connected to gateway");
        self.set_state(ConnectionState::Connected {
            session_id: session_id.clone(),
        });

        let conn_cancel = cancel.child_token();
        let _stop_tasks = conn_cancel.clone().drop_guard();

        let link = Link {
            sink: sink.clone(),
            api: GatewayApi::new(
                self.inner.http.clone(),
                self.inner.config.http_base(),
                session_id,
            ),
        };
        let (queue, queue_rx) = mpsc::channel(DISPATCH_QUEUE);
        tokio::spawn(self.clone().dispatch_worker(queue_rx, link, conn_cancel.clone()));
        tokio::spawn(heartbeat(
            sink.clone(),
            self.inner.config.heartbeat_interval,
            conn_cancel.clone(),
        ));

        let read_timeout = self.inner.config.read_timeout();
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => {
                    sink.close().await;
                    return Ok(());
                }
                r = time::timeout(read_timeout, stream.recv()) => r.map_err(|_| RelayError::Timeout)??,
            };
            backoff.reset();

            match inbound {
                Inbound::Frame(frame) => self.handle_frame(frame, &sink, &queue).await,
                Inbound::Malformed(e) => warn!(error = %e, "skipping malformed frame"),
                Inbound::Control => {}
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        sink: &FrameSink,
        queue: &mpsc::Sender<IncomingMessage>,
    ) {
        let msg = match frame {
            Frame::Message(msg) => Some(msg),
            Frame::Raw(envelope) => self.open_raw(&envelope),
            Frame::Ping(hb) => {
                if let Err(e) = sink.send(&Frame::Pong(hb)).await {
                    debug!(error = %e, "pong failed");
                }
                None
            }
            Frame::Pong(_) => None,
            Frame::Error(notice) => {
                warn!(code = notice.code, message = %notice.message, "gateway reported an error");
                None
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected frame");
                None
            }
        };

        if let Some(msg) = msg {
            debug!(message_id = %msg.id, channel_id = %msg.channel_id, "queued for dispatch");
            if queue.send(msg).await.is_err() {
                debug!("dispatch worker gone");
            }
        }
    }

    /// Decrypt and classify a `raw` envelope locally.
    fn open_raw(&self, envelope: &EncryptedEnvelope) -> Option<IncomingMessage> {
        let Some(crypto) = &self.inner.config.crypto else {
            warn!("raw frame received but no webhook crypto is configured");
            return None;
        };
        let plain = match crypto.decrypt(envelope) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(error = %e, "raw envelope failed integrity check, possible forgery");
                return None;
            }
        };
        let received = match ReceivedMessage::from_bytes(&plain) {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "unparseable raw message");
                return None;
            }
        };
        let msg = received.to_incoming(&self.inner.config.platform);
        if msg.is_none() {
            debug!(msg_type = %received.msg_type, event = %received.event, "ignoring non-message callback");
        }
        msg
    }

    /// Drain the dispatch queue in order, one message at a time.
    async fn dispatch_worker(
        self,
        mut queue: mpsc::Receiver<IncomingMessage>,
        link: Link,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.dispatch(&link, msg).await;
        }

        let dropped = drain_queue(&mut queue);
        if dropped.is_empty() {
            debug!("dispatch worker stopped");
        } else {
            warn!(
                dropped = dropped.len(),
                message_ids = ?dropped,
                "connection lost with messages still queued, dropping them"
            );
        }
    }

    async fn dispatch(&self, link: &Link, msg: IncomingMessage) {
        let media = match &msg.media {
            Some(media) => match self.fetch_media(Some(&link.api), media).await {
                Ok(asset) => Some(asset),
                Err(e) => {
                    warn!(message_id = %msg.id, media_id = %media.media_id, error = %e, "media unavailable");
                    None
                }
            },
            None => None,
        };

        let mut reply = match self.inner.handler.handle(msg.clone(), media).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                warn!(message_id = %msg.id, error = %e, "handler failed");
                OutgoingResponse::reply_to(&msg, FALLBACK_TEXT)
            }
        };
        if reply.channel_id.is_empty() {
            reply.channel_id = msg.channel_id.clone();
        }
        if reply.platform.is_empty() {
            reply.platform = msg.platform.clone();
        }
        if reply.message_id.is_empty() {
            reply.message_id = msg.id.clone();
        }

        if let Err(e) = self.send(link, reply).await {
            warn!(message_id = %msg.id, error = %e, "response not delivered");
        }
    }

    /// Fetch an inbound attachment: directly from the platform when local
    /// credentials exist, else through the gateway media proxy.
    pub async fn fetch_media(
        &self,
        gateway: Option<&GatewayApi>,
        media: &MediaRef,
    ) -> RelayResult<MediaAsset> {
        if let Some(platform) = &self.inner.platform {
            match platform.download_media(&media.media_id).await {
                Ok(mut asset) => {
                    asset.kind = media.kind;
                    return Ok(asset);
                }
                Err(e) => warn!(media_id = %media.media_id, error = %e, "direct download failed"),
            }
        }
        match gateway {
            Some(api) => api.download_media(media.kind, &media.media_id).await,
            None => Err(RelayError::Config("no media source available".into())),
        }
    }

    /// Deliver a response: files first, then text through the push-callback,
    /// falling back to a `response` frame when the callback is unreachable.
    async fn send(&self, link: &Link, mut response: OutgoingResponse) -> RelayResult<()> {
        if !response.files.is_empty() {
            self.deliver_files(link, &mut response).await;
        }
        if response.is_empty() {
            return Ok(());
        }

        match link.api.post_response(&response).await {
            Ok(()) => Ok(()),
            Err(e) if e.disposition() == Disposition::Retry => {
                debug!(error = %e, "callback unreachable, replying over the socket");
                link.sink.send(&Frame::Response(response)).await
            }
            Err(e) => Err(e),
        }
    }

    async fn deliver_files(&self, link: &Link, response: &mut OutgoingResponse) {
        let mut appended = Vec::new();
        for file in std::mem::take(&mut response.files) {
            let Some(path) = file.path.as_deref() else {
                if file.media_id.is_some() {
                    response.files.push(file);
                } else {
                    appended.push(undelivered_note(&file.name));
                }
                continue;
            };
            match self.deliver_file(link, &response.channel_id, &file.name, path).await {
                Delivery::Direct => {}
                Delivery::Proxied(attachment) => response.files.push(attachment),
                Delivery::Appended(text) => appended.push(text),
            }
        }

        for text in appended {
            if !response.text.is_empty() {
                response.text.push_str("\n\n");
            }
            response.text.push_str(&text);
        }
    }

    async fn deliver_file(&self, link: &Link, channel_id: &str, name: &str, path: &str) -> Delivery {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path, error = %e, "cannot read attachment");
                return Delivery::Appended(undelivered_note(name));
            }
        };

        if let Some(kind) = upload_kind(name, bytes.len()) {
            if let Some(platform) = &self.inner.platform {
                match send_direct(platform.as_ref(), channel_id, kind, name, bytes.clone()).await {
                    Ok(()) => return Delivery::Direct,
                    Err(e) => warn!(name, error = %e, "direct media send failed"),
                }
            }
            if self.inner.config.proxy_media {
                match link.api.upload_media(kind, name, bytes.clone()).await {
                    Ok(media_id) => {
                        return Delivery::Proxied(FileAttachment {
                            name: name.to_string(),
                            kind,
                            media_id: Some(media_id),
                            path: None,
                        });
                    }
                    Err(e) => warn!(name, error = %e, "media proxy upload failed"),
                }
            }
        }

        if is_text_like(name) {
            Delivery::Appended(inline_text(name, &bytes))
        } else {
            Delivery::Appended(undelivered_note(name))
        }
    }
}

async fn await_auth_result(stream: &mut FrameStream) -> RelayResult<AuthResult> {
    loop {
        match stream.recv().await? {
            Inbound::Control => continue,
            Inbound::Frame(Frame::AuthResult(result)) => return Ok(result),
            Inbound::Frame(other) => {
                return Err(RelayError::Auth(format!(
                    "expected auth_result, got {}",
                    other.kind()
                )));
            }
            Inbound::Malformed(e) => {
                return Err(RelayError::Auth(format!("unreadable auth reply: {e}")));
            }
        }
    }
}

/// Close the queue and return the ids of messages that were never dispatched.
fn drain_queue(queue: &mut mpsc::Receiver<IncomingMessage>) -> Vec<String> {
    queue.close();
    let mut dropped = Vec::new();
    while let Ok(msg) = queue.try_recv() {
        dropped.push(msg.id);
    }
    dropped
}

async fn send_direct(
    platform: &dyn PlatformApi,
    to_user: &str,
    kind: MediaKind,
    name: &str,
    bytes: Vec<u8>,
) -> RelayResult<()> {
    let media_id = platform.upload_media(kind, name, bytes).await?;
    platform.send_media(to_user, kind, &media_id).await
}

/// `ping` every `interval` regardless of other traffic.
async fn heartbeat(sink: FrameSink, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sink.send(&Frame::Ping(Heartbeat::now())).await {
                    debug!(error = %e, "heartbeat stopped");
                    break;
                }
            }
        }
    }
}
