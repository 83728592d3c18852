//! WebSocket transport for the relay channel.
//!
//! One JSON text message per frame. The write half is shared behind a mutex
//! so heartbeats and responses never interleave; the read half belongs to the
//! single read loop.

use std::sync::Arc;
use std::time::Duration;

use chatrelay_core::messages::{CLOSE_AUTH_REJECTED, CLOSE_NORMAL, CLOSE_SESSION_REPLACED};
use chatrelay_core::{decode_frame, encode_frame, Frame, RelayError, RelayResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared write half.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<Mutex<SplitSink<Stream, Message>>>,
}

/// Exclusive read half.
pub struct FrameStream {
    inner: SplitStream<Stream>,
}

/// One read from the socket.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// A text message that did not decode. The connection stays up.
    Malformed(RelayError),
    /// WebSocket-level ping/pong or binary noise.
    Control,
}

/// Dial the gateway and split the socket.
pub async fn connect(url: &str, timeout: Duration) -> RelayResult<(FrameSink, FrameStream)> {
    let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| RelayError::Timeout)?
        .map_err(|e| RelayError::Transport(format!("WebSocket connect error: {e}")))?;
    tracing::debug!(url, "WebSocket connected");

    let (sink, stream) = ws.split();
    Ok((
        FrameSink {
            inner: Arc::new(Mutex::new(sink)),
        },
        FrameStream { inner: stream },
    ))
}

impl FrameSink {
    pub async fn send(&self, frame: &Frame) -> RelayResult<()> {
        let text = encode_frame(frame)?;
        let mut sink = self.inner.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| RelayError::Transport(format!("WS send error: {e}")))
    }

    /// Best-effort orderly close.
    pub async fn close(&self) {
        let mut sink = self.inner.lock().await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_NORMAL),
                reason: "client shutdown".into(),
            })))
            .await;
    }
}

impl FrameStream {
    /// Next inbound item. Close codes map onto the error taxonomy:
    /// 4001 is eviction, 4003 is an auth rejection, anything else a
    /// transport failure.
    pub async fn recv(&mut self) -> RelayResult<Inbound> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => Ok(match decode_frame(&text) {
                Ok(frame) => Inbound::Frame(frame),
                Err(e) => Inbound::Malformed(e),
            }),
            Some(Ok(Message::Close(frame))) => Err(close_error(frame)),
            Some(Ok(_)) => Ok(Inbound::Control),
            Some(Err(e)) => Err(RelayError::Transport(format!("WS read error: {e}"))),
            None => Err(RelayError::Transport("connection closed".into())),
        }
    }
}

fn close_error(frame: Option<CloseFrame<'_>>) -> RelayError {
    let Some(frame) = frame else {
        return RelayError::Transport("closed by gateway".into());
    };
    match u16::from(frame.code) {
        CLOSE_SESSION_REPLACED => RelayError::Evicted,
        CLOSE_AUTH_REJECTED => RelayError::Auth(format!("rejected by gateway: {}", frame.reason)),
        code => RelayError::Transport(format!("closed by gateway ({code}): {}", frame.reason)),
    }
}
