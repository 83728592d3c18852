//! Session registry.
//!
//! Holds at most one live client session. Registering a new session
//! displaces the old one, which is closed with 4001 and has its task
//! cancelled. A connection task that ends only removes the slot if the slot
//! still holds its own session, so a stale task can never evict a newer one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_core::messages::CLOSE_SESSION_REPLACED;
use chatrelay_core::{encode_frame, Frame, RelayResult};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bound on how long a close may wait for the write lock.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a client connection.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send_text(&mut self, text: String) -> RelayResult<()>;

    /// Send a close frame. Best effort.
    async fn close(&mut self, code: u16, reason: &str);
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
    pub client_version: String,
}

/// Cloneable handle to a live session: its identity, its serialized write
/// half, and the token that stops its receive loop.
#[derive(Clone)]
pub struct SessionHandle {
    info: Arc<SessionInfo>,
    writer: Arc<Mutex<Box<dyn FrameWriter>>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(info: SessionInfo, writer: Box<dyn FrameWriter>, cancel: CancellationToken) -> Self {
        Self {
            info: Arc::new(info),
            writer: Arc::new(Mutex::new(writer)),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.session_id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn send(&self, frame: &Frame) -> RelayResult<()> {
        let text = encode_frame(frame)?;
        self.writer.lock().await.send_text(text).await
    }

    /// Stop the session's task and send a close frame.
    pub async fn close(&self, code: u16, reason: &str) {
        self.cancel.cancel();
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            self.writer.lock().await.close(code, reason).await;
        })
        .await;
        if closed.is_err() {
            debug!(session_id = self.id(), "close frame timed out");
        }
    }
}

struct Slot {
    handle: SessionHandle,
    last_seen: Instant,
}

/// Single-slot registry.
#[derive(Default)]
pub struct SessionRegistry {
    slot: Mutex<Option<Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the live session. A displaced session is closed
    /// with 4001 and returned.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let displaced = {
            let mut slot = self.slot.lock().await;
            slot.replace(Slot {
                handle,
                last_seen: Instant::now(),
            })
            .map(|s| s.handle)
        };
        if let Some(old) = &displaced {
            info!(session_id = old.id(), "session replaced by a newer connection");
            old.close(CLOSE_SESSION_REPLACED, "session replaced").await;
        }
        displaced
    }

    pub async fn current(&self) -> Option<SessionHandle> {
        self.slot.lock().await.as_ref().map(|s| s.handle.clone())
    }

    pub async fn is_current(&self, session_id: &str) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.id() == session_id)
    }

    /// Refresh `last_seen` for the session, if it is still the live one.
    pub async fn touch(&self, session_id: &str) {
        if let Some(slot) = self.slot.lock().await.as_mut() {
            if slot.handle.id() == session_id {
                slot.last_seen = Instant::now();
            }
        }
    }

    /// Clear the slot only if it still holds `session_id`.
    pub async fn remove_if(&self, session_id: &str) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| s.handle.id() == session_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Take the live session out if it has been silent longer than `max_idle`.
    pub async fn take_idle(&self, max_idle: Duration) -> Option<SessionHandle> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| s.last_seen.elapsed() > max_idle) {
            slot.take().map(|s| s.handle)
        } else {
            None
        }
    }

    /// Take the live session out unconditionally.
    pub async fn take(&self) -> Option<SessionHandle> {
        self.slot.lock().await.take().map(|s| s.handle)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chatrelay_core::Heartbeat;
    use std::sync::Mutex as StdMutex;

    /// Writer that records everything sent through it.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub texts: Arc<StdMutex<Vec<String>>>,
        pub closes: Arc<StdMutex<Vec<u16>>>,
    }

    #[async_trait]
    impl FrameWriter for Recorder {
        async fn send_text(&mut self, text: String) -> RelayResult<()> {
            self.texts.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&mut self, code: u16, _reason: &str) {
            self.closes.lock().unwrap().push(code);
        }
    }

    fn session(id: &str) -> (SessionHandle, Recorder) {
        let recorder = Recorder::default();
        let handle = SessionHandle::new(
            SessionInfo {
                session_id: id.into(),
                user_id: "agent".into(),
                platform: "wecom".into(),
                client_version: "test".into(),
            },
            Box::new(recorder.clone()),
            CancellationToken::new(),
        );
        (handle, recorder)
    }

    #[tokio::test]
    async fn register_evicts_previous_session() {
        let registry = SessionRegistry::new();
        let (first, first_rec) = session("s1");
        let (second, second_rec) = session("s2");

        assert!(registry.register(first.clone()).await.is_none());
        let displaced = registry.register(second).await.unwrap();

        assert_eq!(displaced.id(), "s1");
        assert!(first.cancel_token().is_cancelled());
        assert_eq!(*first_rec.closes.lock().unwrap(), vec![CLOSE_SESSION_REPLACED]);
        assert!(second_rec.closes.lock().unwrap().is_empty());
        assert!(registry.is_current("s2").await);
    }

    #[tokio::test]
    async fn stale_session_cannot_remove_newer_one() {
        let registry = SessionRegistry::new();
        let (first, _) = session("s1");
        let (second, _) = session("s2");
        registry.register(first).await;
        registry.register(second).await;

        assert!(!registry.remove_if("s1").await);
        assert!(registry.is_current("s2").await);
        assert!(registry.remove_if("s2").await);
        assert!(registry.current().await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_are_taken() {
        let registry = SessionRegistry::new();
        let (handle, _) = session("s1");
        registry.register(handle).await;

        assert!(registry.take_idle(Duration::from_secs(60)).await.is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let idle = registry.take_idle(Duration::from_millis(1)).await.unwrap();
        assert_eq!(idle.id(), "s1");
        assert!(registry.current().await.is_none());
    }

    #[tokio::test]
    async fn touch_keeps_session_alive() {
        let registry = SessionRegistry::new();
        let (handle, _) = session("s1");
        registry.register(handle).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch("s1").await;
        assert!(registry.take_idle(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn send_encodes_frames() {
        let (handle, rec) = session("s1");
        handle.send(&Frame::Pong(Heartbeat { ts: 42 })).await.unwrap();
        let texts = rec.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("\"type\":\"pong\""));
    }
}
