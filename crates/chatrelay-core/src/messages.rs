//! Wire frames exchanged between gateway and client.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Encoding
//! goes through the derived internally-tagged `Serialize`; decoding is done
//! in two phases by [`crate::codec::decode_frame`] so that an unknown `type`
//! can be told apart from a malformed known frame.

use crate::envelope::EncryptedEnvelope;
use crate::media::{MediaKind, MediaRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version string, sent as part of the client version.
pub const PROTOCOL_VERSION: &str = "chatrelay-v1";

/// WebSocket close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code sent to a session displaced by a newer registration.
pub const CLOSE_SESSION_REPLACED: u16 = 4001;
/// WebSocket close code sent after a rejected handshake.
pub const CLOSE_AUTH_REJECTED: u16 = 4003;

/// Header carrying the session id on the gateway's HTTP side channels.
pub const SESSION_HEADER: &str = "x-session-id";

/// Response header naming the file served by the media proxy.
pub const MEDIA_FILENAME_HEADER: &str = "x-media-filename";

/// First frame a client sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHandshake {
    pub user_id: String,
    pub platform: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub client_version: String,
}

/// Gateway's single reply to [`AuthHandshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl AuthResult {
    pub fn accepted(session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            error: String::new(),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: String::new(),
            error: error.into(),
        }
    }
}

/// A user message relayed from the platform to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub platform: String,
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Platform media attached to the message (image, voice, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

/// A file attached to an [`OutgoingResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub kind: MediaKind,
    /// Platform media id, once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    /// Client-local path. Never sent to the gateway.
    #[serde(default, skip_serializing)]
    pub path: Option<String>,
}

impl FileAttachment {
    /// A local file the client still has to deliver.
    pub fn local(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        Self {
            kind: MediaKind::from_filename(&name),
            name,
            media_id: None,
            path: Some(path),
        }
    }
}

/// The agent's reply, travelling client → gateway → platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingResponse {
    #[serde(default)]
    pub message_id: String,
    pub platform: String,
    pub channel_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,
}

impl OutgoingResponse {
    /// Plain text reply to the channel an incoming message came from.
    pub fn reply_to(msg: &IncomingMessage, text: impl Into<String>) -> Self {
        Self {
            message_id: msg.id.clone(),
            platform: msg.platform.clone(),
            channel_id: msg.channel_id.clone(),
            text: text.into(),
            files: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.files.is_empty()
    }
}

/// Liveness check payload (`ping` / `pong`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub ts: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self { ts }
    }
}

/// Out-of-band error notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    #[serde(default)]
    pub code: u16,
    pub message: String,
}

/// Closed set of frames on the relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Auth(AuthHandshake),
    AuthResult(AuthResult),
    Message(IncomingMessage),
    /// Still-encrypted platform envelope, decrypted by the client.
    Raw(EncryptedEnvelope),
    Response(OutgoingResponse),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Error(ErrorNotice),
}

impl Frame {
    /// Wire discriminator of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth(_) => "auth",
            Frame::AuthResult(_) => "auth_result",
            Frame::Message(_) => "message",
            Frame::Raw(_) => "raw",
            Frame::Response(_) => "response",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Error(_) => "error",
        }
    }
}
