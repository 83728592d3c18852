//! chatrelay-core: Shared protocol library for the chat relay.
//!
//! Provides the JSON wire frames exchanged between gateway and client, the
//! two-phase frame codec, the error taxonomy with its retry/drop/fatal policy,
//! media types, session ids, and the webhook crypto (signature verification
//! and AES envelope encryption) together with the platform XML envelope types.

pub mod codec;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod media;
pub mod messages;
pub mod session;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame};
pub use crypto::{constant_time_eq, WebhookCrypto};
pub use envelope::{EncryptedEnvelope, MessageKind, ReceivedMessage};
pub use error::{Disposition, ErrorKind, RelayError, RelayResult};
pub use media::{MediaAsset, MediaKind, MediaRef};
pub use messages::{
    AuthHandshake, AuthResult, ErrorNotice, FileAttachment, Frame, Heartbeat, IncomingMessage,
    OutgoingResponse, PROTOCOL_VERSION,
};
pub use session::generate_session_id;
