//! chatrelay-platform: outbound access to the chat platform.
//!
//! The gateway and the client only see [`PlatformApi`]; [`WeComApi`] is the
//! HTTP implementation for WeCom (enterprise WeChat) applications.

pub mod text;
pub mod wecom;

use async_trait::async_trait;
use chatrelay_core::{MediaAsset, MediaKind, RelayResult};

pub use text::{split_text, MAX_TEXT_BYTES};
pub use wecom::{WeComApi, WeComConfig, DEFAULT_API_BASE};

/// Operations the relay needs from a chat platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Platform name as it appears in frames (`"wecom"`).
    fn name(&self) -> &str;

    /// Send a text message to a user. Long text is split by the implementation.
    async fn send_text(&self, to_user: &str, text: &str) -> RelayResult<()>;

    /// Send previously uploaded media to a user.
    async fn send_media(&self, to_user: &str, kind: MediaKind, media_id: &str) -> RelayResult<()>;

    /// Upload bytes as temporary media and return its media id.
    async fn upload_media(
        &self,
        kind: MediaKind,
        filename: &str,
        bytes: Vec<u8>,
    ) -> RelayResult<String>;

    /// Download media by id.
    async fn download_media(&self, media_id: &str) -> RelayResult<MediaAsset>;
}
