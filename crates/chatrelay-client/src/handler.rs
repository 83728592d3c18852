use async_trait::async_trait;
use chatrelay_core::{IncomingMessage, MediaAsset, OutgoingResponse, RelayResult};

/// Text sent back to the user when the handler fails.
pub const FALLBACK_TEXT: &str = "Sorry, something went wrong while handling your message.";

/// The agent side of the relay.
///
/// Called once per inbound message, in arrival order. `media` holds the
/// attachment when the message referenced one and it could be fetched.
/// Returning `Ok(None)` sends nothing; an error is converted into
/// [`FALLBACK_TEXT`] for the originating channel.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        msg: IncomingMessage,
        media: Option<MediaAsset>,
    ) -> RelayResult<Option<OutgoingResponse>>;
}
