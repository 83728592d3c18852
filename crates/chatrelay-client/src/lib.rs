//! chatrelay-client: the agent side of the chat relay.
//!
//! Dials the gateway over WebSocket, authenticates, keeps the session alive
//! with heartbeats, hands inbound messages to a [`MessageHandler`] in order,
//! and delivers responses (text and files) back through the gateway.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use chatrelay_client::{ConnectConfig, MessageHandler, RelayClient};
//! use chatrelay_core::{IncomingMessage, MediaAsset, OutgoingResponse, RelayResult};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(
//!         &self,
//!         msg: IncomingMessage,
//!         _media: Option<MediaAsset>,
//!     ) -> RelayResult<Option<OutgoingResponse>> {
//!         Ok(Some(OutgoingResponse::reply_to(&msg, msg.text.clone())))
//!     }
//! }
//!
//! # async fn example() -> RelayResult<()> {
//! let client = RelayClient::new(
//!     ConnectConfig {
//!         url: "wss://relay.example.com/ws".into(),
//!         auth_token: "s3cret".into(),
//!         ..Default::default()
//!     },
//!     Arc::new(Echo),
//!     None,
//! );
//! client.run(CancellationToken::new()).await
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod gateway_api;
pub mod handler;
pub mod media;
pub mod transport;

// Re-export primary public types.
pub use client::{ConnectionState, RelayClient};
pub use config::ConnectConfig;
pub use handler::{MessageHandler, FALLBACK_TEXT};

// Re-export chatrelay-core error types for convenience.
pub use chatrelay_core::{RelayError, RelayResult};
