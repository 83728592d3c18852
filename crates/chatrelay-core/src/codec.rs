//! JSON text framing for the relay channel.
//!
//! Decoding peeks at the `type` discriminator first and only then decodes the
//! matching payload, so "unknown frame type" and "malformed frame" surface as
//! distinct protocol errors.

use crate::error::{RelayError, RelayResult};
use crate::messages::Frame;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Encode a frame as a JSON text message.
pub fn encode_frame(frame: &Frame) -> RelayResult<String> {
    Ok(serde_json::to_string(frame)?)
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decode a JSON text message into a [`Frame`].
pub fn decode_frame(text: &str) -> RelayResult<Frame> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| RelayError::Protocol(format!("frame is not JSON: {e}")))?;

    let Discriminator { kind } = Discriminator::deserialize(&value)
        .map_err(|e| RelayError::Protocol(format!("frame type is not a string: {e}")))?;
    let kind = kind.ok_or_else(|| RelayError::Protocol("frame has no type field".into()))?;

    let frame = match kind.as_str() {
        "auth" => Frame::Auth(payload(&kind, value)?),
        "auth_result" => Frame::AuthResult(payload(&kind, value)?),
        "message" => Frame::Message(payload(&kind, value)?),
        "raw" => Frame::Raw(payload(&kind, value)?),
        "response" => Frame::Response(payload(&kind, value)?),
        "ping" => Frame::Ping(payload(&kind, value)?),
        "pong" => Frame::Pong(payload(&kind, value)?),
        "error" => Frame::Error(payload(&kind, value)?),
        other => {
            return Err(RelayError::Protocol(format!("unknown frame type: {other}")));
        }
    };
    Ok(frame)
}

fn payload<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> RelayResult<T> {
    serde_json::from_value(value)
        .map_err(|e| RelayError::Protocol(format!("malformed {kind} frame: {e}")))
}
