//! Serialization and deserialization for the Waveline wire protocol.
//!
//! Frames travel as JSON text. Decoding is type-directed: the `"type"`
//! discriminator is inspected first, known types parse strictly into
//! [`Frame`], and unknown types are preserved as [`OpaqueFrame`] for
//! pass-through. A known type with a malformed body is an error — the
//! dispatcher logs and drops it rather than forwarding garbage.

use crate::frame::{Frame, Inbound, OpaqueFrame};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not a JSON object with a string `type` field.
    #[error("frame has no string `type` discriminator")]
    MissingType,
}

/// Encodes a [`Frame`] as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes JSON text into an [`Inbound`] frame.
///
/// Unknown `type` strings produce `Inbound::Opaque` with the original
/// object preserved; this is how `game.*` events ride the channel without
/// the transport knowing their semantics.
///
/// # Errors
///
/// Returns `CodecError::MissingType` if the text is not an object carrying a
/// string `type` field, or `CodecError::Serialization` if a known frame type
/// has a malformed body.
pub fn decode(text: &str) -> Result<Inbound, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let Some(frame_type) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(CodecError::MissingType);
    };

    if Frame::is_known_type(frame_type) {
        serde_json::from_value::<Frame>(value)
            .map(Inbound::Frame)
            .map_err(|e| CodecError::Serialization(e.to_string()))
    } else {
        Ok(Inbound::Opaque(OpaqueFrame {
            frame_type: frame_type.to_string(),
            payload: value,
        }))
    }
}
