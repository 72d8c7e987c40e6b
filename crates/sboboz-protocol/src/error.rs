//! Error types for the protocol layer.

/// Errors that can occur while turning frames into messages and back.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, unknown
    /// message type.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame decoded fine but breaks a protocol rule, e.g. a first
    /// frame that isn't a handshake.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
