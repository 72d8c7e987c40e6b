//! Unified error type for the Sboboz backend.

use sboboz_protocol::ProtocolError;
use sboboz_session::SessionError;
use sboboz_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum SbobozError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (auth, conflict, token, expired).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The HTTP listener failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let sboboz_err: SbobozError = err.into();
        assert!(matches!(sboboz_err, SbobozError::Transport(_)));
        assert!(sboboz_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let sboboz_err: SbobozError = err.into();
        assert!(matches!(sboboz_err, SbobozError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::AuthFailed("nope".into());
        let sboboz_err: SbobozError = err.into();
        assert!(matches!(sboboz_err, SbobozError::Session(_)));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken");
        let sboboz_err: SbobozError = err.into();
        assert!(matches!(sboboz_err, SbobozError::Io(_)));
        assert!(sboboz_err.to_string().contains("taken"));
    }
}
