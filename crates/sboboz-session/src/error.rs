//! Error types for the session layer.

use sboboz_protocol::{PlayerId, SessionId};

/// Errors that can occur during session management.
///
/// Every variant except [`SessionError::Internal`] is client-correctable:
/// the gateway answers it by treating the connection as a fresh login (or
/// by telling the client to log in again), never by taking the process
/// down.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The identity provider rejected the credential, or none was given
    /// where a fresh login needed one.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The identity already owns a live (connected or in-grace) session and
    /// the store runs a single-session policy.
    #[error("player {0} already has an active session")]
    IdentityConflict(PlayerId),

    /// No session with this id exists, and none ever expired under it.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The presented reconnect token doesn't match the current one.
    /// Stale (already rotated) tokens land here too.
    #[error("invalid reconnect token")]
    InvalidToken,

    /// The session's grace period ran out, or it was logged out.
    #[error("session {0} has expired")]
    Expired(SessionId),

    /// The registry observed a state its own invariants rule out, e.g. two
    /// live connections bound to one session. Not caused by the client.
    #[error("session registry inconsistency: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether the client can fix this by logging in again.
    pub fn is_client_correctable(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_client_correctable_only_internal_is_not() {
        let sid = SessionId::new("s1");
        let correctable = [
            SessionError::AuthFailed("nope".into()),
            SessionError::IdentityConflict(PlayerId::new("u1")),
            SessionError::UnknownSession(sid.clone()),
            SessionError::InvalidToken,
            SessionError::Expired(sid),
        ];
        for err in &correctable {
            assert!(err.is_client_correctable(), "{err}");
        }
        assert!(!SessionError::Internal("two writers".into()).is_client_correctable());
    }

    #[test]
    fn test_display_never_includes_token_material() {
        assert_eq!(SessionError::InvalidToken.to_string(), "invalid reconnect token");
    }
}
