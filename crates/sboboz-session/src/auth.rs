//! Authentication hook for resolving player identity.
//!
//! Identity lives with an external provider (Appwrite accounts, a JWT
//! issuer, ...). The session layer only needs one thing from it: turn the
//! credential a client sends into a [`PlayerId`]. [`Authenticator`] is that
//! seam; production, development, and tests each plug in their own.

use sboboz_protocol::PlayerId;

use crate::SessionError;

/// Validates a client's auth token and returns their identity.
///
/// `Send + Sync + 'static`: one authenticator is shared by every
/// connection task for the lifetime of the server.
///
/// # Example
///
/// ```rust
/// use sboboz_protocol::PlayerId;
/// use sboboz_session::{Authenticator, SessionError};
///
/// /// Accepts any non-empty token and uses it as the player id.
/// struct EchoAuthenticator;
///
/// impl Authenticator for EchoAuthenticator {
///     async fn authenticate(&self, token: &str) -> Result<PlayerId, SessionError> {
///         if token.is_empty() {
///             return Err(SessionError::AuthFailed("empty token".into()));
///         }
///         Ok(PlayerId::new(token))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the given token and returns the player's identity.
    ///
    /// # Returns
    /// - `Ok(PlayerId)` — the token is valid
    /// - `Err(SessionError::AuthFailed)` — invalid, expired, or rejected
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<PlayerId, SessionError>> + Send;
}
