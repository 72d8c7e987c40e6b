//! Development authenticator.
//!
//! Accounts live with the external identity provider. Until its token
//! verification is wired in, the server trusts the token as the player id.

use sboboz_protocol::PlayerId;
use sboboz_session::{Authenticator, SessionError};

const MAX_TOKEN_LEN: usize = 128;

/// Accepts any non-blank token and uses it, trimmed, as the player id.
///
/// Never use it where clients are untrusted: anyone can claim any id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthenticator;

impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<PlayerId, SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::AuthFailed("empty auth token".into()));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(SessionError::AuthFailed("auth token too long".into()));
        }
        Ok(PlayerId::new(token))
    }
}
