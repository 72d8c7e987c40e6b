//! Session types: the records that represent a player's presence.
//!
//! A session tracks:
//! - WHO the player is (`PlayerId`)
//! - WHAT state their presence is in (connected, in grace, expired)
//! - HOW they can come back (a rotating reconnect token)
//! - WHERE they are (a weak lobby reference)

use std::time::Duration;

use sboboz_protocol::{LobbyId, PlayerId, ReconnectToken, SessionId};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// How many live sessions one identity may own at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// One non-expired session per identity; a second login fails with
    /// [`SessionError::IdentityConflict`](crate::SessionError::IdentityConflict).
    #[default]
    SingleSession,
    /// Any number of sessions per identity (e.g. several devices).
    MultiSession,
}

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a disconnected session stays recoverable.
    ///
    /// Default: 30 seconds. Zero expires sessions on disconnect.
    pub grace_window: Duration,

    /// Single- or multi-session per identity.
    pub identity_policy: IdentityPolicy,

    /// How long the id of a removed session is remembered, so a late
    /// reconnect reports `Expired` instead of `UnknownSession`.
    ///
    /// Default: 10 minutes.
    pub retired_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(30),
            identity_policy: IdentityPolicy::default(),
            retired_retention: Duration::from_secs(10 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The current state of a session.
///
/// ```text
///   Connected ──(disconnect)──→ Grace ──(deadline)──→ Expired
///       ↑                         │
///       └──────(reconnect)────────┘
/// ```
///
/// The grace deadline lives inside the `Grace` variant, so leaving grace
/// clears it without anyone having to remember to.
///
/// `Instant` is Tokio's clock: in production it is the monotonic clock,
/// and tests running on a paused runtime can advance it at will.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A live transport connection is bound to the session.
    Connected,

    /// The connection dropped; the session is recoverable until `deadline`.
    Grace { deadline: Instant },

    /// Terminal. Only ever observed on a session that is being removed.
    Expired,
}

impl SessionState {
    /// The grace deadline, if the session is in grace.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Grace { deadline } => Some(*deadline),
            _ => None,
        }
    }

    /// Short name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Grace { .. } => "grace",
            Self::Expired => "expired",
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One player's logical presence across possibly many connections.
///
/// Values handed out by the store are snapshots: mutating one changes
/// nothing in the registry.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable, never-reused identifier.
    pub session_id: SessionId,

    /// The identity that logged in.
    pub identity: PlayerId,

    /// Current reconnect credential (32 hex chars, 128 random bits).
    /// Rotated on every successful reconnect.
    pub reconnect_token: ReconnectToken,

    /// Lifecycle state.
    pub state: SessionState,

    /// Lobby or game the player is part of. Identifier only.
    pub lobby: Option<LobbyId>,

    /// When the session was created.
    pub created_at: Instant,
}

/// Result of [`SessionStore::begin_grace`](crate::SessionStore::begin_grace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    /// `Connected → Grace` with this deadline.
    Started(Instant),
    /// Already in grace; the new deadline was earlier and replaced it.
    Shortened(Instant),
    /// Already in grace with an earlier (or equal) deadline, which stands.
    Unchanged(Instant),
}

impl GraceOutcome {
    /// The deadline now in force.
    pub fn deadline(&self) -> Instant {
        match self {
            Self::Started(d) | Self::Shortened(d) | Self::Unchanged(d) => *d,
        }
    }

    /// Whether an expiration has to be (re)scheduled for the deadline.
    pub fn needs_schedule(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.grace_window, Duration::from_secs(30));
        assert_eq!(cfg.identity_policy, IdentityPolicy::SingleSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_deadline_only_in_grace() {
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(SessionState::Grace { deadline }.deadline(), Some(deadline));
        assert_eq!(SessionState::Connected.deadline(), None);
        assert_eq!(SessionState::Expired.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_outcome_unchanged_needs_no_schedule() {
        let d = Instant::now();
        assert!(GraceOutcome::Started(d).needs_schedule());
        assert!(GraceOutcome::Shortened(d).needs_schedule());
        assert!(!GraceOutcome::Unchanged(d).needs_schedule());
    }
}
