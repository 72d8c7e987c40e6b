//! The session store: the authoritative registry of player sessions.
//!
//! # Concurrency
//!
//! Every session sits behind its own `parking_lot::Mutex`, held in a
//! `DashMap` keyed by session id. Operations on one session serialize on
//! that mutex; operations on different sessions only meet on map shards.
//! Nothing here is `async` and no lock is held across an `.await`.
//!
//! Lock order:
//! - identity shard → sessions shard (`create`)
//! - session mutex → one map at a time (`expire`, `remove`)
//!
//! The sessions map guard is always dropped before a session mutex is
//! taken (see [`SessionStore::slot`]), so the two orders never interleave.
//!
//! # Removal
//!
//! A removed session's mutex may still be held by a racing caller that
//! looked it up just before. Removal therefore leaves the slot in
//! `Expired` before unlinking it, and records the id as retired first, so
//! every racer observes `Expired` no matter how the race falls.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use sboboz_protocol::{LobbyId, PlayerId, ReconnectToken, SessionId};
use tokio::time::Instant;

use crate::{
    CancelHandle, GraceOutcome, IdentityPolicy, Session, SessionConfig, SessionError,
    SessionState,
};

/// A session plus the bookkeeping that never leaves the store.
struct Slot {
    session: Session,
    /// Pending scheduler entry while in grace.
    expiry: Option<CancelHandle>,
}

impl Slot {
    fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.cancel();
        }
    }
}

/// Registry of every live session.
///
/// ## Lifecycle
///
/// ```text
/// create() ──→ begin_grace() ──→ reconnect() ──→ [Connected]
///                   │
///                   ▼ (deadline passes)
///              expire() ──→ removed, id retired
/// ```
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Slot>>>,

    /// Identity → its live sessions. Only ids present in `sessions` (or
    /// mid-removal, and then already retired) appear here.
    identities: DashMap<PlayerId, Vec<SessionId>>,

    /// Ids of removed sessions and when they were removed.
    retired: DashMap<SessionId, Instant>,

    config: SessionConfig,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            identities: DashMap::new(),
            retired: DashMap::new(),
            config,
        }
    }

    /// The store's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a new `Connected` session for an authenticated identity.
    ///
    /// # Errors
    /// - [`SessionError::IdentityConflict`] under
    ///   [`IdentityPolicy::SingleSession`] when the identity already owns
    ///   a session that hasn't expired.
    /// - [`SessionError::Internal`] if the identity index references a
    ///   session that neither exists nor was retired.
    pub fn create(&self, identity: PlayerId) -> Result<Session, SessionError> {
        let mut owned = self.identities.entry(identity.clone()).or_default();

        // An id can linger here for a moment while its expiry is in flight;
        // it has already been retired, so it no longer counts.
        owned.retain(|id| !self.retired.contains_key(id));
        if let Some(dangling) = owned.iter().find(|id| !self.sessions.contains_key(*id)) {
            tracing::error!(%identity, session_id = %dangling, "identity index references a missing session");
            return Err(SessionError::Internal(format!(
                "identity {identity} references missing session {dangling}"
            )));
        }

        if self.config.identity_policy == IdentityPolicy::SingleSession && !owned.is_empty() {
            return Err(SessionError::IdentityConflict(identity));
        }

        let session = Session {
            session_id: self.fresh_session_id(),
            identity,
            reconnect_token: generate_token(),
            state: SessionState::Connected,
            lobby: None,
            created_at: Instant::now(),
        };

        self.sessions.insert(
            session.session_id.clone(),
            Arc::new(Mutex::new(Slot {
                session: session.clone(),
                expiry: None,
            })),
        );
        owned.push(session.session_id.clone());
        drop(owned);

        tracing::info!(
            session_id = %session.session_id,
            player_id = %session.identity,
            "session created"
        );
        Ok(session)
    }

    /// Moves a connected session into its grace period.
    ///
    /// When the session is already in grace, the earlier of the two
    /// deadlines wins: a later `deadline` changes nothing, an earlier one
    /// replaces the current deadline and cancels its scheduler entry.
    ///
    /// # Errors
    /// [`SessionError::UnknownSession`] if the session doesn't exist (a
    /// retired session included).
    pub fn begin_grace(
        &self,
        session_id: &SessionId,
        deadline: Instant,
    ) -> Result<GraceOutcome, SessionError> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        let mut slot = slot.lock();
        Self::enter_grace(session_id, &mut slot, deadline)
    }

    /// [`begin_grace`](Self::begin_grace) on behalf of the connection that
    /// was handed `token`.
    ///
    /// Returns `Ok(None)` without touching the session when the token has
    /// been rotated since: another connection took the session over, and
    /// this one's loss must not put it into grace.
    ///
    /// # Errors
    /// As [`begin_grace`](Self::begin_grace).
    pub fn begin_grace_for(
        &self,
        session_id: &SessionId,
        token: &ReconnectToken,
        deadline: Instant,
    ) -> Result<Option<GraceOutcome>, SessionError> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        let mut slot = slot.lock();
        if slot.session.state != SessionState::Expired
            && !slot.session.reconnect_token.matches(token)
        {
            tracing::debug!(%session_id, "grace skipped, session was taken over");
            return Ok(None);
        }
        Self::enter_grace(session_id, &mut slot, deadline).map(Some)
    }

    fn enter_grace(
        session_id: &SessionId,
        slot: &mut Slot,
        deadline: Instant,
    ) -> Result<GraceOutcome, SessionError> {
        let outcome = match slot.session.state {
            SessionState::Connected => {
                slot.session.state = SessionState::Grace { deadline };
                GraceOutcome::Started(deadline)
            }
            SessionState::Grace { deadline: current } if deadline < current => {
                slot.session.state = SessionState::Grace { deadline };
                slot.cancel_expiry();
                GraceOutcome::Shortened(deadline)
            }
            SessionState::Grace { deadline: current } => GraceOutcome::Unchanged(current),
            SessionState::Expired => {
                return Err(SessionError::UnknownSession(session_id.clone()));
            }
        };

        tracing::info!(%session_id, ?outcome, "grace period");
        Ok(outcome)
    }

    /// Hands the scheduler's cancel handle to the session, so a reconnect
    /// can cancel the pending expiration.
    ///
    /// If the session has meanwhile left grace (or moved to a different
    /// deadline), the handle is stale and is cancelled on the spot.
    pub fn attach_expiry(&self, session_id: &SessionId, deadline: Instant, handle: CancelHandle) {
        let Some(slot) = self.slot(session_id) else {
            handle.cancel();
            return;
        };
        let mut slot = slot.lock();
        if slot.session.state == (SessionState::Grace { deadline }) {
            if let Some(previous) = slot.expiry.replace(handle) {
                previous.cancel();
            }
        } else {
            handle.cancel();
        }
    }

    /// Recovers a session with its reconnect token.
    ///
    /// On success the session is `Connected`, carries a freshly rotated
    /// token, and any pending expiration is cancelled. The presented token
    /// is dead from this point on.
    ///
    /// A session that is still `Connected` is taken over: its old
    /// connection may be half-open and simply not noticed yet. The token
    /// rotation is what makes that old connection's later disconnect a
    /// no-op (see [`begin_grace_for`](Self::begin_grace_for)).
    ///
    /// # Errors
    /// - [`SessionError::Expired`]: the grace period ran out (or the
    ///   player logged out) before this call won the session lock
    /// - [`SessionError::UnknownSession`]: no such session, ever
    /// - [`SessionError::InvalidToken`]: wrong or stale token
    pub fn reconnect(
        &self,
        session_id: &SessionId,
        token: &ReconnectToken,
    ) -> Result<Session, SessionError> {
        let Some(slot) = self.slot(session_id) else {
            return Err(self.missing(session_id));
        };
        let mut slot = slot.lock();

        match slot.session.state {
            // Expire won the lock; the slot is on its way out.
            SessionState::Expired => return Err(SessionError::Expired(session_id.clone())),
            _ if !slot.session.reconnect_token.matches(token) => {
                tracing::warn!(%session_id, "reconnect with invalid token");
                return Err(SessionError::InvalidToken);
            }
            SessionState::Connected => {
                tracing::info!(%session_id, "session taken over by a new connection");
            }
            SessionState::Grace { .. } => {}
        }

        slot.session.state = SessionState::Connected;
        slot.session.reconnect_token = generate_token();
        slot.cancel_expiry();

        tracing::info!(%session_id, player_id = %slot.session.identity, "session reconnected");
        Ok(slot.session.clone())
    }

    /// Expires a session in grace and removes it.
    ///
    /// No-op (`None`) unless the session is currently in grace: a
    /// reconnect that got there first wins.
    pub fn expire(&self, session_id: &SessionId) -> Option<Session> {
        self.expire_when(session_id, |_| true)
    }

    /// Like [`expire`](Self::expire), but only if the grace deadline has
    /// passed at `now`.
    ///
    /// This is what the scheduler's firings go through. A firing left over
    /// from an earlier grace period (its cancel lost the race) finds a
    /// later deadline and does nothing.
    pub fn expire_if_due(&self, session_id: &SessionId, now: Instant) -> Option<Session> {
        self.expire_when(session_id, |deadline| deadline <= now)
    }

    fn expire_when(
        &self,
        session_id: &SessionId,
        due: impl FnOnce(Instant) -> bool,
    ) -> Option<Session> {
        let slot = self.slot(session_id)?;
        let mut slot = slot.lock();

        let SessionState::Grace { deadline } = slot.session.state else {
            tracing::debug!(
                %session_id,
                state = slot.session.state.name(),
                "expire skipped, session not in grace"
            );
            return None;
        };
        if !due(deadline) {
            return None;
        }

        let session = self.unlink(session_id, &mut slot);
        tracing::info!(%session_id, player_id = %session.identity, "session expired");
        Some(session)
    }

    /// Removes a session in any state (explicit logout).
    ///
    /// # Errors
    /// [`SessionError::Expired`] if it was already removed,
    /// [`SessionError::UnknownSession`] if it never existed.
    pub fn remove(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        let Some(slot) = self.slot(session_id) else {
            return Err(self.missing(session_id));
        };
        let mut slot = slot.lock();
        if slot.session.state == SessionState::Expired {
            return Err(SessionError::Expired(session_id.clone()));
        }

        let session = self.unlink(session_id, &mut slot);
        tracing::info!(%session_id, player_id = %session.identity, "session removed");
        Ok(session)
    }

    /// Sets (or clears) the session's lobby link and returns the previous
    /// one.
    ///
    /// # Errors
    /// [`SessionError::UnknownSession`] / [`SessionError::Expired`] if the
    /// session is gone.
    pub fn set_lobby(
        &self,
        session_id: &SessionId,
        lobby: Option<LobbyId>,
    ) -> Result<Option<LobbyId>, SessionError> {
        let Some(slot) = self.slot(session_id) else {
            return Err(self.missing(session_id));
        };
        let mut slot = slot.lock();
        if slot.session.state == SessionState::Expired {
            return Err(SessionError::Expired(session_id.clone()));
        }
        Ok(std::mem::replace(&mut slot.session.lobby, lobby))
    }

    /// Snapshot of a session.
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        let slot = self.slot(session_id)?;
        let slot = slot.lock();
        Some(slot.session.clone())
    }

    /// Live sessions owned by `identity`.
    pub fn sessions_of(&self, identity: &PlayerId) -> Vec<SessionId> {
        self.identities
            .get(identity)
            .map(|owned| owned.value().clone())
            .unwrap_or_default()
    }

    /// Returns the number of live sessions (connected or in grace).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of remembered retired ids.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Forgets retired ids older than the retention window. Returns how many
    /// were dropped.
    pub fn purge_retired(&self, now: Instant) -> usize {
        let retention = self.config.retired_retention;
        let before = self.retired.len();
        self.retired
            .retain(|_, retired_at| now.saturating_duration_since(*retired_at) < retention);
        before.saturating_sub(self.retired.len())
    }

    /// Clones the session's `Arc` out of the map so the shard guard is
    /// released before the caller locks the session.
    fn slot(&self, session_id: &SessionId) -> Option<Arc<Mutex<Slot>>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// The error for an id with no live slot.
    fn missing(&self, session_id: &SessionId) -> SessionError {
        if self.retired.contains_key(session_id) {
            SessionError::Expired(session_id.clone())
        } else {
            SessionError::UnknownSession(session_id.clone())
        }
    }

    /// Tombstones the slot and drops every index entry for it. The caller
    /// holds the slot's lock.
    fn unlink(&self, session_id: &SessionId, slot: &mut Slot) -> Session {
        slot.session.state = SessionState::Expired;
        slot.cancel_expiry();

        // Retire before unlinking so a lookup that misses the slot still
        // reports `Expired`.
        self.retired.insert(session_id.clone(), Instant::now());
        self.sessions.remove(session_id);

        let identity = &slot.session.identity;
        if let Some(mut owned) = self.identities.get_mut(identity) {
            owned.retain(|id| id != session_id);
        }
        self.identities.remove_if(identity, |_, owned| owned.is_empty());

        slot.session.clone()
    }

    /// Random ids are unique in practice; the loop makes it a guarantee
    /// against both live and retired ids.
    fn fresh_session_id(&self) -> SessionId {
        loop {
            let id = SessionId::new(random_hex());
            if !self.sessions.contains_key(&id) && !self.retired.contains_key(&id) {
                return id;
            }
        }
    }
}

/// 16 random bytes (128 bits) as 32 lowercase hex characters.
fn random_hex() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_token() -> ReconnectToken {
    ReconnectToken::new(random_hex())
}

// =========================================================================
// Tests
// =========================================================================
