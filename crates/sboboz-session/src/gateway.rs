//! Connection gateway: binds transport connections to sessions.
//!
//! The per-connection handler calls [`ConnectionGateway::on_connect`] after
//! the handshake and [`ConnectionGateway::on_disconnect`] when the socket
//! goes away. Between the two, the gateway keeps a table of which
//! connection is live for which session, so a session never has two. A
//! resume with the current token takes the session over from its old
//! connection, which is told to close through
//! [`SessionHandle::superseded`].
//!
//! Disconnects don't end sessions. They start a grace period and schedule
//! an expiration; [`ConnectionGateway::run_expirations`] drives those.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sboboz_protocol::{LobbyId, PlayerId, ReconnectToken, ResumeCredentials, SessionId};
use sboboz_transport::ConnectionId;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::{
    Expiry, GraceScheduler, LeaveReason, LobbyNotifier, Session, SessionConfig, SessionError,
    SessionStore, TracingLobby,
};

/// What the transport layer gets back for a bound connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub identity: PlayerId,
    /// Token to hand to the client. Replaces any token it held before.
    pub reconnect_token: ReconnectToken,
    pub connection_id: ConnectionId,
    pub lobby: Option<LobbyId>,
    /// `true` if an existing session was recovered.
    pub resumed: bool,
    kick: Arc<Notify>,
}

impl SessionHandle {
    fn new(session: Session, live: &LiveConnection, resumed: bool) -> Self {
        Self {
            session_id: session.session_id,
            identity: session.identity,
            reconnect_token: session.reconnect_token,
            connection_id: live.id,
            lobby: session.lobby,
            resumed,
            kick: Arc::clone(&live.kick),
        }
    }

    /// Resolves once another connection has taken this session over.
    ///
    /// The connection should then close; its disconnect no longer affects
    /// the session.
    pub async fn superseded(&self) {
        self.kick.notified().await;
    }
}

/// A session's bound connection and the signal that closes it.
#[derive(Clone)]
struct LiveConnection {
    id: ConnectionId,
    kick: Arc<Notify>,
}

impl LiveConnection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            kick: Arc::new(Notify::new()),
        }
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket, or sent `Disconnect`.
    ClientClosed(String),
    /// Reading or writing the socket failed.
    TransportError(String),
    /// Nothing arrived within the idle timeout.
    IdleTimeout,
    /// The server is shutting down.
    ServerShutdown,
    /// A resume on another connection took the session over.
    Superseded,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed(reason) if reason.is_empty() => f.write_str("client closed"),
            Self::ClientClosed(reason) => write!(f, "client closed: {reason}"),
            Self::TransportError(err) => write!(f, "transport error: {err}"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::ServerShutdown => f.write_str("server shutdown"),
            Self::Superseded => f.write_str("superseded by a new connection"),
        }
    }
}

/// Owns the live-connection table and drives session transitions.
pub struct ConnectionGateway<L: LobbyNotifier = TracingLobby> {
    store: Arc<SessionStore>,
    scheduler: Arc<GraceScheduler>,
    lobby: L,
    config: SessionConfig,
    /// Session → its one live connection.
    live: DashMap<SessionId, LiveConnection>,
}

impl<L: LobbyNotifier> ConnectionGateway<L> {
    /// Creates a gateway with a fresh store and scheduler.
    pub fn new(config: SessionConfig, lobby: L) -> Self {
        let store = Arc::new(SessionStore::new(config.clone()));
        Self::with_parts(store, Arc::new(GraceScheduler::new()), lobby, config)
    }

    /// Creates a gateway around an existing store and scheduler.
    pub fn with_parts(
        store: Arc<SessionStore>,
        scheduler: Arc<GraceScheduler>,
        lobby: L,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            lobby,
            config,
            live: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<GraceScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The connection currently bound to `session_id`, if any.
    pub fn live_connection(&self, session_id: &SessionId) -> Option<ConnectionId> {
        self.live.get(session_id).map(|c| c.id)
    }

    /// Number of sessions with a live connection.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Binds a new connection to a session.
    ///
    /// With `resume`, tries to recover that session. A session that still
    /// has a live connection is taken over, and the old connection's
    /// handle reports [`SessionHandle::superseded`]. A resume the client
    /// can fix (bad or stale token, expired, unknown) falls back to a
    /// fresh login for `identity`; old state is never reused. With no
    /// `identity` to fall back on, the resume error is returned so the
    /// client knows to authenticate.
    ///
    /// # Errors
    /// - the resume error, when there's no identity to fall back on
    /// - [`SessionError::AuthFailed`] with neither resume nor identity
    /// - [`SessionError::IdentityConflict`] from the fresh login
    /// - [`SessionError::Internal`] on a broken live-connection table
    pub fn on_connect(
        &self,
        connection_id: ConnectionId,
        identity: Option<PlayerId>,
        resume: Option<ResumeCredentials>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(resume) = resume {
            match self.resume(connection_id, identity.as_ref(), &resume) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_client_correctable() && identity.is_some() => {
                    tracing::warn!(
                        %connection_id,
                        session_id = %resume.session_id,
                        error = %e,
                        "resume rejected, treating as fresh login"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let identity = identity.ok_or_else(|| {
            SessionError::AuthFailed("an auth token is required to start a session".into())
        })?;
        let session = self.store.create(identity)?;
        let live = self.bind(&session.session_id, connection_id)?;

        tracing::info!(
            %connection_id,
            session_id = %session.session_id,
            player_id = %session.identity,
            "connection bound to new session"
        );
        Ok(SessionHandle::new(session, &live, false))
    }

    fn resume(
        &self,
        connection_id: ConnectionId,
        identity: Option<&PlayerId>,
        resume: &ResumeCredentials,
    ) -> Result<SessionHandle, SessionError> {
        // A session's identity never changes, so checking it before taking
        // the session lock is safe.
        if let Some(expected) = identity {
            let owner = self.store.get(&resume.session_id).map(|s| s.identity);
            if owner.is_some_and(|owner| &owner != expected) {
                return Err(SessionError::InvalidToken);
            }
        }

        let session = self
            .store
            .reconnect(&resume.session_id, &resume.reconnect_token)?;

        // The token just rotated, so the replaced connection's disconnect
        // can no longer start a grace period.
        let live = LiveConnection::new(connection_id);
        let handle = SessionHandle::new(session.clone(), &live, true);
        match self.live.insert(session.session_id.clone(), live) {
            Some(previous) => {
                tracing::info!(
                    session_id = %session.session_id,
                    superseded = %previous.id,
                    %connection_id,
                    "session taken over from live connection"
                );
                previous.kick.notify_one();
            }
            None => {
                if let Some(lobby) = &session.lobby {
                    self.lobby.player_returned(&session, lobby);
                }
            }
        }
        tracing::info!(
            %connection_id,
            session_id = %session.session_id,
            "connection resumed session"
        );
        Ok(handle)
    }

    /// Records `connection_id` as a new session's live connection.
    fn bind(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
    ) -> Result<LiveConnection, SessionError> {
        match self.live.entry(session_id.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get().id;
                tracing::error!(
                    %session_id,
                    %existing,
                    %connection_id,
                    "session already has a live connection"
                );
                Err(SessionError::Internal(format!(
                    "session {session_id} bound to {existing} and {connection_id}"
                )))
            }
            Entry::Vacant(slot) => {
                let live = LiveConnection::new(connection_id);
                slot.insert(live.clone());
                Ok(live)
            }
        }
    }

    /// Handles a dropped connection: starts the session's grace period and
    /// schedules its expiration.
    ///
    /// Returns the deadline in force, or `None` when nothing happened: the
    /// handle's connection is not (or no longer) the live one, or a zero
    /// grace window expired the session on the spot.
    ///
    /// # Errors
    /// - [`SessionError::UnknownSession`] if the session vanished
    /// - [`SessionError::Internal`] if the grace window overflows the clock;
    ///   the session is left untouched
    pub fn on_disconnect(
        &self,
        handle: &SessionHandle,
        reason: DisconnectReason,
    ) -> Result<Option<Instant>, SessionError> {
        let session_id = &handle.session_id;
        let Some(deadline) = Instant::now().checked_add(self.config.grace_window) else {
            tracing::error!(
                %session_id,
                grace_window = ?self.config.grace_window,
                "grace window overflows the clock"
            );
            return Err(SessionError::Internal(format!(
                "grace window of {:?} is out of range",
                self.config.grace_window
            )));
        };

        let released = self
            .live
            .remove_if(session_id, |_, live| live.id == handle.connection_id);
        if released.is_none() {
            tracing::debug!(
                %session_id,
                connection_id = %handle.connection_id,
                "disconnect from a connection that isn't live, ignoring"
            );
            return Ok(None);
        }

        tracing::info!(%session_id, connection_id = %handle.connection_id, %reason, "connection lost");

        let Some(outcome) =
            self.store
                .begin_grace_for(session_id, &handle.reconnect_token, deadline)?
        else {
            return Ok(None);
        };

        if self.config.grace_window.is_zero() {
            if let Some(session) = self.store.expire(session_id) {
                self.notify_left(&session, LeaveReason::Expired);
            }
            return Ok(None);
        }

        if outcome.needs_schedule() {
            let cancel = self.scheduler.schedule(session_id.clone(), outcome.deadline());
            self.store.attach_expiry(session_id, outcome.deadline(), cancel);
        }

        if let Some(session) = self.store.get(session_id) {
            if let Some(lobby) = &session.lobby {
                self.lobby.player_absent(&session, lobby);
            }
        }
        Ok(Some(outcome.deadline()))
    }

    /// Ends the session for good, without a grace period.
    ///
    /// A connection that was superseded no longer speaks for the session;
    /// its logout is ignored.
    ///
    /// # Errors
    /// Whatever [`SessionStore::remove`] reports for a session that is
    /// already gone.
    pub fn logout(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let released = self
            .live
            .remove_if(&handle.session_id, |_, live| live.id == handle.connection_id);
        if released.is_none() && self.live.contains_key(&handle.session_id) {
            tracing::debug!(
                session_id = %handle.session_id,
                connection_id = %handle.connection_id,
                "logout from a superseded connection, ignoring"
            );
            return Ok(());
        }
        let session = self.store.remove(&handle.session_id)?;
        self.notify_left(&session, LeaveReason::Logout);
        Ok(())
    }

    /// Links the session to a lobby, leaving any previous one.
    ///
    /// # Errors
    /// If the session is gone.
    pub fn join_lobby(&self, handle: &SessionHandle, lobby: LobbyId) -> Result<(), SessionError> {
        let previous = self.store.set_lobby(&handle.session_id, Some(lobby.clone()))?;
        tracing::info!(session_id = %handle.session_id, %lobby, "session joined lobby");
        if let Some(previous) = previous.filter(|p| *p != lobby) {
            if let Some(session) = self.store.get(&handle.session_id) {
                self.lobby.player_left(&session, &previous, LeaveReason::Left);
            }
        }
        Ok(())
    }

    /// Drops the session's lobby link. Returns the lobby it was in.
    ///
    /// # Errors
    /// If the session is gone.
    pub fn leave_lobby(&self, handle: &SessionHandle) -> Result<Option<LobbyId>, SessionError> {
        let previous = self.store.set_lobby(&handle.session_id, None)?;
        if let Some(lobby) = &previous {
            if let Some(session) = self.store.get(&handle.session_id) {
                self.lobby.player_left(&session, lobby, LeaveReason::Left);
            }
        }
        Ok(previous)
    }

    /// Expires every session whose scheduled deadline is `<= now`.
    /// Returns the sessions that were actually removed.
    pub fn expire_due(&self, now: Instant) -> Vec<Session> {
        let fired = self.scheduler.pop_due(now);
        self.apply_expirations(fired, now)
    }

    /// The expiration driver. Runs until `shutdown` resolves.
    ///
    /// Besides firing expirations, it purges retired ids once per retention
    /// window.
    pub async fn run_expirations(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut purge = time::interval(self.config.retired_retention.max(time::Duration::from_secs(1)));
        purge.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        tracing::debug!("expiration driver started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                fired = self.scheduler.wait_due() => {
                    self.apply_expirations(fired, Instant::now());
                }
                _ = purge.tick() => {
                    let purged = self.store.purge_retired(Instant::now());
                    if purged > 0 {
                        tracing::debug!(purged, "retired session ids purged");
                    }
                }
            }
        }
        tracing::debug!("expiration driver stopped");
    }

    fn apply_expirations(&self, fired: Vec<Expiry>, now: Instant) -> Vec<Session> {
        let mut expired = Vec::new();
        for expiry in fired {
            if let Some(session) = self.store.expire_if_due(&expiry.session_id, now) {
                self.notify_left(&session, LeaveReason::Expired);
                expired.push(session);
            }
        }
        expired
    }

    fn notify_left(&self, session: &Session, reason: LeaveReason) {
        if let Some(lobby) = &session.lobby {
            self.lobby.player_left(session, lobby, reason);
        }
    }
}

impl Default for ConnectionGateway<TracingLobby> {
    fn default() -> Self {
        Self::new(SessionConfig::default(), TracingLobby)
    }
}
