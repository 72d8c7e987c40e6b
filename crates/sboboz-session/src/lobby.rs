//! Hook into the lobby/game service.
//!
//! Sessions only know their lobby by id. Whatever owns lobbies hears about
//! presence changes through [`LobbyNotifier`]; the gateway calls it after
//! releasing every session lock, so an implementation may take its own
//! locks freely but should hand slow work to a task.

use sboboz_protocol::LobbyId;

use crate::Session;

/// Why a player left a lobby for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The grace period ran out.
    Expired,
    /// The player logged out.
    Logout,
    /// The player left the lobby but kept the session.
    Left,
}

/// Receives presence changes for sessions linked to a lobby.
///
/// Every method has an empty default, so implementations only override
/// what they care about.
pub trait LobbyNotifier: Send + Sync + 'static {
    /// The player's connection dropped; they may still come back.
    fn player_absent(&self, _session: &Session, _lobby: &LobbyId) {}

    /// The player reconnected within the grace period.
    fn player_returned(&self, _session: &Session, _lobby: &LobbyId) {}

    /// The player is gone from the lobby.
    fn player_left(&self, _session: &Session, _lobby: &LobbyId, _reason: LeaveReason) {}
}

/// Ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLobby;

impl LobbyNotifier for NoopLobby {}

/// Logs every notification. The default until a lobby service exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLobby;

impl LobbyNotifier for TracingLobby {
    fn player_absent(&self, session: &Session, lobby: &LobbyId) {
        tracing::info!(
            session_id = %session.session_id,
            player_id = %session.identity,
            %lobby,
            "player temporarily absent from lobby"
        );
    }

    fn player_returned(&self, session: &Session, lobby: &LobbyId) {
        tracing::info!(
            session_id = %session.session_id,
            player_id = %session.identity,
            %lobby,
            "player returned to lobby"
        );
    }

    fn player_left(&self, session: &Session, lobby: &LobbyId, reason: LeaveReason) {
        tracing::info!(
            session_id = %session.session_id,
            player_id = %session.identity,
            %lobby,
            ?reason,
            "player left lobby"
        );
    }
}
