//! Core protocol types for the Sboboz socket wire format.
//!
//! Everything in this module travels "on the wire": the identifiers the
//! server hands out, and the messages client and server exchange over the
//! realtime socket.

use serde::{Deserialize, Serialize};

use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The stable identity of a player, as resolved by the identity provider.
///
/// Identity providers hand out string ids (e.g. `"698a195a0001c5847a94"`),
/// so this wraps a `String` rather than a number. The newtype keeps it
/// from being confused with a [`SessionId`] even though both are strings
/// underneath.
///
/// `#[serde(transparent)]` serializes `PlayerId("abc")` as plain `"abc"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Creates a player id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// Opaque identifier of one player session.
///
/// Generated once per login by the session layer and never reused. Clients
/// store it alongside their [`ReconnectToken`] and present both when they
/// come back after a dropped connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an already-generated id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// A rotating credential proving continuity of a session across reconnects.
///
/// Every layer above the session store treats this as an uninterpreted
/// string. It is deliberately NOT `Display`, and its `Debug` output is
/// redacted, so a stray `tracing` field can't leak it into logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconnectToken(String);

impl ReconnectToken {
    /// Wraps an already-generated token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token, for handing to the transport layer.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares two tokens without short-circuiting on the first
    /// mismatching byte.
    pub fn matches(&self, presented: &ReconnectToken) -> bool {
        let a = self.0.as_bytes();
        let b = presented.0.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReconnectToken(<redacted>)")
    }
}

/// Identifier of a lobby or running game.
///
/// Sessions only ever hold this id (a weak reference); lobby lifecycle
/// belongs to the lobby service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(pub String);

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ResumeCredentials
// ---------------------------------------------------------------------------

/// What a returning client presents to pick up its previous session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCredentials {
    /// The session the client was part of.
    pub session_id: SessionId,
    /// The most recent token the server issued for that session.
    pub reconnect_token: ReconnectToken,
}

// ---------------------------------------------------------------------------
// SocketMessage
// ---------------------------------------------------------------------------

/// Every message exchanged over the realtime socket.
///
/// `#[serde(tag = "type")]` produces internally tagged JSON:
///   `{ "type": "Ping", "client_time": 12 }`
/// which is what JavaScript/Dart clients find easiest to switch on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SocketMessage {
    // -- Connection lifecycle --

    /// Client → Server: first frame on every connection.
    ///
    /// `auth_token` is the identity provider's credential; it is needed
    /// for a fresh login. `resume` carries the previous session's
    /// credentials when the client is coming back after a drop.
    Handshake {
        version: u32,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        resume: Option<ResumeCredentials>,
    },

    /// Server → Client: the connection is bound to a session.
    ///
    /// `resumed` is `true` when the previous session was recovered. The
    /// client must replace any stored token with `reconnect_token`: the old
    /// one stops working the moment this frame is sent.
    HandshakeAck {
        player_id: PlayerId,
        session_id: SessionId,
        reconnect_token: ReconnectToken,
        resumed: bool,
        grace_window_secs: u64,
        server_time: u64,
    },

    /// Either direction: "I'm closing this connection."
    /// The session survives for the grace window.
    Disconnect { reason: String },

    /// Client → Server: end the session for good. No grace period.
    Logout,

    // -- Echo --

    /// Client → Server: liveness check.
    Ping {
        #[serde(default)]
        client_time: Option<u64>,
    },

    /// Server → Client: answer to [`SocketMessage::Ping`].
    /// `server_time` is unix milliseconds.
    Pong {
        client_time: Option<u64>,
        server_time: u64,
    },

    // -- Lobby association --

    /// Client → Server: associate this session with a lobby.
    JoinLobby { lobby_id: LobbyId },

    /// Client → Server: drop the lobby association.
    LeaveLobby,

    /// Server → Client: the session's current lobby association.
    LobbyUpdated { lobby_id: Option<LobbyId> },

    // -- Errors --

    /// Server → Client: "Something went wrong."
    /// `code` follows HTTP conventions (400, 401, 409, 500).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level frame. Every socket message is wrapped in one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-side, auto-incrementing sequence number.
    pub seq: u64,

    /// Milliseconds since the sender's connection started.
    pub timestamp: u64,

    pub message: SocketMessage,
}
