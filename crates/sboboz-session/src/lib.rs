//! Player session management for the Sboboz backend.
//!
//! This crate keeps a player's presence alive across flaky connections:
//!
//! 1. **Authentication** — who a player is ([`Authenticator`] trait)
//! 2. **Session store** — who is connected, who is in grace
//!    ([`SessionStore`])
//! 3. **Grace-period scheduler** — when disconnected sessions expire
//!    ([`GraceScheduler`])
//! 4. **Connection gateway** — binds transport connections to sessions and
//!    recovers them from reconnect tokens ([`ConnectionGateway`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Lobby/game service (external)  ← hears about presence via LobbyNotifier
//!     ↕
//! Session layer (this crate)  ← player identity and connection state
//!     ↕
//! Protocol/transport (below)  ← SessionId, ReconnectToken, ConnectionId
//! ```

mod auth;
mod error;
mod gateway;
mod lobby;
mod scheduler;
mod session;
mod store;

pub use auth::Authenticator;
pub use error::SessionError;
pub use gateway::{ConnectionGateway, DisconnectReason, SessionHandle};
pub use lobby::{LeaveReason, LobbyNotifier, NoopLobby, TracingLobby};
pub use scheduler::{CancelHandle, Expiry, GraceScheduler};
pub use session::{GraceOutcome, IdentityPolicy, Session, SessionConfig, SessionState};
pub use store::SessionStore;
