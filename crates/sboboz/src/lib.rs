//! # Sboboz
//!
//! Backend for Sboboz 104: an HTTP API and a realtime socket whose players
//! survive dropped connections.
//!
//! A player's session outlives any one socket. When the socket drops, the
//! session waits out a grace period; a client that comes back with its
//! reconnect token picks up where it left off, lobby included.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sboboz::prelude::*;
//!
//! # async fn run() -> Result<(), SbobozError> {
//! let server = SbobozServer::builder()
//!     .bind("0.0.0.0:3001")
//!     .build(DevAuthenticator)
//!     .await?;
//! server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

mod auth;
mod config;
mod error;
mod handler;
pub mod http;
mod server;

pub use auth::DevAuthenticator;
pub use config::ServerConfig;
pub use error::SbobozError;
pub use server::{
    HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, SHUTDOWN_TIMEOUT, SbobozServer, SbobozServerBuilder,
};

pub mod prelude {
    //! Everything needed to run a server and talk to it.

    pub use crate::{DevAuthenticator, SbobozError, SbobozServer, SbobozServerBuilder, ServerConfig};
    pub use sboboz_protocol::{
        Codec, Envelope, JsonCodec, LobbyId, PROTOCOL_VERSION, PlayerId, ReconnectToken,
        ResumeCredentials, SessionId, SocketMessage,
    };
    pub use sboboz_session::{
        Authenticator, ConnectionGateway, IdentityPolicy, LeaveReason, LobbyNotifier, NoopLobby,
        SessionConfig, SessionError, SessionStore, TracingLobby,
    };
}
