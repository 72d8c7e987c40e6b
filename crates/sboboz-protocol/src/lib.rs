//! Wire protocol for the Sboboz realtime socket.
//!
//! - **Types** ([`Envelope`], [`SocketMessage`], and the identifier
//!   newtypes [`PlayerId`], [`SessionId`], [`ReconnectToken`], [`LobbyId`])
//! - **Codec** ([`Codec`] trait, [`JsonCodec`])
//! - **Errors** ([`ProtocolError`])
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session (player presence)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    Envelope, LobbyId, PlayerId, ReconnectToken, ResumeCredentials, SessionId,
    SocketMessage,
};

/// Version clients must announce in their handshake.
pub const PROTOCOL_VERSION: u32 = 1;
