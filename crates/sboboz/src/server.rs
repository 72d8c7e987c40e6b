//! `SbobozServer` builder and the realtime socket accept loop.
//!
//! Ties the layers together: transport → protocol → session gateway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sboboz_protocol::{Codec, JsonCodec};
use sboboz_session::{
    Authenticator, ConnectionGateway, LobbyNotifier, SessionConfig, TracingLobby,
};
use sboboz_transport::{Transport, WebSocketTransport};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::SbobozError;
use crate::handler::handle_connection;

/// How long a client has to send its `Handshake`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection with no inbound frame for this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long shutdown waits for connection handlers to say goodbye before
/// aborting them.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. The gateway
/// is internally synchronized, so nothing here needs an outer lock.
pub(crate) struct ServerState<A: Authenticator, C: Codec, L: LobbyNotifier> {
    pub(crate) gateway: ConnectionGateway<L>,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) handshake_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

/// Builder for configuring and starting a Sboboz socket server.
///
/// # Example
///
/// ```rust,ignore
/// use sboboz::prelude::*;
///
/// let server = SbobozServer::builder()
///     .bind("0.0.0.0:3001")
///     .build(DevAuthenticator)
///     .await?;
/// server.run(shutdown_signal()).await
/// ```
pub struct SbobozServerBuilder<L: LobbyNotifier = TracingLobby> {
    bind_addr: String,
    session_config: SessionConfig,
    lobby: L,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

impl SbobozServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            session_config: SessionConfig::default(),
            lobby: TracingLobby,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

impl<L: LobbyNotifier> SbobozServerBuilder<L> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Sets the receiver of lobby presence changes.
    pub fn lobby<L2: LobbyNotifier>(self, lobby: L2) -> SbobozServerBuilder<L2> {
        SbobozServerBuilder {
            bind_addr: self.bind_addr,
            session_config: self.session_config,
            lobby,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Sets how long a client may idle before it is dropped.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Binds the socket and builds the server with the given authenticator.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<A: Authenticator>(
        self,
        auth: A,
    ) -> Result<SbobozServer<A, JsonCodec, L>, SbobozError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let state = Arc::new(ServerState {
            gateway: ConnectionGateway::new(self.session_config, self.lobby),
            auth,
            codec: JsonCodec,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
        });

        Ok(SbobozServer { transport, state })
    }
}

impl Default for SbobozServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Sboboz socket server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct SbobozServer<A: Authenticator, C: Codec, L: LobbyNotifier = TracingLobby> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, C, L>>,
}

impl SbobozServer<crate::DevAuthenticator, JsonCodec> {
    /// Creates a new builder.
    pub fn builder() -> SbobozServerBuilder {
        SbobozServerBuilder::new()
    }
}

impl<A, C, L> SbobozServer<A, C, L>
where
    A: Authenticator,
    C: Codec,
    L: LobbyNotifier,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The session gateway every connection goes through.
    pub fn gateway(&self) -> &ConnectionGateway<L> {
        &self.state.gateway
    }

    /// Runs the accept loop and the expiration driver until `shutdown`
    /// resolves.
    ///
    /// Each accepted connection gets its own task. On shutdown, live
    /// connections are told so and their sessions enter grace; this
    /// returns once every handler has finished, or after
    /// [`SHUTDOWN_TIMEOUT`] with the stragglers aborted.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), SbobozError> {
        tracing::info!(addr = ?self.local_addr().ok(), "Sboboz socket server running");

        let (stop_tx, stop_rx) = watch::channel(false);

        let expirations = {
            let state = Arc::clone(&self.state);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                state
                    .gateway
                    .run_expirations(async move {
                        let _ = stop.wait_for(|stopped| *stopped).await;
                    })
                    .await;
            })
        };

        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "connection handler panicked");
                    }
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        let stop = stop_rx.clone();
                        handlers.spawn(async move {
                            if let Err(e) = handle_connection(conn, state, stop).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        tracing::info!(connections = handlers.len(), "Sboboz socket server shutting down");
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = handlers.len(),
                "connection handlers still running after shutdown timeout, aborting"
            );
            handlers.shutdown().await;
        }
        if let Err(e) = expirations.await {
            tracing::error!(error = %e, "expiration driver panicked");
        }
        Ok(())
    }
}
