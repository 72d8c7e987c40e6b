//! Per-connection handler: handshake, session binding, and message routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → validate version
//!   2. Authenticate token (if any) → get PlayerId
//!   3. Bind to a session through the gateway (fresh or resumed)
//!   4. Send HandshakeAck with the session id and a fresh reconnect token
//!   5. Loop: receive envelopes → ping, lobby, logout, disconnect
//!   6. On exit, hand the session to the grace period (a no-op once another
//!      connection has taken the session over)

use std::sync::Arc;
use std::time::Instant;

use sboboz_protocol::{Codec, Envelope, PROTOCOL_VERSION, ProtocolError, SocketMessage};
use sboboz_session::{
    Authenticator, DisconnectReason, LobbyNotifier, SessionError, SessionHandle,
};
use sboboz_transport::{Connection, WebSocketConnection};
use tokio::sync::watch;

use crate::SbobozError;
use crate::server::ServerState;

/// Drop guard that starts the session's grace period when the handler
/// exits.
///
/// Runs even if the handler panics or its task is aborted. The gateway is
/// synchronous, so nothing needs to be spawned from `drop`.
struct SessionGuard<'a, A: Authenticator, C: Codec, L: LobbyNotifier> {
    handle: SessionHandle,
    state: &'a ServerState<A, C, L>,
    reason: DisconnectReason,
    armed: bool,
}

impl<A: Authenticator, C: Codec, L: LobbyNotifier> SessionGuard<'_, A, C, L> {
    /// The session ended some other way (logout); skip the grace period.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<A: Authenticator, C: Codec, L: LobbyNotifier> Drop for SessionGuard<'_, A, C, L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = std::mem::replace(
            &mut self.reason,
            DisconnectReason::ClientClosed(String::new()),
        );
        if let Err(e) = self.state.gateway.on_disconnect(&self.handle, reason) {
            tracing::warn!(
                session_id = %self.handle.session_id,
                error = %e,
                "disconnect bookkeeping failed"
            );
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, C, L>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, C, L>>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SbobozError>
where
    A: Authenticator,
    C: Codec,
    L: LobbyNotifier,
{
    let conn_id = conn.id();
    let start = Instant::now();
    tracing::debug!(%conn_id, peer = %conn.peer_addr(), "handling new connection");

    // --- Step 1: Handshake and session binding ---
    let handle = perform_handshake(&conn, &state, &start).await?;

    // From here on, leaving this function puts the session into grace.
    let mut guard = SessionGuard {
        handle: handle.clone(),
        state: &state,
        reason: DisconnectReason::ClientClosed(String::new()),
        armed: true,
    };

    let ack = Envelope {
        seq: 0,
        timestamp: elapsed_ms(&start),
        message: SocketMessage::HandshakeAck {
            player_id: handle.identity.clone(),
            session_id: handle.session_id.clone(),
            reconnect_token: handle.reconnect_token.clone(),
            resumed: handle.resumed,
            grace_window_secs: state.gateway.config().grace_window.as_secs(),
            server_time: unix_ms(),
        },
    };
    if let Err(e) = send(&conn, &state.codec, &ack).await {
        guard.reason = DisconnectReason::TransportError(e.to_string());
        return Err(e);
    }

    // --- Step 2: Message loop ---
    let mut seq: u64 = 1;

    loop {
        let received = tokio::select! {
            _ = stop.changed() => {
                tracing::info!(%conn_id, session_id = %handle.session_id, "closing for shutdown");
                let bye = Envelope {
                    seq: next_seq(&mut seq),
                    timestamp: elapsed_ms(&start),
                    message: SocketMessage::Disconnect { reason: "server shutdown".into() },
                };
                let _ = send(&conn, &state.codec, &bye).await;
                let _ = conn.close().await;
                guard.reason = DisconnectReason::ServerShutdown;
                break;
            }
            _ = handle.superseded() => {
                tracing::info!(%conn_id, session_id = %handle.session_id, "session resumed elsewhere, closing");
                let bye = Envelope {
                    seq: next_seq(&mut seq),
                    timestamp: elapsed_ms(&start),
                    message: SocketMessage::Disconnect { reason: "session resumed elsewhere".into() },
                };
                let _ = send(&conn, &state.codec, &bye).await;
                let _ = conn.close().await;
                guard.reason = DisconnectReason::Superseded;
                break;
            }
            received = tokio::time::timeout(state.idle_timeout, conn.recv()) => received,
        };

        let data = match received {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::debug!(%conn_id, "connection closed cleanly");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                guard.reason = DisconnectReason::TransportError(e.to_string());
                break;
            }
            Err(_) => {
                tracing::info!(%conn_id, session_id = %handle.session_id, "connection idle, dropping");
                guard.reason = DisconnectReason::IdleTimeout;
                break;
            }
        };

        let envelope: Envelope = match state.codec.decode(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                send_error(&conn, &state.codec, 400, "malformed message", next_seq(&mut seq), &start)
                    .await?;
                continue;
            }
        };

        match envelope.message {
            SocketMessage::Ping { client_time } => {
                tracing::trace!(%conn_id, "ping");
                let pong = Envelope {
                    seq: next_seq(&mut seq),
                    timestamp: elapsed_ms(&start),
                    message: SocketMessage::Pong {
                        client_time,
                        server_time: unix_ms(),
                    },
                };
                send(&conn, &state.codec, &pong).await?;
            }

            SocketMessage::JoinLobby { lobby_id } => {
                let reply = match state.gateway.join_lobby(&handle, lobby_id.clone()) {
                    Ok(()) => SocketMessage::LobbyUpdated { lobby_id: Some(lobby_id) },
                    Err(e) => session_error_message(&e),
                };
                let envelope = Envelope {
                    seq: next_seq(&mut seq),
                    timestamp: elapsed_ms(&start),
                    message: reply,
                };
                send(&conn, &state.codec, &envelope).await?;
            }

            SocketMessage::LeaveLobby => {
                let reply = match state.gateway.leave_lobby(&handle) {
                    Ok(_) => SocketMessage::LobbyUpdated { lobby_id: None },
                    Err(e) => session_error_message(&e),
                };
                let envelope = Envelope {
                    seq: next_seq(&mut seq),
                    timestamp: elapsed_ms(&start),
                    message: reply,
                };
                send(&conn, &state.codec, &envelope).await?;
            }

            SocketMessage::Logout => {
                guard.disarm();
                if let Err(e) = state.gateway.logout(&handle) {
                    tracing::warn!(%conn_id, error = %e, "logout of a session that is already gone");
                }
                tracing::info!(%conn_id, session_id = %handle.session_id, "player logged out");
                let _ = conn.close().await;
                break;
            }

            SocketMessage::Disconnect { reason } => {
                tracing::info!(%conn_id, %reason, "client disconnected");
                guard.reason = DisconnectReason::ClientClosed(reason);
                break;
            }

            SocketMessage::Handshake { .. } => {
                send_error(&conn, &state.codec, 400, "already handshaken", next_seq(&mut seq), &start)
                    .await?;
            }

            other => {
                tracing::debug!(%conn_id, message = ?other, "ignoring server-only message from client");
                send_error(&conn, &state.codec, 400, "unexpected message", next_seq(&mut seq), &start)
                    .await?;
            }
        }
    }

    // guard drops here → session enters grace (unless logged out).
    Ok(())
}

/// Receives the Handshake, authenticates, and binds the connection to a
/// session. On failure, the client gets an `Error` frame first.
async fn perform_handshake<A, C, L>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C, L>,
    start: &Instant,
) -> Result<SessionHandle, SbobozError>
where
    A: Authenticator,
    C: Codec,
    L: LobbyNotifier,
{
    let data = match tokio::time::timeout(state.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage("connection closed before handshake".into()).into());
        }
        Ok(Err(e)) => return Err(SbobozError::Transport(e)),
        Err(_) => {
            send_error(conn, &state.codec, 400, "handshake timed out", 0, start).await?;
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let envelope: Envelope = match state.codec.decode(&data) {
        Ok(env) => env,
        Err(e) => {
            send_error(conn, &state.codec, 400, "malformed handshake", 0, start).await?;
            return Err(e.into());
        }
    };

    let SocketMessage::Handshake { version, auth_token, resume } = envelope.message else {
        send_error(conn, &state.codec, 400, "expected Handshake", 0, start).await?;
        return Err(ProtocolError::InvalidMessage("first message must be Handshake".into()).into());
    };

    if version != PROTOCOL_VERSION {
        send_error(
            conn,
            &state.codec,
            400,
            &format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
            0,
            start,
        )
        .await?;
        return Err(ProtocolError::InvalidMessage("protocol version mismatch".into()).into());
    }

    let identity = match auth_token {
        Some(token) => match state.auth.authenticate(&token).await {
            Ok(player_id) => Some(player_id),
            Err(e) => {
                send_error(conn, &state.codec, 401, "unauthorized", 0, start).await?;
                return Err(e.into());
            }
        },
        None => None,
    };

    match state.gateway.on_connect(conn.id(), identity, resume) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            let (code, message) = session_error_frame(&e);
            send_error(conn, &state.codec, code, &message, 0, start).await?;
            Err(e.into())
        }
    }
}

/// Maps a session error to the code and message of the `Error` frame the
/// client sees.
///
/// Internal faults are logged here and never leak their detail.
fn session_error_frame(err: &SessionError) -> (u16, String) {
    match err {
        SessionError::AuthFailed(_)
        | SessionError::InvalidToken
        | SessionError::Expired(_)
        | SessionError::UnknownSession(_) => (401, err.to_string()),
        SessionError::IdentityConflict(_) => (409, err.to_string()),
        SessionError::Internal(detail) => {
            tracing::error!(%detail, "internal session error");
            (500, "internal error".to_string())
        }
    }
}

fn session_error_message(err: &SessionError) -> SocketMessage {
    let (code, message) = session_error_frame(err);
    SocketMessage::Error { code, message }
}

async fn send(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    envelope: &Envelope,
) -> Result<(), SbobozError> {
    let bytes = codec.encode(envelope)?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Sends a `SocketMessage::Error` envelope to the client.
async fn send_error(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    code: u16,
    message: &str,
    seq: u64,
    start: &Instant,
) -> Result<(), SbobozError> {
    let envelope = Envelope {
        seq,
        timestamp: elapsed_ms(start),
        message: SocketMessage::Error {
            code,
            message: message.to_string(),
        },
    };
    send(conn, codec, &envelope).await
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

fn elapsed_ms(start: &Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
