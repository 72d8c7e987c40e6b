//! Integration tests for the connection gateway: full session lifecycles,
//! lobby notifications, the expiration driver, and the reconnect/expire
//! race.
//!
//! Time-dependent tests run on a paused Tokio clock
//! (`start_paused = true`) and move it with `tokio::time::advance`.

use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use sboboz_protocol::{LobbyId, PlayerId, ReconnectToken, ResumeCredentials, SessionId};
use sboboz_session::{
    ConnectionGateway, DisconnectReason, IdentityPolicy, LeaveReason, LobbyNotifier, NoopLobby,
    Session, SessionConfig, SessionError, SessionHandle, SessionState,
};
use sboboz_transport::ConnectionId;
use tokio::time::Instant;

// =========================================================================
// Helpers
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum LobbyEvent {
    Absent(SessionId),
    Returned(SessionId),
    Left(SessionId, LeaveReason),
}

/// Records every lobby notification. Clones share one log.
#[derive(Clone, Default)]
struct RecordingLobby {
    events: Arc<Mutex<Vec<LobbyEvent>>>,
}

impl RecordingLobby {
    fn events(&self) -> Vec<LobbyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LobbyNotifier for RecordingLobby {
    fn player_absent(&self, session: &Session, _lobby: &LobbyId) {
        self.events
            .lock()
            .unwrap()
            .push(LobbyEvent::Absent(session.session_id.clone()));
    }

    fn player_returned(&self, session: &Session, _lobby: &LobbyId) {
        self.events
            .lock()
            .unwrap()
            .push(LobbyEvent::Returned(session.session_id.clone()));
    }

    fn player_left(&self, session: &Session, _lobby: &LobbyId, reason: LeaveReason) {
        self.events
            .lock()
            .unwrap()
            .push(LobbyEvent::Left(session.session_id.clone(), reason));
    }
}

const GRACE: Duration = Duration::from_secs(30);

fn gateway() -> ConnectionGateway<NoopLobby> {
    ConnectionGateway::new(SessionConfig::default(), NoopLobby)
}

fn recording_gateway() -> (ConnectionGateway<RecordingLobby>, RecordingLobby) {
    let lobby = RecordingLobby::default();
    let gw = ConnectionGateway::new(SessionConfig::default(), lobby.clone());
    (gw, lobby)
}

fn pid(id: &str) -> PlayerId {
    PlayerId::new(id)
}

fn conn(id: u64) -> ConnectionId {
    ConnectionId::new(id)
}

fn resume_of(handle: &SessionHandle) -> ResumeCredentials {
    ResumeCredentials {
        session_id: handle.session_id.clone(),
        reconnect_token: handle.reconnect_token.clone(),
    }
}

fn dropped() -> DisconnectReason {
    DisconnectReason::ClientClosed(String::new())
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace_rotates_token() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("alice")), None).unwrap();
    let t1 = first.reconnect_token.clone();

    let deadline = gw.on_disconnect(&first, dropped()).unwrap();
    assert_eq!(deadline, Some(Instant::now() + GRACE));

    tokio::time::advance(Duration::from_secs(10)).await;
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();

    assert!(second.resumed);
    assert_eq!(second.session_id, first.session_id);
    assert!(!second.reconnect_token.matches(&t1), "token must rotate");
    assert_eq!(gw.live_connection(&first.session_id), Some(conn(2)));
    assert!(gw.scheduler().is_empty(), "pending expiration must be cancelled");

    // t1 is dead now, even once the session is back in grace.
    gw.on_disconnect(&second, dropped()).unwrap();
    let stale = gw.store().reconnect(&first.session_id, &t1);
    assert!(matches!(stale, Err(SessionError::InvalidToken)));
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_within_grace_expires_session() {
    let gw = gateway();
    let handle = gw.on_connect(conn(1), Some(pid("bob")), None).unwrap();
    gw.on_disconnect(&handle, dropped()).unwrap();

    tokio::time::advance(GRACE - Duration::from_secs(1)).await;
    assert!(gw.expire_due(Instant::now()).is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    let expired = gw.expire_due(Instant::now());

    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].session_id, handle.session_id);
    assert!(gw.store().get(&handle.session_id).is_none());

    let late = gw.store().reconnect(&handle.session_id, &handle.reconnect_token);
    assert!(matches!(late, Err(SessionError::Expired(_))));

    // Without an identity to fall back on, the client is told why.
    let via_gateway = gw.on_connect(conn(2), None, Some(resume_of(&handle)));
    assert!(matches!(via_gateway, Err(SessionError::Expired(_))));
}

#[tokio::test(start_paused = true)]
async fn test_second_login_while_connected_conflicts() {
    let gw = gateway();
    gw.on_connect(conn(1), Some(pid("carol")), None).unwrap();

    let second = gw.on_connect(conn(2), Some(pid("carol")), None);

    assert!(matches!(second, Err(SessionError::IdentityConflict(p)) if p == pid("carol")));
}

#[tokio::test(start_paused = true)]
async fn test_multi_session_policy_allows_second_login() {
    let gw = ConnectionGateway::new(
        SessionConfig {
            identity_policy: IdentityPolicy::MultiSession,
            ..SessionConfig::default()
        },
        NoopLobby,
    );
    let a = gw.on_connect(conn(1), Some(pid("carol")), None).unwrap();
    let b = gw.on_connect(conn(2), Some(pid("carol")), None).unwrap();

    assert_ne!(a.session_id, b.session_id);
    assert_eq!(gw.live_count(), 2);
}

// =========================================================================
// on_connect()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_on_connect_without_credentials_returns_auth_failed() {
    let gw = gateway();

    let result = gw.on_connect(conn(1), None, None);

    assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    assert!(gw.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_on_connect_bad_token_with_identity_falls_back_to_fresh_login() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("dave")), None).unwrap();
    gw.logout(&first).unwrap();

    // The old session is gone; the identity is free, so the fresh login
    // succeeds instead of the resume.
    let bogus = ResumeCredentials {
        session_id: first.session_id.clone(),
        reconnect_token: ReconnectToken::new("bogus"),
    };
    let second = gw.on_connect(conn(2), Some(pid("dave")), Some(bogus)).unwrap();

    assert!(!second.resumed);
    assert_ne!(second.session_id, first.session_id);
}

#[tokio::test(start_paused = true)]
async fn test_on_connect_stale_token_in_grace_never_reuses_state() {
    // Presenting a wrong token for a session in grace must not recover it;
    // the fresh-login fallback then conflicts with the still-live session.
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("erin")), None).unwrap();
    gw.on_disconnect(&first, dropped()).unwrap();

    let stale = ResumeCredentials {
        session_id: first.session_id.clone(),
        reconnect_token: ReconnectToken::new("0".repeat(32)),
    };
    let result = gw.on_connect(conn(2), Some(pid("erin")), Some(stale));

    assert!(matches!(result, Err(SessionError::IdentityConflict(_))));
    let session = gw.store().get(&first.session_id).unwrap();
    assert!(matches!(session.state, SessionState::Grace { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_on_connect_resume_with_foreign_identity_is_rejected() {
    let gw = gateway();
    let victim = gw.on_connect(conn(1), Some(pid("frank")), None).unwrap();
    gw.on_disconnect(&victim, dropped()).unwrap();

    // Mallory somehow holds Frank's credentials but logs in as herself.
    let result = gw
        .on_connect(conn(2), Some(pid("mallory")), Some(resume_of(&victim)))
        .unwrap();

    assert!(!result.resumed);
    assert_eq!(result.identity, pid("mallory"));
    assert!(matches!(
        gw.store().get(&victim.session_id).unwrap().state,
        SessionState::Grace { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_on_connect_resume_while_still_connected_takes_over() {
    let (gw, lobby) = recording_gateway();
    let first = gw.on_connect(conn(1), Some(pid("gina")), None).unwrap();
    gw.join_lobby(&first, LobbyId("table-2".into())).unwrap();

    // The old socket is half-open; the client comes back on a new one with
    // the token it holds.
    let second = gw
        .on_connect(conn(2), Some(pid("gina")), Some(resume_of(&first)))
        .unwrap();

    assert!(second.resumed);
    assert_eq!(second.session_id, first.session_id);
    assert_ne!(second.reconnect_token, first.reconnect_token);
    assert_eq!(gw.live_connection(&first.session_id), Some(conn(2)));
    tokio::time::timeout(Duration::from_secs(1), first.superseded())
        .await
        .expect("replaced connection is told to close");
    assert!(
        tokio::time::timeout(Duration::from_secs(1), second.superseded())
            .await
            .is_err()
    );
    // The player never left, so the lobby heard nothing.
    assert!(lobby.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_on_disconnect_after_takeover_leaves_session_connected() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("gus")), None).unwrap();
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();

    let result = gw.on_disconnect(&first, dropped()).unwrap();

    assert_eq!(result, None);
    assert_eq!(gw.live_connection(&second.session_id), Some(conn(2)));
    assert_eq!(
        gw.store().get(&second.session_id).unwrap().state,
        SessionState::Connected
    );
    assert!(gw.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_logout_from_superseded_connection_keeps_session() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("gwen")), None).unwrap();
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();

    gw.logout(&first).unwrap();

    assert_eq!(
        gw.store().get(&second.session_id).unwrap().state,
        SessionState::Connected
    );
    gw.logout(&second).unwrap();
    assert!(gw.store().is_empty());
}

// =========================================================================
// on_disconnect()
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_on_disconnect_from_superseded_connection_is_ignored() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("hank")), None).unwrap();
    gw.on_disconnect(&first, dropped()).unwrap();
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();

    // A late duplicate disconnect for conn 1 must not touch conn 2's session.
    let result = gw.on_disconnect(&first, dropped()).unwrap();

    assert_eq!(result, None);
    assert_eq!(gw.live_connection(&second.session_id), Some(conn(2)));
    assert_eq!(
        gw.store().get(&second.session_id).unwrap().state,
        SessionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_on_disconnect_zero_grace_expires_immediately() {
    let gw = ConnectionGateway::new(
        SessionConfig {
            grace_window: Duration::ZERO,
            ..SessionConfig::default()
        },
        NoopLobby,
    );
    let handle = gw.on_connect(conn(1), Some(pid("ivy")), None).unwrap();

    let result = gw.on_disconnect(&handle, DisconnectReason::IdleTimeout).unwrap();

    assert_eq!(result, None);
    assert!(gw.store().is_empty());
    assert!(gw.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_on_disconnect_with_out_of_range_grace_returns_internal() {
    let gw = ConnectionGateway::new(
        SessionConfig {
            grace_window: Duration::from_secs(u64::MAX),
            ..SessionConfig::default()
        },
        NoopLobby,
    );
    let handle = gw.on_connect(conn(1), Some(pid("ian")), None).unwrap();

    let result = gw.on_disconnect(&handle, dropped());

    assert!(matches!(result, Err(SessionError::Internal(_))));
    assert_eq!(
        gw.store().get(&handle.session_id).unwrap().state,
        SessionState::Connected
    );
    assert!(gw.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_then_disconnect_again_uses_new_deadline() {
    let gw = gateway();
    let first = gw.on_connect(conn(1), Some(pid("jack")), None).unwrap();
    gw.on_disconnect(&first, dropped()).unwrap();

    tokio::time::advance(Duration::from_secs(20)).await;
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();
    let new_deadline = gw.on_disconnect(&second, dropped()).unwrap().unwrap();

    // Where the first deadline would have been, nothing happens.
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(gw.expire_due(Instant::now()).is_empty());
    assert!(gw.store().get(&first.session_id).is_some());

    tokio::time::advance(new_deadline - Instant::now()).await;
    assert_eq!(gw.expire_due(Instant::now()).len(), 1);
}

// =========================================================================
// Lobby notifications
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_lobby_is_told_about_absence_return_and_expiry() {
    let (gw, lobby) = recording_gateway();
    let first = gw.on_connect(conn(1), Some(pid("kim")), None).unwrap();
    let id = first.session_id.clone();
    gw.join_lobby(&first, LobbyId("table-7".into())).unwrap();

    gw.on_disconnect(&first, dropped()).unwrap();
    let second = gw.on_connect(conn(2), None, Some(resume_of(&first))).unwrap();
    assert_eq!(second.lobby, Some(LobbyId("table-7".into())));
    gw.on_disconnect(&second, dropped()).unwrap();
    tokio::time::advance(GRACE).await;
    gw.expire_due(Instant::now());

    assert_eq!(
        lobby.events(),
        vec![
            LobbyEvent::Absent(id.clone()),
            LobbyEvent::Returned(id.clone()),
            LobbyEvent::Absent(id.clone()),
            LobbyEvent::Left(id, LeaveReason::Expired),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_lobby_not_notified_for_sessions_without_lobby() {
    let (gw, lobby) = recording_gateway();
    let handle = gw.on_connect(conn(1), Some(pid("lee")), None).unwrap();

    gw.on_disconnect(&handle, dropped()).unwrap();

    assert!(lobby.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_logout_and_leave_lobby_notify_left() {
    let (gw, lobby) = recording_gateway();
    let handle = gw.on_connect(conn(1), Some(pid("max")), None).unwrap();
    let id = handle.session_id.clone();

    gw.join_lobby(&handle, LobbyId("a".into())).unwrap();
    assert_eq!(gw.leave_lobby(&handle).unwrap(), Some(LobbyId("a".into())));
    gw.join_lobby(&handle, LobbyId("b".into())).unwrap();
    gw.logout(&handle).unwrap();

    assert_eq!(
        lobby.events(),
        vec![
            LobbyEvent::Left(id.clone(), LeaveReason::Left),
            LobbyEvent::Left(id, LeaveReason::Logout),
        ]
    );
    assert_eq!(gw.live_count(), 0);
    assert!(gw.store().is_empty());
}

// =========================================================================
// Expiration driver
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_run_expirations_expires_on_schedule_and_stops_on_shutdown() {
    let gw = Arc::new(gateway());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let driver = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            gw.run_expirations(async {
                let _ = stop_rx.await;
            })
            .await;
        })
    };

    let a = gw.on_connect(conn(1), Some(pid("nina")), None).unwrap();
    let b = gw.on_connect(conn(2), Some(pid("omar")), None).unwrap();
    gw.on_disconnect(&a, dropped()).unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    gw.on_disconnect(&b, dropped()).unwrap();

    tokio::time::sleep(GRACE - Duration::from_secs(5) + Duration::from_millis(1)).await;
    assert!(gw.store().get(&a.session_id).is_none(), "a should be expired");
    assert!(gw.store().get(&b.session_id).is_some(), "b still in grace");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(gw.store().is_empty());

    stop_tx.send(()).unwrap();
    driver.await.unwrap();
}

// =========================================================================
// Concurrency
// =========================================================================

#[test]
fn test_reconnect_and_expire_race_has_exactly_one_winner() {
    // Two threads hit the same in-grace session at once: one reconnects,
    // one expires. Whoever takes the session lock first wins; the session
    // is never both removed and connected.
    let gw = gateway();

    for round in 0..200 {
        let handle = gw
            .on_connect(conn(round), Some(pid(&format!("racer-{round}"))), None)
            .unwrap();
        let id = handle.session_id.clone();
        let token = handle.reconnect_token.clone();
        gw.store().begin_grace(&id, Instant::now()).unwrap();

        let barrier = Barrier::new(2);
        let (reconnected, expired) = std::thread::scope(|s| {
            let reconnect = s.spawn(|| {
                barrier.wait();
                gw.store().reconnect(&id, &token)
            });
            let expire = s.spawn(|| {
                barrier.wait();
                gw.store().expire_if_due(&id, Instant::now())
            });
            (reconnect.join().unwrap(), expire.join().unwrap())
        });

        match (reconnected, expired) {
            (Ok(session), None) => {
                assert_eq!(session.state, SessionState::Connected);
                let stored = gw.store().get(&id).expect("winner keeps the session");
                assert_eq!(stored.state, SessionState::Connected);
            }
            (Err(SessionError::Expired(_)), Some(_)) => {
                assert!(gw.store().get(&id).is_none());
            }
            (r, e) => panic!("round {round}: inconsistent outcome {r:?} / {e:?}"),
        }
    }
}

#[test]
fn test_concurrent_logins_for_one_identity_admit_exactly_one() {
    let gw = gateway();
    let barrier = Barrier::new(8);

    let results: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let gw = &gw;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    gw.on_connect(conn(i), Some(pid("popular")), None)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SessionError::IdentityConflict(_)))
    );
}
