// Integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Session lifecycle against a live gateway: opening and closing
//! conversations, the connection grace period, leaving the chat area,
//! backgrounding, and recovering from a dropped connection.

use std::sync::Arc;
use std::time::Duration;

use matchsync::config::{ConnectionConfig, ReadConfig, SyncConfig, SyncTimings};
use matchsync::connection::{ConnectionManager, ConnectionState};
use matchsync::history::http::HttpChatApi;
use matchsync::lifecycle::{AppState, LifecycleCoordinator};
use matchsync::session::{ChatSession, SessionParams, SessionSnapshot};
use matchsync::transport::websocket::WebSocketConnector;
use matchsync_gateway::gateway::{self, GatewayState};
use matchsync_proto::message::UserId;

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);

type Coordinator = LifecycleCoordinator<WebSocketConnector, HttpChatApi>;

fn config() -> SyncConfig {
    SyncConfig {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(1),
            reconnect_base_delay: Duration::from_millis(50),
            grace_period: Duration::from_millis(400),
            reconnect_check_delay: Duration::from_millis(100),
            ..ConnectionConfig::default()
        },
        sync: SyncTimings {
            poll_initial_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            ..SyncTimings::default()
        },
        read: ReadConfig {
            read_interval: Duration::from_millis(200),
            read_initial_delay: Duration::from_millis(50),
            focus_read_delay: Duration::from_millis(50),
        },
        ..SyncConfig::default()
    }
}

async fn start_gateway() -> (String, Arc<GatewayState>) {
    let state = Arc::new(GatewayState::new());
    let (addr, _handle) = gateway::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr.to_string(), state)
}

fn coordinator(addr: &str, me: UserId) -> Coordinator {
    let config = config();
    let connector = WebSocketConnector::new(&format!("ws://{addr}/ws")).unwrap();
    let connection = ConnectionManager::new(connector, config.connection.clone());
    let api = HttpChatApi::new(&format!("http://{addr}"), me, None).unwrap();
    LifecycleCoordinator::new(connection, api, config)
}

const fn params(me: UserId, other: UserId) -> SessionParams {
    SessionParams {
        me,
        other,
        is_final_match: false,
        is_potential_match: true,
    }
}

async fn wait_for(
    session: &ChatSession,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = session.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("session closed");
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_state(connection: &ConnectionManager<WebSocketConnector>, want: ConnectionState) {
    let mut rx = connection.subscribe_state();
    let waited = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want)).await;
    assert!(
        matches!(waited, Ok(Ok(_))),
        "connection never reached {want:?}, now {:?}",
        connection.state()
    );
}

async fn wait_gateway(state: &GatewayState, user: UserId, connected: bool) {
    for _ in 0..100 {
        if state.is_connected(user).await == connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway never saw user {user} connected={connected}");
}

#[tokio::test]
async fn opening_a_session_connects() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected && !s.is_loading).await;

    assert_eq!(alice.connection().ref_count(), 1);
    wait_gateway(&state, ALICE, true).await;
}

#[tokio::test]
async fn reopening_within_grace_period_keeps_connection() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);
    let carol = UserId::new(3);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected).await;

    alice.close_session().await;
    assert!(alice.session().is_none());
    assert_eq!(alice.connection().ref_count(), 0);
    assert_eq!(alice.connection().state(), ConnectionState::Open);

    let session = alice.open_session(params(ALICE, carol)).await;
    wait_for(session, "loaded", |s| !s.is_loading).await;

    // Past the grace period the link is still up because it was reacquired.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(alice.connection().state(), ConnectionState::Open);
    assert_eq!(alice.connection().ref_count(), 1);
    wait_gateway(&state, ALICE, true).await;
}

#[tokio::test]
async fn connection_closes_after_grace_period() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected).await;
    alice.close_session().await;

    wait_state(alice.connection(), ConnectionState::Closed).await;
    wait_gateway(&state, ALICE, false).await;
}

#[tokio::test]
async fn leaving_chat_disconnects_immediately() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected).await;

    alice.leave_chat().await;
    assert!(alice.session().is_none());
    assert_eq!(alice.connection().ref_count(), 0);
    assert_ne!(alice.connection().state(), ConnectionState::Open);
    wait_gateway(&state, ALICE, false).await;
}

#[tokio::test]
async fn dropped_connection_recovers() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected).await;

    let mut states = alice.connection().subscribe_state();
    assert!(state.drop_connection(ALICE).await);
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s != ConnectionState::Open),
    )
    .await
    .unwrap()
    .unwrap();
    wait_state(alice.connection(), ConnectionState::Open).await;

    let session = alice.session().unwrap();
    wait_for(session, "reconnected", |s| s.is_connected).await;
    assert!(session.send_message("back online").await);
}

#[tokio::test]
async fn background_pauses_polling_until_foreground() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "loaded", |s| !s.is_loading).await;

    alice.on_app_state_changed(AppState::Background);
    // Stored without a push, so only a poll can surface it.
    state.store.append(BOB, ALICE, "poll me".to_string()).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(alice.session().unwrap().snapshot().messages.is_empty());

    alice.on_app_state_changed(AppState::Foreground);
    let session = alice.session().unwrap();
    let snapshot = wait_for(session, "polled message", |s| !s.messages.is_empty()).await;
    assert_eq!(snapshot.messages[0].content, "poll me");

    // The focus read pass acknowledges it.
    wait_for(session, "read", |s| s.messages.iter().all(|m| m.is_read)).await;
}

#[tokio::test]
async fn foreground_after_reset_reconnects() {
    let (addr, state) = start_gateway().await;
    let mut alice = coordinator(&addr, ALICE);

    let session = alice.open_session(params(ALICE, BOB)).await;
    wait_for(session, "connected", |s| s.is_connected).await;

    alice.on_app_state_changed(AppState::Background);
    alice.connection().force_disconnect_and_reset();
    wait_gateway(&state, ALICE, false).await;

    alice.on_app_state_changed(AppState::Foreground);
    wait_state(alice.connection(), ConnectionState::Open).await;
    assert_eq!(alice.connection().ref_count(), 1);
    wait_gateway(&state, ALICE, true).await;
}
