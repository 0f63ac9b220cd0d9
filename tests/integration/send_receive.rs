// Integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! End-to-end message flow between two participants.
//!
//! Each test starts the development gateway in-process on an OS-assigned
//! port and runs real sessions against it: the WebSocket connector for
//! sends and pushes, the HTTP client for history and read receipts.

use std::sync::Arc;
use std::time::Duration;

use matchsync::chat::{Direction, MessageStatus};
use matchsync::config::{ConnectionConfig, ReadConfig, SyncConfig, SyncTimings};
use matchsync::connection::ConnectionManager;
use matchsync::history::http::HttpChatApi;
use matchsync::session::{ChatSession, SessionParams, SessionSnapshot};
use matchsync::transport::websocket::WebSocketConnector;
use matchsync_gateway::gateway::{self, GatewayState};
use matchsync_proto::message::UserId;

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);

fn config() -> SyncConfig {
    SyncConfig {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(1),
            reconnect_base_delay: Duration::from_millis(50),
            grace_period: Duration::from_millis(300),
            ..ConnectionConfig::default()
        },
        sync: SyncTimings {
            initial_page_size: 10,
            older_page_size: 10,
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

/// One participant: its own connection and a session talking to `other`.
struct Participant {
    connection: Arc<ConnectionManager<WebSocketConnector>>,
    session: ChatSession,
}

async fn join(addr: &str, me: UserId, other: UserId, config: &SyncConfig) -> Participant {
    let connector = WebSocketConnector::new(&format!("ws://{addr}/ws")).unwrap();
    let connection = ConnectionManager::new(connector, config.connection.clone());
    connection.acquire(me).await.unwrap();

    let api = HttpChatApi::new(&format!("http://{addr}"), me, None).unwrap();
    let params = SessionParams {
        me,
        other,
        is_final_match: true,
        is_potential_match: false,
    };
    let session = ChatSession::start(params, Arc::clone(&connection), api, config);
    Participant {
        connection,
        session,
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

#[tokio::test]
async fn message_reaches_other_participant() {
    let (addr, _state) = start_gateway().await;
    let config = config();
    let alice = join(&addr, ALICE, BOB, &config).await;
    let bob = join(&addr, BOB, ALICE, &config).await;
    wait_for(&bob.session, "bob loaded", |s| !s.is_loading).await;

    assert!(alice.session.send_message("hello bob").await);

    let snapshot = alice.session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    let sent = &snapshot.messages[0];
    assert_eq!(sent.direction, Direction::Outgoing);
    assert!(matches!(
        sent.status,
        MessageStatus::Delivered | MessageStatus::Read
    ));
    assert!(!sent.is_placeholder());

    let snapshot = wait_for(&bob.session, "push", |s| {
        s.messages.iter().any(|m| m.content == "hello bob")
    })
    .await;
    let received = &snapshot.messages[0];
    assert_eq!(received.direction, Direction::Incoming);
    assert_eq!(received.id, sent.id);
}

#[tokio::test]
async fn push_and_poll_do_not_duplicate() {
    let (addr, _state) = start_gateway().await;
    let config = config();
    let alice = join(&addr, ALICE, BOB, &config).await;
    let bob = join(&addr, BOB, ALICE, &config).await;

    assert!(alice.session.send_message("one").await);
    assert!(alice.session.send_message("two").await);
    wait_for(&bob.session, "both pushes", |s| s.messages.len() == 2).await;

    // Several poll cycles return the same messages again.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let contents: Vec<_> = bob
        .session
        .snapshot()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, ["one", "two"]);
    assert_eq!(alice.session.snapshot().messages.len(), 2);
}

#[tokio::test]
async fn offline_messages_arrive_with_history() {
    let (addr, _state) = start_gateway().await;
    let config = config();
    let alice = join(&addr, ALICE, BOB, &config).await;

    assert!(alice.session.send_message("while you were away").await);

    let bob = join(&addr, BOB, ALICE, &config).await;
    let snapshot = wait_for(&bob.session, "initial load", |s| !s.is_loading).await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "while you were away");
    assert!(!snapshot.has_more_messages);
}

#[tokio::test]
async fn read_receipt_reaches_sender() {
    let (addr, _state) = start_gateway().await;
    let config = config();
    let alice = join(&addr, ALICE, BOB, &config).await;
    let bob = join(&addr, BOB, ALICE, &config).await;

    assert!(alice.session.send_message("did you see this").await);
    wait_for(&bob.session, "push", |s| !s.messages.is_empty()).await;
    bob.session.mark_messages_as_read();

    wait_for(&bob.session, "marked read locally", |s| {
        s.messages.iter().all(|m| m.is_read)
    })
    .await;
    wait_for(&alice.session, "read status", |s| {
        s.messages
            .first()
            .is_some_and(|m| m.status == MessageStatus::Read)
    })
    .await;
}

#[tokio::test]
async fn unconfirmed_send_fails_and_retry_succeeds() {
    let (addr, state) = start_gateway().await;
    // A poll would find the stored message and settle it before the timeout.
    let mut config = config();
    config.sync.poll_initial_delay = Duration::from_secs(60);
    let alice = join(&addr, ALICE, BOB, &config).await;
    // A history response still in flight would settle the send by content.
    wait_for(&alice.session, "initial load", |s| !s.is_loading).await;

    state.set_confirmations(false);
    assert!(!alice.session.send_message("lost ack").await);
    let snapshot = alice.session.snapshot();
    let failed = snapshot
        .messages
        .iter()
        .find(|m| m.status == MessageStatus::Failed)
        .expect("failed message");
    assert_eq!(failed.content, "lost ack");

    state.set_confirmations(true);
    assert!(alice.session.retry_failed_message(failed.id).await);
    assert!(!alice.session.retry_failed_message(failed.id).await);
}

#[tokio::test]
async fn older_history_pages_in() {
    let (addr, state) = start_gateway().await;
    for i in 0..25 {
        let (from, to) = if i % 2 == 0 { (BOB, ALICE) } else { (ALICE, BOB) };
        state.store.append(from, to, format!("m{i}")).await;
    }
    let config = config();
    let alice = join(&addr, ALICE, BOB, &config).await;

    let snapshot = wait_for(&alice.session, "initial load", |s| !s.is_loading).await;
    assert_eq!(snapshot.messages.len(), 10);
    assert!(snapshot.has_more_messages);
    assert_eq!(snapshot.messages.last().unwrap().content, "m24");

    alice.session.load_more_messages().await;
    assert_eq!(alice.session.snapshot().messages.len(), 20);

    alice.session.load_more_messages().await;
    let snapshot = alice.session.snapshot();
    assert_eq!(snapshot.messages.len(), 25);
    assert!(!snapshot.has_more_messages);
    assert_eq!(snapshot.messages[0].content, "m0");
    assert!(
        snapshot.messages.windows(2).all(|w| w[0].id < w[1].id),
        "messages out of order"
    );

    // Nothing more to load: no request, no change.
    alice.session.load_more_messages().await;
    assert_eq!(alice.session.snapshot().messages.len(), 25);
}

#[tokio::test]
async fn messages_for_other_conversations_are_ignored() {
    let (addr, _state) = start_gateway().await;
    let config = config();
    let carol = UserId::new(3);
    let alice = join(&addr, ALICE, BOB, &config).await;
    let carol_side = join(&addr, carol, ALICE, &config).await;
    wait_for(&alice.session, "initial load", |s| !s.is_loading).await;

    assert!(carol_side.session.send_message("hi alice, it's carol").await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(alice.session.snapshot().messages.is_empty());
    assert!(alice.connection.is_connected());
}
