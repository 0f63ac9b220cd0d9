//! Gateway core: connection registry, WebSocket handler and routing.
//!
//! Clients connect to `/ws?userId=N`. Every `sendMessage` command is stored,
//! confirmed to the sender with the assigned id and pushed to the receiver
//! if the receiver is connected. The same state also backs the history API
//! in [`crate::api`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

use matchsync_proto::codec;
use matchsync_proto::gateway::{
    ClientCommand, GatewayEvent, IncomingMessage, OutgoingMessage, SendConfirmation,
};
use matchsync_proto::message::{DeliveryStatus, MAX_CONTENT_SIZE, UserId};

use crate::config::GatewayConfig;
use crate::store::ConversationStore;

/// Default largest history page the API hands out.
const DEFAULT_MAX_PAGE_SIZE: usize = 100;

/// Writer side of one registered connection.
struct Connection {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared gateway state: who is connected and what was said.
pub struct GatewayState {
    connections: RwLock<HashMap<UserId, Connection>>,
    next_connection: AtomicU64,
    /// All accepted messages.
    pub store: ConversationStore,
    confirmations: AtomicBool,
    max_page_size: usize,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayState {
    /// Empty state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_page_size(DEFAULT_MAX_PAGE_SIZE)
    }

    /// Empty state capping history pages at `max_page_size`.
    #[must_use]
    pub fn with_max_page_size(max_page_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            store: ConversationStore::new(),
            confirmations: AtomicBool::new(true),
            max_page_size,
        }
    }

    /// Empty state set up from the gateway settings.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        let state = Self::with_max_page_size(config.max_page_size);
        state.set_confirmations(config.confirmations);
        state
    }

    /// Largest page the history API returns.
    #[must_use]
    pub const fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Toggle send confirmations. With confirmations off, messages are still
    /// stored and pushed but the sender never hears back.
    pub fn set_confirmations(&self, enabled: bool) {
        self.confirmations.store(enabled, Ordering::Relaxed);
    }

    /// Whether `user` currently has a connection.
    pub async fn is_connected(&self, user: UserId) -> bool {
        self.connections.read().await.contains_key(&user)
    }

    /// Registers a connection for `user`, replacing any previous one.
    async fn register(&self, user: UserId, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .connections
            .write()
            .await
            .insert(user, Connection { id, sender });
        if previous.is_some() {
            tracing::info!(user = %user, "replaced existing connection");
        }
        id
    }

    /// Unregisters `user` if connection `id` is still the current one.
    async fn unregister(&self, user: UserId, id: u64) {
        let mut conns = self.connections.write().await;
        if conns.get(&user).is_some_and(|c| c.id == id) {
            conns.remove(&user);
        }
    }

    async fn send_to(&self, user: UserId, event: &GatewayEvent) -> bool {
        let text = match codec::encode_event(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to encode event");
                return false;
            }
        };
        let conns = self.connections.read().await;
        conns
            .get(&user)
            .is_some_and(|c| c.sender.send(Message::Text(text.into())).is_ok())
    }

    /// Sends a normal close frame to every connected user.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, conn) in conns.iter() {
            tracing::info!(user = %user, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    /// Closes `user`'s connection with a going-away code, which clients
    /// treat as an unexpected drop. Returns whether the user was connected.
    pub async fn drop_connection(&self, user: UserId) -> bool {
        let conns = self.connections.read().await;
        let Some(conn) = conns.get(&user) else {
            return false;
        };
        tracing::info!(user = %user, "dropping connection");
        conn.sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "dropped".into(),
            })))
            .is_ok()
    }

    /// Stores a message and pushes it to its receiver. Returns the
    /// confirmation owed to the sender.
    async fn accept(&self, from: UserId, msg: OutgoingMessage) -> SendConfirmation {
        let rejected = SendConfirmation {
            message_id: None,
            status: DeliveryStatus::Failed,
            sender_id: Some(from),
        };
        if msg.sender_id != from {
            tracing::warn!(user = %from, claimed = %msg.sender_id, "sender does not match connection");
            return rejected;
        }
        let content = msg.content.trim();
        if content.is_empty() || msg.content.len() > MAX_CONTENT_SIZE {
            tracing::warn!(user = %from, size = msg.content.len(), "message content rejected");
            return rejected;
        }

        let stored = self
            .store
            .append(from, msg.receiver_id, msg.content.clone())
            .await;
        tracing::debug!(
            from = %from,
            to = %msg.receiver_id,
            id = %stored.id,
            final_match = msg.is_final_match,
            potential_match = msg.is_potential_match,
            "message stored"
        );

        if msg.receiver_id != from {
            let push = GatewayEvent::IncomingMessage(IncomingMessage {
                message_id: stored.id,
                sender_id: from,
                receiver_id: msg.receiver_id,
                content: stored.content,
                timestamp: Some(stored.sent_at),
            });
            if !self.send_to(msg.receiver_id, &push).await {
                tracing::debug!(to = %msg.receiver_id, "receiver offline, history only");
            }
        }

        SendConfirmation {
            message_id: Some(stored.id),
            status: DeliveryStatus::Sent,
            sender_id: Some(from),
        }
    }

    async fn handle_text(&self, user: UserId, text: &str) {
        let command = match codec::decode_command(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "failed to decode command");
                return;
            }
        };
        match command {
            ClientCommand::SendMessage(msg) => {
                let confirmation = self.accept(user, msg).await;
                if self.confirmations.load(Ordering::Relaxed) {
                    self.send_to(user, &GatewayEvent::SendConfirmation(confirmation))
                        .await;
                } else {
                    tracing::debug!(user = %user, "confirmations disabled, not confirming");
                }
            }
        }
    }
}

/// Handles an upgraded WebSocket for `user` until either side closes.
pub async fn handle_socket(socket: WebSocket, user: UserId, state: Arc<GatewayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(user, tx).await;
    tracing::info!(user = %user, "user connected");

    let writer_user = user;
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => reader_state.handle_text(user, text.as_str()).await,
                Message::Close(_) => {
                    tracing::info!(user = %user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(user, connection).await;
    tracing::info!(user = %user, "user disconnected");
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "userId")]
    user_id: Option<i64>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let Some(user) = query.user_id.map(UserId::new) else {
        return (StatusCode::BAD_REQUEST, "userId is required").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

/// Router serving the WebSocket and the history API over `state`.
pub fn router(state: Arc<GatewayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/messages/read", axum::routing::post(crate::api::mark_read))
        .route("/messages/{other}", axum::routing::get(crate::api::history))
        .with_state(state)
}

/// Starts the gateway on `addr` with fresh state.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(GatewayState::new())).await
}

/// Starts the gateway on `addr` with a caller-owned [`GatewayState`].
///
/// Returns the bound address, which matters when `addr` asks for port 0.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<GatewayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}
