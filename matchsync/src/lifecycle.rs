//! App lifecycle coordination.
//!
//! The [`LifecycleCoordinator`] sits between the host application and the
//! engine. It owns the active [`ChatSession`] (at most one) and the
//! connection reference that session holds, and reacts to the app moving
//! between foreground and background:
//!
//! - **to background**: the pending reconnect check is cancelled and the
//!   session stops polling, but the connection reference is kept;
//! - **to foreground**: the connection is ensured (force-reconnect when a
//!   reference is held but the link is down), polling restarts, a read pass
//!   is scheduled, and a second connection check runs after a short delay.

use std::sync::Arc;

use futures_util::future::Either;
use tokio::task::JoinHandle;

use matchsync_proto::message::UserId;

use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::history::ChatApi;
use crate::session::{ChatSession, SessionParams};
use crate::transport::Connector;

/// Whether the host app is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Visible and interactive.
    Foreground,
    /// Suspended or hidden.
    Background,
}

/// Drives sessions and the shared connection from app lifecycle events.
pub struct LifecycleCoordinator<K: Connector, A: ChatApi + Clone> {
    connection: Arc<ConnectionManager<K>>,
    api: A,
    config: SyncConfig,
    app_state: AppState,
    session: Option<ChatSession>,
    reconnect_check: Option<JoinHandle<()>>,
}

impl<K: Connector, A: ChatApi + Clone> LifecycleCoordinator<K, A> {
    /// Coordinator for a foregrounded app with no open session.
    pub fn new(connection: Arc<ConnectionManager<K>>, api: A, config: SyncConfig) -> Self {
        Self {
            connection,
            api,
            config,
            app_state: AppState::Foreground,
            session: None,
            reconnect_check: None,
        }
    }

    /// The shared connection.
    pub const fn connection(&self) -> &Arc<ConnectionManager<K>> {
        &self.connection
    }

    /// The open session, if any.
    pub const fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    /// Last reported app state.
    pub const fn app_state(&self) -> AppState {
        self.app_state
    }

    /// Open a conversation, closing the previous one first.
    ///
    /// Takes a connection reference for the session. Connecting happens in
    /// the background; the session works from polled history until the link
    /// is up.
    pub async fn open_session(&mut self, params: SessionParams) -> &ChatSession {
        self.close_session().await;

        let ready = self.connection.acquire(params.me);
        tokio::spawn(async move {
            if let Err(e) = ready.await {
                tracing::warn!(err = %e, "connection not ready for new session");
            }
        });

        let session = ChatSession::start(
            params,
            Arc::clone(&self.connection),
            self.api.clone(),
            &self.config,
        );
        if self.app_state == AppState::Background {
            session.pause_polling();
        }
        tracing::info!(other = %params.other, "conversation opened");
        self.session.insert(session)
    }

    /// Close the open conversation and release its connection reference.
    ///
    /// The connection itself stays up for the grace period, so reopening a
    /// conversation soon after reuses it.
    pub async fn close_session(&mut self) {
        self.cancel_reconnect_check();
        if let Some(session) = self.session.take() {
            self.connection.release();
            session.close().await;
        }
    }

    /// Leave the chat area entirely: close the session and drop the
    /// connection without a grace period.
    pub async fn leave_chat(&mut self) {
        self.close_session().await;
        self.connection.force_disconnect_and_reset();
        tracing::info!("left chat, connection reset");
    }

    /// React to the app moving to the foreground or background.
    pub fn on_app_state_changed(&mut self, state: AppState) {
        if state == self.app_state {
            return;
        }
        self.app_state = state;
        tracing::info!(?state, "app state changed");

        match state {
            AppState::Background => {
                self.cancel_reconnect_check();
                if let Some(session) = &self.session {
                    session.pause_polling();
                }
            }
            AppState::Foreground => {
                let Some(session) = &self.session else {
                    return;
                };
                let me = session.params().me;
                session.resume_polling();
                session.schedule_read_pass(self.config.read.focus_read_delay);
                self.ensure_connection(me);
                self.schedule_reconnect_check();
            }
        }
    }

    /// The conversation view regained focus.
    pub fn on_focus_gained(&self) {
        if let Some(session) = &self.session {
            session.schedule_read_pass(self.config.read.focus_read_delay);
        }
    }

    /// Make sure the active session has an open connection.
    fn ensure_connection(&self, me: UserId) {
        let connection = &self.connection;
        let pending = match connection.state() {
            ConnectionState::Open | ConnectionState::Connecting => return,
            ConnectionState::Closed | ConnectionState::Closing if connection.ref_count() > 0 => {
                tracing::info!("resumed with a dead connection, reconnecting");
                Either::Left(connection.force_reconnect())
            }
            ConnectionState::Closed | ConnectionState::Closing => {
                // The reference was lost to a reset; take a new one.
                Either::Right(connection.acquire(me))
            }
        };
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                tracing::warn!(err = %e, "reconnect after resume failed");
            }
        });
    }

    fn schedule_reconnect_check(&mut self) {
        self.cancel_reconnect_check();
        let connection = Arc::clone(&self.connection);
        let delay = self.config.connection.reconnect_check_delay;
        self.reconnect_check = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if connection.ref_count() > 0 && connection.state() == ConnectionState::Closed {
                tracing::info!("connection still down after resume, forcing reconnect");
                if let Err(e) = connection.force_reconnect().await {
                    tracing::warn!(err = %e, "forced reconnect failed");
                }
            }
        }));
    }

    fn cancel_reconnect_check(&mut self) {
        if let Some(task) = self.reconnect_check.take() {
            task.abort();
        }
    }
}

impl<K: Connector, A: ChatApi + Clone> Drop for LifecycleCoordinator<K, A> {
    fn drop(&mut self) {
        self.cancel_reconnect_check();
    }
}
