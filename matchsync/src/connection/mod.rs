//! Shared, reference-counted connection to the messaging gateway.
//!
//! The [`ConnectionManager`] owns at most one live [`Link`] at a time and is
//! shared by every open conversation view. It provides:
//!
//! - reference counting with a grace period before the last release closes
//!   the link ([`acquire`](ConnectionManager::acquire) /
//!   [`release`](ConnectionManager::release));
//! - a single in-flight connect attempt that all concurrent callers await;
//! - exponential-backoff reconnection after unexpected closes while
//!   references are held;
//! - [`send`](ConnectionManager::send) with an outbound queue for frames
//!   written while disconnected, and FIFO correlation of gateway
//!   confirmations with pending sends;
//! - fan-out of pushed messages to registered listeners.
//!
//! # State machine
//!
//! ```text
//! Closed ──▶ Connecting ──▶ Open ──▶ Closing ──▶ Closed
//!   ▲            │            │
//!   └────────────┴────────────┘  (failure / unexpected close)
//! ```
//!
//! Every link and connect attempt is tagged with a generation number.
//! Events from a superseded generation are ignored, so a late close from an
//! old link can never tear down its replacement.

pub mod backoff;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use matchsync_proto::codec::{self, CodecError};
use matchsync_proto::gateway::{ClientCommand, GatewayEvent, IncomingMessage, SendConfirmation};
use matchsync_proto::message::UserId;

use crate::config::ConnectionConfig;
use crate::transport::{Connector, Frame, Link, LinkEvent};

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    Closed,
    /// A connect attempt is in flight.
    Connecting,
    /// The link is open and frames are written immediately.
    Open,
    /// A clean close was requested and the link is winding down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Errors reported to callers waiting for the connection to open.
///
/// `Clone` because one attempt's outcome is delivered to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The connection did not open within the connect timeout.
    #[error("connection attempt timed out")]
    Timeout,

    /// The transport failed to open a link.
    #[error("connection failed: {0}")]
    Transport(String),

    /// The attempt was abandoned because a newer one replaced it.
    #[error("connection attempt superseded")]
    Superseded,

    /// The manager was reset or closed while waiting.
    #[error("connection was reset")]
    Reset,

    /// No user has ever acquired the connection, so there is nobody to connect as.
    #[error("no user to connect as")]
    NoUser,
}

/// Errors that can occur when sending a command.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The command could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No correlated confirmation arrived within the send timeout.
    #[error("no confirmation within the send timeout")]
    Timeout,

    /// The manager was reset before a confirmation arrived.
    #[error("connection was reset before confirmation")]
    Reset,
}

/// Identifies a registered push listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of one connect attempt, shared by all of its waiters.
type AttemptResult = Result<(), ConnectionError>;

/// What a caller has to do to see the connection open.
enum Readiness {
    Ready,
    Pending(watch::Receiver<Option<AttemptResult>>),
    Failed(ConnectionError),
}

/// A frame written while the link was down.
struct QueuedFrame {
    ticket: u64,
    text: String,
}

/// A send waiting for its confirmation.
struct ConfirmationWaiter {
    ticket: u64,
    sender_id: UserId,
    reply: oneshot::Sender<SendConfirmation>,
}

/// Mutable manager state, guarded by a single lock.
struct Inner {
    state: ConnectionState,
    ref_count: usize,
    user_id: Option<UserId>,
    /// Generation of the current link or attempt.
    generation: u64,
    /// Generation of a link that was asked to close cleanly.
    closing_generation: Option<u64>,
    link: Option<mpsc::UnboundedSender<Frame>>,
    attempt: Option<watch::Receiver<Option<AttemptResult>>>,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    queue: VecDeque<QueuedFrame>,
    waiters: VecDeque<ConfirmationWaiter>,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<IncomingMessage>>,
    next_ticket: u64,
    next_listener: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            ref_count: 0,
            user_id: None,
            generation: 0,
            closing_generation: None,
            link: None,
            attempt: None,
            reconnect_attempts: 0,
            reconnect_timer: None,
            grace_timer: None,
            queue: VecDeque::new(),
            waiters: VecDeque::new(),
            listeners: HashMap::new(),
            next_ticket: 0,
            next_listener: 0,
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
            tracing::debug!("scheduled close cancelled");
        }
    }
}

/// Reference-counted owner of the single gateway connection.
///
/// Always used behind an [`Arc`]; create it with [`ConnectionManager::new`]
/// and share the `Arc` with every consumer.
pub struct ConnectionManager<K: Connector> {
    connector: K,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<K: Connector> ConnectionManager<K> {
    /// Create a manager that opens links with `connector`.
    #[must_use]
    pub fn new(connector: K, config: ConnectionConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Arc::new(Self {
            connector,
            config,
            inner: Mutex::new(Inner::new()),
            state_tx,
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether the link is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of outstanding references.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.lock().ref_count
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The connection timings this manager runs with.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Take a reference on the connection and wait until it is open.
    ///
    /// The reference is claimed when `acquire` is called, not when the
    /// returned future is first polled, and it stays claimed even if the
    /// future resolves to an error: every `acquire` must be matched by one
    /// [`release`](Self::release). A pending close from an earlier release
    /// is cancelled. Concurrent callers share the same connect attempt.
    ///
    /// # Errors
    ///
    /// Resolves to [`ConnectionError::Timeout`] if the connection is not open
    /// within the connect timeout, or to the attempt's failure.
    pub fn acquire(
        self: &Arc<Self>,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        let readiness = {
            let mut inner = self.inner.lock();
            inner.ref_count += 1;
            inner.cancel_grace_timer();
            if inner.user_id != Some(user_id) {
                if let Some(previous) = inner.user_id {
                    tracing::info!(%previous, %user_id, "connection user changed, reconnecting");
                    self.close_link(&mut inner);
                }
                inner.user_id = Some(user_id);
            }
            tracing::debug!(ref_count = inner.ref_count, "connection acquired");
            if inner.state != ConnectionState::Open && inner.attempt.is_none() {
                inner.reconnect_attempts = 0;
                inner.cancel_reconnect_timer();
            }
            self.readiness(&mut inner)
        };
        Arc::clone(self).wait_until_open(readiness)
    }

    /// Drop a reference taken with [`acquire`](Self::acquire).
    ///
    /// When the count reaches zero the link is closed after the grace
    /// period, unless a new `acquire` arrives first. Frames already written
    /// are not affected.
    pub fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.ref_count == 0 {
            tracing::warn!("connection released more often than acquired");
            return;
        }
        inner.ref_count -= 1;
        tracing::debug!(ref_count = inner.ref_count, "connection released");
        if inner.ref_count > 0 {
            return;
        }

        inner.cancel_grace_timer();
        let grace = self.config.grace_period;
        let this = Arc::clone(self);
        inner.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.close_if_unused();
        }));
        tracing::debug!(grace_secs = grace.as_secs(), "last reference released, close scheduled");
    }

    /// Tear down the current link and open a new one immediately.
    ///
    /// Bypasses the backoff schedule and resets the attempt counter. The
    /// reference count is not changed.
    ///
    /// # Errors
    ///
    /// Resolves to the new attempt's failure, [`ConnectionError::Timeout`],
    /// or [`ConnectionError::NoUser`] if nobody has acquired the connection yet.
    pub fn force_reconnect(
        self: &Arc<Self>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        let readiness = {
            let mut inner = self.inner.lock();
            tracing::info!(state = %inner.state, "forcing reconnect");
            inner.cancel_reconnect_timer();
            inner.reconnect_attempts = 0;
            self.close_link(&mut inner);
            self.readiness(&mut inner)
        };
        Arc::clone(self).wait_until_open(readiness)
    }

    /// Close the link at once and forget everything.
    ///
    /// Clears the outbound queue, pending confirmations (their senders get
    /// [`SendError::Reset`]), all listeners (their receivers end) and the
    /// reference count. No timer survives this call.
    pub fn force_disconnect_and_reset(&self) {
        let mut inner = self.inner.lock();
        tracing::info!(
            ref_count = inner.ref_count,
            queued = inner.queue.len(),
            listeners = inner.listeners.len(),
            "disconnecting and resetting connection"
        );
        inner.cancel_grace_timer();
        inner.cancel_reconnect_timer();
        self.close_link(&mut inner);
        inner.queue.clear();
        inner.waiters.clear();
        inner.listeners.clear();
        inner.ref_count = 0;
        inner.reconnect_attempts = 0;
        inner.user_id = None;
    }

    /// Write a command and wait for the gateway's confirmation.
    ///
    /// If the link is not open the frame is queued, a connect attempt is
    /// started if none is in flight, and queued frames are flushed in order
    /// once the link opens. The confirmation is matched FIFO against pending
    /// sends whose sender is compatible with the confirmation's `senderId`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Timeout`] if no confirmation arrives within the
    /// send timeout (a still-queued frame is withdrawn), [`SendError::Reset`]
    /// if the manager was reset meanwhile, or [`SendError::Codec`].
    pub async fn send(
        self: &Arc<Self>,
        command: &ClientCommand,
    ) -> Result<SendConfirmation, SendError> {
        let text = codec::encode_command(command)?;
        let sender_id = command.sender_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        let ticket = {
            let mut inner = self.inner.lock();
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.waiters.push_back(ConfirmationWaiter {
                ticket,
                sender_id,
                reply: reply_tx,
            });

            let written = inner.state == ConnectionState::Open
                && inner
                    .link
                    .as_ref()
                    .is_some_and(|link| link.send(Frame::Text(text.clone())).is_ok());

            if !written {
                tracing::debug!(ticket, state = %inner.state, "connection not open, queueing send");
                inner.queue.push_back(QueuedFrame { ticket, text });
                if inner.user_id.is_none() {
                    inner.user_id = Some(sender_id);
                }
                if inner.attempt.is_none() && inner.state != ConnectionState::Open {
                    inner.cancel_reconnect_timer();
                    self.start_attempt(&mut inner);
                }
            }
            ticket
        };

        match tokio::time::timeout(self.config.send_timeout, reply_rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(SendError::Reset),
            Err(_) => {
                let mut inner = self.inner.lock();
                inner.waiters.retain(|w| w.ticket != ticket);
                inner.queue.retain(|q| q.ticket != ticket);
                tracing::warn!(ticket, "send confirmation timed out");
                Err(SendError::Timeout)
            }
        }
    }

    /// Register a listener for pushed messages.
    ///
    /// The receiver ends when the listener is removed or the manager is reset.
    pub fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<IncomingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.insert(id, tx);
        (id, rx)
    }

    /// Remove a listener registered with [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.remove(&id);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::debug!(from = %inner.state, to = %state, "connection state change");
            inner.state = state;
            self.publish_state(state);
        }
    }

    /// Work out how a caller can wait for the link, starting an attempt if needed.
    fn readiness(self: &Arc<Self>, inner: &mut Inner) -> Readiness {
        if inner.state == ConnectionState::Open {
            return Readiness::Ready;
        }
        if let Some(attempt) = &inner.attempt {
            return Readiness::Pending(attempt.clone());
        }
        if inner.user_id.is_none() {
            return Readiness::Failed(ConnectionError::NoUser);
        }
        Readiness::Pending(self.start_attempt(inner))
    }

    /// Like [`readiness`](Self::readiness) but never starts an attempt.
    fn current_readiness(&self) -> Readiness {
        let inner = self.inner.lock();
        if inner.state == ConnectionState::Open {
            Readiness::Ready
        } else if let Some(attempt) = &inner.attempt {
            Readiness::Pending(attempt.clone())
        } else {
            Readiness::Failed(ConnectionError::Reset)
        }
    }

    async fn wait_until_open(self: Arc<Self>, readiness: Readiness) -> AttemptResult {
        let wait = async {
            let mut readiness = readiness;
            loop {
                match readiness {
                    Readiness::Ready => return Ok(()),
                    Readiness::Failed(err) => return Err(err),
                    Readiness::Pending(mut rx) => {
                        let outcome = match rx.wait_for(Option::is_some).await {
                            Ok(result) => result.clone().unwrap_or(Err(ConnectionError::Reset)),
                            Err(_) => Err(ConnectionError::Reset),
                        };
                        match outcome {
                            Err(ConnectionError::Superseded) => {
                                readiness = self.current_readiness();
                            }
                            other => return other,
                        }
                    }
                }
            }
        };
        tokio::time::timeout(self.config.connect_timeout, wait)
            .await
            .unwrap_or(Err(ConnectionError::Timeout))
    }

    /// Start a connect attempt for the current user under a new generation.
    fn start_attempt(
        self: &Arc<Self>,
        inner: &mut Inner,
    ) -> watch::Receiver<Option<AttemptResult>> {
        let (done_tx, done_rx) = watch::channel(None);
        let Some(user_id) = inner.user_id else {
            let _ = done_tx.send(Some(Err(ConnectionError::NoUser)));
            return done_rx;
        };

        inner.generation += 1;
        let generation = inner.generation;
        inner.attempt = Some(done_rx.clone());
        self.set_state(inner, ConnectionState::Connecting);
        tracing::info!(%user_id, generation, "opening gateway connection");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_attempt(generation, user_id, done_tx).await;
        });
        done_rx
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        user_id: UserId,
        done: watch::Sender<Option<AttemptResult>>,
    ) {
        let outcome = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(user_id),
        )
        .await
        {
            Ok(Ok(link)) => self.on_link_open(generation, link),
            Ok(Err(e)) => {
                tracing::warn!(%user_id, err = %e, "gateway connect failed");
                Err(ConnectionError::Transport(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(%user_id, "gateway connect timed out");
                Err(ConnectionError::Timeout)
            }
        };

        if outcome.is_err() {
            self.on_attempt_failed(generation);
        }
        let _ = done.send(Some(outcome));
    }

    fn on_link_open(self: &Arc<Self>, generation: u64, link: Link) -> AttemptResult {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(generation, "discarding link from superseded attempt");
            let _ = link.outbound.send(Frame::Close);
            return Err(ConnectionError::Superseded);
        }

        inner.attempt = None;
        inner.reconnect_attempts = 0;
        inner.reconnect_timer = None;

        let queued = inner.queue.len();
        for frame in inner.queue.drain(..) {
            if link.outbound.send(Frame::Text(frame.text)).is_err() {
                tracing::warn!(ticket = frame.ticket, "link closed while flushing queue");
            }
        }
        inner.link = Some(link.outbound);
        self.set_state(&mut inner, ConnectionState::Open);
        tracing::info!(generation, flushed = queued, "gateway connection open");
        drop(inner);

        let this = Arc::clone(self);
        tokio::spawn(this.read_loop(generation, link.inbound));
        Ok(())
    }

    fn on_attempt_failed(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.attempt = None;
        self.set_state(&mut inner, ConnectionState::Closed);
        if inner.ref_count > 0 {
            self.schedule_reconnect(&mut inner);
        }
    }

    /// Background task that dispatches inbound frames of one link.
    async fn read_loop(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
        let clean = loop {
            match inbound.recv().await {
                Some(LinkEvent::Text(text)) => self.dispatch_frame(generation, &text),
                Some(LinkEvent::Closed { clean }) => break clean,
                None => break false,
            }
        };
        self.on_link_closed(generation, clean);
    }

    fn dispatch_frame(&self, generation: u64, text: &str) {
        let event = match codec::decode_event(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(err = %e, "malformed gateway frame, skipping");
                return;
            }
        };

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        match event {
            GatewayEvent::SendConfirmation(confirmation) => {
                // Callers that gave up must not swallow a confirmation.
                inner.waiters.retain(|w| !w.reply.is_closed());
                let position = inner.waiters.iter().position(|w| {
                    confirmation
                        .sender_id
                        .is_none_or(|sender| sender == w.sender_id)
                });
                match position.and_then(|p| inner.waiters.remove(p)) {
                    Some(waiter) => {
                        tracing::debug!(
                            ticket = waiter.ticket,
                            message_id = ?confirmation.message_id,
                            status = ?confirmation.status,
                            "send confirmed"
                        );
                        let _ = waiter.reply.send(confirmation);
                    }
                    None => {
                        tracing::debug!(?confirmation, "confirmation without pending send");
                    }
                }
            }
            GatewayEvent::IncomingMessage(message) => {
                tracing::debug!(message_id = %message.message_id, "pushed message");
                inner
                    .listeners
                    .retain(|_, listener| listener.send(message.clone()).is_ok());
            }
            GatewayEvent::Unknown { kind } => {
                tracing::debug!(?kind, "ignoring unknown gateway event");
            }
        }
    }

    fn on_link_closed(self: &Arc<Self>, generation: u64, clean: bool) {
        let mut inner = self.inner.lock();
        if inner.closing_generation == Some(generation) {
            inner.closing_generation = None;
            if inner.state == ConnectionState::Closing {
                self.set_state(&mut inner, ConnectionState::Closed);
            }
            tracing::info!(generation, "gateway connection closed");
            return;
        }
        if inner.generation != generation {
            return;
        }

        inner.link = None;
        self.set_state(&mut inner, ConnectionState::Closed);
        if clean {
            tracing::info!(generation, "gateway closed the connection cleanly");
            return;
        }

        tracing::warn!(generation, ref_count = inner.ref_count, "gateway connection lost");
        if inner.ref_count > 0 {
            self.schedule_reconnect(&mut inner);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.reconnect_timer.is_some() {
            return;
        }
        if inner.reconnect_attempts >= self.config.max_reconnect_attempts {
            tracing::warn!(
                attempts = inner.reconnect_attempts,
                "reconnect attempts exhausted, staying closed"
            );
            return;
        }

        let delay = backoff::reconnect_delay(self.config.reconnect_base_delay, inner.reconnect_attempts);
        inner.reconnect_attempts += 1;
        tracing::info!(
            attempt = inner.reconnect_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let this = Arc::clone(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect_now();
        }));
    }

    fn reconnect_now(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.reconnect_timer = None;
        if inner.ref_count == 0 || inner.attempt.is_some() || inner.state == ConnectionState::Open {
            return;
        }
        self.start_attempt(&mut inner);
    }

    fn close_if_unused(&self) {
        let mut inner = self.inner.lock();
        inner.grace_timer = None;
        if inner.ref_count > 0 {
            return;
        }
        tracing::info!("grace period elapsed with no references, closing connection");
        inner.cancel_reconnect_timer();
        self.close_link(&mut inner);
    }

    /// Cleanly close the current link (if any) and invalidate in-flight attempts.
    fn close_link(&self, inner: &mut Inner) {
        if let Some(link) = inner.link.take() {
            let _ = link.send(Frame::Close);
            inner.closing_generation = Some(inner.generation);
            self.set_state(inner, ConnectionState::Closing);
        } else {
            self.set_state(inner, ConnectionState::Closed);
        }
        inner.generation += 1;
        inner.attempt = None;
    }
}
