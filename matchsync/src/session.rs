//! Per-conversation session actor.
//!
//! A [`ChatSession`] owns the [`Conversation`] and [`ReadTracker`] of one
//! conversation inside a single task. Everything that can change them
//! arrives as an event on one unbounded queue:
//!
//! - UI commands sent through the [`ChatSession`] handle;
//! - the poll timer, which fetches the newest page and posts the result;
//! - the read timer and one-shot read passes;
//! - pushed messages forwarded from the connection's listener;
//! - connection state changes;
//! - completions of sends, page loads and read receipts.
//!
//! Events are applied strictly in arrival order and the resulting UI state
//! is published as a [`SessionSnapshot`] over a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use matchsync_proto::gateway::{ClientCommand, IncomingMessage, OutgoingMessage, SendConfirmation};
use matchsync_proto::message::{MAX_CONTENT_SIZE, MessageId, UserId};

use crate::chat::read::ReadTracker;
use crate::chat::reconcile::{Conversation, SendOutcome};
use crate::chat::{Message, MessageStatus};
use crate::config::{ReadConfig, SyncConfig, SyncTimings};
use crate::connection::{ConnectionManager, ConnectionState, ListenerId, SendError};
use crate::history::{ApiError, ChatApi, HistoryFetcher, Page};
use crate::transport::Connector;

/// Who is talking to whom, plus the match flags every send carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// The local user.
    pub me: UserId,
    /// The conversation partner.
    pub other: UserId,
    /// The pair is a confirmed match.
    pub is_final_match: bool,
    /// The pair is a potential match.
    pub is_potential_match: bool,
}

/// UI-facing state of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Messages in display order, oldest first.
    pub messages: Vec<Message>,
    /// Whether the shared connection is open.
    pub is_connected: bool,
    /// Whether the initial history load is still running.
    pub is_loading: bool,
    /// Whether older history may exist.
    pub has_more_messages: bool,
    /// Whether at least one send awaits its outcome.
    pub is_sending: bool,
    /// Whether an older page is being loaded.
    pub is_loading_more: bool,
}

enum Event {
    Send {
        content: String,
        reply: oneshot::Sender<bool>,
    },
    Retry {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    LoadMore {
        reply: oneshot::Sender<()>,
    },
    MarkRead,
    PausePolling,
    ResumePolling,
    ScheduleRead(Duration),
    Close,

    InitialLoaded(Result<Page, ApiError>),
    Polled(Result<Page, ApiError>),
    OlderLoaded {
        result: Result<Page, ApiError>,
        reply: oneshot::Sender<()>,
    },
    Pushed(IncomingMessage),
    Connection(ConnectionState),
    SendFinished {
        key: MessageId,
        result: Result<SendConfirmation, SendError>,
        reply: oneshot::Sender<bool>,
    },
    ReadTick,
    ReadFinished {
        watermark: MessageId,
        result: Result<(), ApiError>,
    },
}

/// Handle to a running conversation session.
///
/// Dropping the handle tears the session down as well; [`close`](Self::close)
/// does the same but waits until teardown has finished.
pub struct ChatSession {
    params: SessionParams,
    events: mpsc::UnboundedSender<Event>,
    snapshot: watch::Receiver<SessionSnapshot>,
    actor: JoinHandle<()>,
}

impl ChatSession {
    /// Start a session: load the newest page, begin polling and listen for pushes.
    ///
    /// Does not take a connection reference; whoever opens the session is
    /// responsible for [`ConnectionManager::acquire`].
    pub fn start<K, A>(
        params: SessionParams,
        connection: Arc<ConnectionManager<K>>,
        api: A,
        config: &SyncConfig,
    ) -> Self
    where
        K: Connector,
        A: ChatApi,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            is_connected: connection.is_connected(),
            is_loading: true,
            ..SessionSnapshot::default()
        });

        let fetcher = Arc::new(HistoryFetcher::new(api, params.other, &config.sync));
        let (listener, pushes) = connection.add_listener();
        let producers = Producers {
            poll: None,
            read_tick: None,
            read_once: None,
            push: Some(spawn_push_forwarder(pushes, events_tx.clone())),
            state: Some(spawn_state_forwarder(
                connection.subscribe_state(),
                events_tx.clone(),
            )),
        };

        let actor = Actor {
            params,
            conversation: Conversation::new(params.me, params.other, config.sync.dedup_window),
            read: ReadTracker::new(),
            fetcher,
            is_connected: connection.is_connected(),
            connection,
            listener,
            timings: config.sync.clone(),
            read_config: config.read.clone(),
            events: events_tx.clone(),
            snapshot: snapshot_tx,
            producers,
            is_loading: true,
            history_loaded: false,
            has_more: false,
            is_loading_more: false,
            sends_in_flight: 0,
        };

        tracing::info!(me = %params.me, other = %params.other, "chat session started");
        let task = tokio::spawn(actor.run(events_rx));

        Self {
            params,
            events: events_tx,
            snapshot: snapshot_rx,
            actor: task,
        }
    }

    /// Participants and flags of this session.
    #[must_use]
    pub const fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Current UI state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch UI state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Send a message.
    ///
    /// The message appears immediately as `Sending`. Resolves to `true` once
    /// it is delivered and `false` if it failed, was empty or too large, or
    /// the session closed meanwhile.
    pub async fn send_message(&self, content: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Send {
            content: content.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Resend a failed message through the same path as
    /// [`send_message`](Self::send_message).
    ///
    /// Resolves to `false` straight away if `id` is not a failed message.
    pub async fn retry_failed_message(&self, id: MessageId) -> bool {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Retry { id, reply });
        rx.await.unwrap_or(false)
    }

    /// Load the next page of older history, if there may be one.
    pub async fn load_more_messages(&self) {
        let (reply, rx) = oneshot::channel();
        self.post(Event::LoadMore { reply });
        let _ = rx.await;
    }

    /// Run a read pass now.
    pub fn mark_messages_as_read(&self) {
        self.post(Event::MarkRead);
    }

    /// Stop the poll and read timers, e.g. while the app is in the background.
    pub fn pause_polling(&self) {
        self.post(Event::PausePolling);
    }

    /// Restart the poll and read timers.
    pub fn resume_polling(&self) {
        self.post(Event::ResumePolling);
    }

    /// Run one read pass after `delay`.
    pub fn schedule_read_pass(&self, delay: Duration) {
        self.post(Event::ScheduleRead(delay));
    }

    /// Tear the session down and wait until it is gone.
    ///
    /// All timers stop and the push listener is removed. Sends already on
    /// the wire are left to complete; their outcome is discarded.
    pub async fn close(mut self) {
        self.post(Event::Close);
        if (&mut self.actor).await.is_err() {
            tracing::debug!("session actor ended abnormally");
        }
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::debug!(other = %self.params.other, "session already closed");
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Timer and forwarder tasks feeding the actor. Aborted on drop.
struct Producers {
    poll: Option<JoinHandle<()>>,
    read_tick: Option<JoinHandle<()>>,
    read_once: Option<JoinHandle<()>>,
    push: Option<JoinHandle<()>>,
    state: Option<JoinHandle<()>>,
}

impl Producers {
    fn stop_timers(&mut self) {
        for task in [&mut self.poll, &mut self.read_tick, &mut self.read_once] {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for Producers {
    fn drop(&mut self) {
        self.stop_timers();
        for task in [&mut self.push, &mut self.state] {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

struct Actor<K: Connector, A: ChatApi> {
    params: SessionParams,
    conversation: Conversation,
    read: ReadTracker,
    fetcher: Arc<HistoryFetcher<A>>,
    connection: Arc<ConnectionManager<K>>,
    listener: ListenerId,
    timings: SyncTimings,
    read_config: ReadConfig,
    events: mpsc::UnboundedSender<Event>,
    snapshot: watch::Sender<SessionSnapshot>,
    producers: Producers,
    is_connected: bool,
    is_loading: bool,
    /// Whether any page of the newest history has arrived yet.
    history_loaded: bool,
    has_more: bool,
    is_loading_more: bool,
    sends_in_flight: usize,
}

impl<K: Connector, A: ChatApi> Actor<K, A> {
    fn start(&mut self) {
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(Event::InitialLoaded(fetcher.initial().await));
        });
        self.start_timers(self.timings.poll_initial_delay);
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        self.start();
        while let Some(event) = events.recv().await {
            if matches!(event, Event::Close) {
                break;
            }
            self.handle(event);
            self.publish();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.producers.stop_timers();
        self.connection.remove_listener(self.listener);
        self.conversation.reset();
        self.read.reset();
        self.publish();
        tracing::info!(other = %self.params.other, "chat session closed");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Send { content, reply } => self.send(content, reply),
            Event::Retry { id, reply } => self.retry(id, reply),
            Event::LoadMore { reply } => self.load_more(reply),
            Event::MarkRead | Event::ReadTick => self.read_pass(),
            Event::PausePolling => {
                tracing::debug!("polling paused");
                self.producers.stop_timers();
            }
            Event::ResumePolling => {
                tracing::debug!("polling resumed");
                self.start_timers(self.timings.poll_initial_delay);
            }
            Event::ScheduleRead(delay) => self.schedule_read(delay),
            Event::Close => {}

            Event::InitialLoaded(result) => {
                self.is_loading = false;
                match result {
                    Ok(page) => {
                        self.conversation.merge_snapshot(&page.messages, Utc::now());
                        self.history_loaded = true;
                        self.has_more = page.has_more;
                        self.schedule_read(self.read_config.read_initial_delay);
                    }
                    Err(e) => tracing::warn!(err = %e, "initial history load failed"),
                }
            }
            Event::Polled(result) => match result {
                Ok(page) => {
                    self.conversation.merge_snapshot(&page.messages, Utc::now());
                    // Stands in for the initial page when that one failed.
                    if !self.history_loaded {
                        self.history_loaded = true;
                        self.has_more = page.has_more;
                    }
                }
                Err(e) => tracing::warn!(err = %e, "history poll failed"),
            },
            Event::OlderLoaded { result, reply } => {
                self.is_loading_more = false;
                match result {
                    Ok(page) => {
                        let added = self.conversation.prepend_older(&page.messages, Utc::now());
                        self.has_more = page.has_more;
                        tracing::debug!(added, "older messages prepended");
                    }
                    Err(e) => tracing::warn!(err = %e, "loading older messages failed"),
                }
                let _ = reply.send(());
            }
            Event::Pushed(message) => {
                self.conversation.apply_incoming(&message, Utc::now());
            }
            Event::Connection(state) => {
                self.is_connected = state == ConnectionState::Open;
            }
            Event::SendFinished { key, result, reply } => {
                self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
                let outcome = match result {
                    Ok(confirmation) if confirmation.is_accepted() => confirmation
                        .message_id
                        .map_or(SendOutcome::Failed, SendOutcome::Confirmed),
                    Ok(confirmation) => {
                        tracing::warn!(status = ?confirmation.status, "gateway rejected message");
                        SendOutcome::Failed
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "message send failed");
                        SendOutcome::Failed
                    }
                };
                let status = self.conversation.apply_send_result(key, outcome);
                let _ = reply.send(matches!(
                    status,
                    Some(MessageStatus::Delivered | MessageStatus::Read)
                ));
            }
            Event::ReadFinished { watermark, result } => {
                if let Err(e) = &result {
                    tracing::warn!(err = %e, "read receipt request failed");
                }
                self.read.complete(watermark, result.is_ok());
            }
        }
    }

    fn send(&mut self, content: String, reply: oneshot::Sender<bool>) {
        if content.trim().is_empty() || content.len() > MAX_CONTENT_SIZE {
            tracing::debug!(len = content.len(), "message rejected before sending");
            let _ = reply.send(false);
            return;
        }
        let key = self.conversation.insert_optimistic(&content, Utc::now());
        self.dispatch_send(key, content, reply);
    }

    fn retry(&mut self, id: MessageId, reply: oneshot::Sender<bool>) {
        match self.conversation.mark_retrying(id, Utc::now()) {
            Some(content) => {
                tracing::info!(%id, "retrying failed message");
                self.dispatch_send(id, content, reply);
            }
            None => {
                let _ = reply.send(false);
            }
        }
    }

    fn dispatch_send(&mut self, key: MessageId, content: String, reply: oneshot::Sender<bool>) {
        let command = ClientCommand::SendMessage(OutgoingMessage {
            sender_id: self.params.me,
            receiver_id: self.params.other,
            content,
            is_final_match: self.params.is_final_match,
            is_potential_match: self.params.is_potential_match,
        });
        self.sends_in_flight += 1;

        let connection = Arc::clone(&self.connection);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connection.send(&command).await;
            let _ = events.send(Event::SendFinished { key, result, reply });
        });
    }

    fn load_more(&mut self, reply: oneshot::Sender<()>) {
        if self.is_loading_more || !self.has_more {
            let _ = reply.send(());
            return;
        }
        let Some(before) = self.conversation.oldest_real_id() else {
            let _ = reply.send(());
            return;
        };
        self.is_loading_more = true;

        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = fetcher.older(before).await;
            let _ = events.send(Event::OlderLoaded { result, reply });
        });
    }

    fn read_pass(&mut self) {
        let Some(watermark) = self.read.begin(&self.conversation) else {
            return;
        };
        let marked = self.conversation.mark_read_up_to(watermark, Utc::now());
        tracing::debug!(%watermark, marked, "sending read receipt");

        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = fetcher.mark_read(watermark).await;
            let _ = events.send(Event::ReadFinished { watermark, result });
        });
    }

    fn schedule_read(&mut self, delay: Duration) {
        if let Some(task) = self.producers.read_once.take() {
            task.abort();
        }
        let events = self.events.clone();
        self.producers.read_once = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ReadTick);
        }));
    }

    /// (Re)start the poll loop and the periodic read pass.
    fn start_timers(&mut self, first_poll: Duration) {
        self.producers.stop_timers();

        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let interval = self.timings.poll_interval;
        self.producers.poll = Some(tokio::spawn(async move {
            tokio::time::sleep(first_poll).await;
            loop {
                if events.send(Event::Polled(fetcher.poll().await)).is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }));

        let events = self.events.clone();
        let interval = self.read_config.read_interval;
        self.producers.read_tick = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if events.send(Event::ReadTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            messages: self.conversation.messages().to_vec(),
            is_connected: self.is_connected,
            is_loading: self.is_loading,
            has_more_messages: self.has_more,
            is_sending: self.sends_in_flight > 0,
            is_loading_more: self.is_loading_more,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

impl<K: Connector, A: ChatApi> Drop for Actor<K, A> {
    fn drop(&mut self) {
        self.connection.remove_listener(self.listener);
    }
}

fn spawn_push_forwarder(
    mut pushes: mpsc::UnboundedReceiver<IncomingMessage>,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = pushes.recv().await {
            if events.send(Event::Pushed(message)).is_err() {
                break;
            }
        }
    })
}

fn spawn_state_forwarder(
    mut states: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *states.borrow_and_update();
        if events.send(Event::Connection(initial)).is_err() {
            return;
        }
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if events.send(Event::Connection(state)).is_err() {
                break;
            }
        }
    })
}
