//! In-memory [`ChatApi`] for tests.
//!
//! Holds every message of the local user's conversations in one list and
//! answers history queries the way the REST backend does: newest first,
//! `null` for a conversation that has no messages at all.

use std::sync::Arc;

use parking_lot::Mutex;

use matchsync_proto::message::{DeliveryStatus, HistoryMessage, MarkReadRequest, MessageId, UserId};

use super::{ApiError, ChatApi};

/// A message as the backend stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Server id.
    pub id: MessageId,
    /// Author.
    pub sender: UserId,
    /// Recipient.
    pub receiver: UserId,
    /// Text.
    pub content: String,
    /// Delivery status reported to the author.
    pub status: DeliveryStatus,
    /// Whether the recipient has read it.
    pub is_read: bool,
}

#[derive(Debug, Default)]
struct Store {
    messages: Vec<StoredMessage>,
    failing: bool,
    stalled: bool,
    read_calls: Vec<MarkReadRequest>,
    fetches: usize,
}

/// Shared, cloneable in-memory backend scoped to one local user.
#[derive(Debug, Clone)]
pub struct InMemoryChatApi {
    me: UserId,
    store: Arc<Mutex<Store>>,
}

impl InMemoryChatApi {
    /// Empty backend answering on behalf of `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Store a delivered, unread message.
    pub fn push_message(
        &self,
        sender: UserId,
        receiver: UserId,
        id: MessageId,
        content: impl Into<String>,
    ) {
        self.store.lock().messages.push(StoredMessage {
            id,
            sender,
            receiver,
            content: content.into(),
            status: DeliveryStatus::Delivered,
            is_read: false,
        });
    }

    /// Change the status of a stored message.
    pub fn set_status(&self, id: MessageId, status: DeliveryStatus) {
        if let Some(msg) = self.store.lock().messages.iter_mut().find(|m| m.id == id) {
            msg.status = status;
        }
    }

    /// Mark a stored message as read by its recipient.
    pub fn set_read(&self, id: MessageId) {
        if let Some(msg) = self.store.lock().messages.iter_mut().find(|m| m.id == id) {
            msg.is_read = true;
        }
    }

    /// Make every following request fail with a 503.
    pub fn set_failing(&self, failing: bool) {
        self.store.lock().failing = failing;
    }

    /// Make every following request hang without ever answering, the way a
    /// dead TCP connection does.
    pub fn set_stalled(&self, stalled: bool) {
        self.store.lock().stalled = stalled;
    }

    async fn stall_if_requested(&self) {
        let stalled = self.store.lock().stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Read-receipt requests received so far, oldest first.
    #[must_use]
    pub fn read_calls(&self) -> Vec<MarkReadRequest> {
        self.store.lock().read_calls.clone()
    }

    /// Number of history requests received so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.store.lock().fetches
    }

    /// Snapshot of every stored message.
    #[must_use]
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.store.lock().messages.clone()
    }
}

impl ChatApi for InMemoryChatApi {
    async fn fetch_history(
        &self,
        other: UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Option<Vec<HistoryMessage>>, ApiError> {
        self.stall_if_requested().await;
        let mut store = self.store.lock();
        store.fetches += 1;
        if store.failing {
            return Err(ApiError::Status { status: 503 });
        }

        let me = self.me;
        let mut conversation: Vec<&StoredMessage> = store
            .messages
            .iter()
            .filter(|m| {
                (m.sender == me && m.receiver == other) || (m.sender == other && m.receiver == me)
            })
            .collect();
        if conversation.is_empty() {
            return Ok(None);
        }

        conversation.sort_by(|a, b| b.id.cmp(&a.id));
        let page = conversation
            .into_iter()
            .filter(|m| before.is_none_or(|cursor| m.id < cursor))
            .take(limit)
            .map(|m| HistoryMessage {
                id: m.id,
                content: m.content.clone(),
                is_sent: m.sender == me,
                status: Some(m.status),
                is_read: m.is_read,
                read_at: None,
            })
            .collect();
        Ok(Some(page))
    }

    async fn mark_read(&self, sender: UserId, last_read: MessageId) -> Result<(), ApiError> {
        self.stall_if_requested().await;
        let mut store = self.store.lock();
        if store.failing {
            return Err(ApiError::Status { status: 503 });
        }
        store.read_calls.push(MarkReadRequest {
            sender_id: sender,
            last_read_message_id: last_read,
        });
        let me = self.me;
        for msg in &mut store.messages {
            if msg.sender == sender && msg.receiver == me && msg.id <= last_read {
                msg.is_read = true;
                msg.status = DeliveryStatus::Read;
            }
        }
        Ok(())
    }
}
