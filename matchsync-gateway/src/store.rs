//! In-memory conversation store backing the gateway and its history API.
//!
//! Messages are kept per conversation, keyed by the unordered pair of
//! participants, in the order they were accepted. Ids come from a single
//! counter, so they increase across the whole store and a larger id is
//! always a newer message.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use matchsync_proto::message::{DeliveryStatus, HistoryMessage, MessageId, UserId};

/// A message accepted by the gateway.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Author.
    pub sender: UserId,
    /// Recipient.
    pub receiver: UserId,
    /// Text as sent.
    pub content: String,
    /// When the gateway accepted it.
    pub sent_at: DateTime<Utc>,
    /// When the recipient acknowledged reading it.
    pub read_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Render this message as seen by `viewer`.
    fn to_history(&self, viewer: UserId) -> HistoryMessage {
        let is_read = self.read_at.is_some();
        HistoryMessage {
            id: self.id,
            content: self.content.clone(),
            is_sent: self.sender == viewer,
            status: Some(if is_read {
                DeliveryStatus::Read
            } else {
                DeliveryStatus::Delivered
            }),
            is_read,
            read_at: self.read_at,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<(UserId, UserId), Vec<StoredMessage>>,
    next_id: i64,
}

/// Conversation key independent of who is asking.
fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Thread-safe store of all conversations.
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: RwLock<Inner>,
}

impl ConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a message and returns its stored form.
    pub async fn append(&self, sender: UserId, receiver: UserId, content: String) -> StoredMessage {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let message = StoredMessage {
            id: MessageId::new(inner.next_id),
            sender,
            receiver,
            content,
            sent_at: Utc::now(),
            read_at: None,
        };
        inner
            .conversations
            .entry(pair(sender, receiver))
            .or_default()
            .push(message.clone());
        message
    }

    /// Up to `limit` messages between `me` and `other`, newest first.
    ///
    /// With `before`, only messages with a smaller id are returned. `None`
    /// means the two users never exchanged a message.
    pub async fn history(
        &self,
        me: UserId,
        other: UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Option<Vec<HistoryMessage>> {
        let inner = self.inner.read().await;
        let messages = inner.conversations.get(&pair(me, other))?;
        Some(
            messages
                .iter()
                .rev()
                .filter(|m| before.is_none_or(|before| m.id < before))
                .take(limit)
                .map(|m| m.to_history(me))
                .collect(),
        )
    }

    /// Marks every message `sender` sent to `reader` up to `last_read` as
    /// read. Returns how many changed.
    pub async fn mark_read(&self, reader: UserId, sender: UserId, last_read: MessageId) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let Some(messages) = inner.conversations.get_mut(&pair(reader, sender)) else {
            return 0;
        };
        let mut changed = 0;
        for message in messages
            .iter_mut()
            .filter(|m| m.sender == sender && m.id <= last_read && m.read_at.is_none())
        {
            message.read_at = Some(now);
            changed += 1;
        }
        changed
    }

    /// Number of messages between `a` and `b`.
    pub async fn conversation_len(&self, a: UserId, b: UserId) -> usize {
        let inner = self.inner.read().await;
        inner.conversations.get(&pair(a, b)).map_or(0, Vec::len)
    }
}
