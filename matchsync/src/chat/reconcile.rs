//! Reconciliation of optimistic, pushed and polled messages.
//!
//! A [`Conversation`] holds the single ordered message list of one session.
//! Three inflows feed it:
//!
//! 1. [`insert_optimistic`](Conversation::insert_optimistic) appends a
//!    placeholder the moment the user sends.
//! 2. [`apply_send_result`](Conversation::apply_send_result) and
//!    [`apply_incoming`](Conversation::apply_incoming) handle what the
//!    gateway reports.
//! 3. [`merge_snapshot`](Conversation::merge_snapshot) diffs a polled page
//!    against the list.
//!
//! Two copies are the same message when their real ids are equal, or when a
//! still-unconfirmed placeholder has the same direction and trimmed content
//! as the incoming copy and both were created within the dedup window. A
//! match updates the existing entry in place; the list never reorders.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use matchsync_proto::gateway::IncomingMessage;
use matchsync_proto::message::{DeliveryStatus, HistoryMessage, MessageId, UserId};

use super::{Direction, Message, MessageStatus};

/// Outcome of a send, as far as reconciliation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server stored the message under this id.
    Confirmed(MessageId),
    /// The server rejected the message, or never answered.
    Failed,
}

/// Ordered, deduplicated message list of one conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    me: UserId,
    other: UserId,
    messages: Vec<Message>,
    /// Placeholder ids that were replaced by a real id, so a late send result
    /// still finds its entry.
    promoted: HashMap<MessageId, MessageId>,
    dedup_window: TimeDelta,
    next_placeholder: i64,
}

impl Conversation {
    /// Empty conversation between `me` and `other`.
    #[must_use]
    pub fn new(me: UserId, other: UserId, dedup_window: Duration) -> Self {
        Self {
            me,
            other,
            messages: Vec::new(),
            promoted: HashMap::new(),
            dedup_window: TimeDelta::from_std(dedup_window).unwrap_or(TimeDelta::MAX),
            next_placeholder: MessageId::PLACEHOLDER_FLOOR,
        }
    }

    /// Messages in display order, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look a message up by id, following placeholder promotions.
    #[must_use]
    pub fn find(&self, id: MessageId) -> Option<&Message> {
        let id = self.resolve(id);
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a placeholder for a message the local user just wrote.
    ///
    /// Returns the placeholder id, which stays valid as a key for
    /// [`apply_send_result`](Self::apply_send_result) even after the entry
    /// is promoted to a real id.
    pub fn insert_optimistic(&mut self, content: &str, now: DateTime<Utc>) -> MessageId {
        let id = MessageId::new(self.allocate_placeholder(now));
        self.messages.push(Message {
            id,
            content: content.to_string(),
            direction: Direction::Outgoing,
            status: MessageStatus::Sending,
            is_read: false,
            read_at: None,
            created_at: now,
            sender_id: self.me,
            receiver_id: self.other,
        });
        tracing::debug!(%id, "optimistic message inserted");
        id
    }

    fn allocate_placeholder(&mut self, now: DateTime<Utc>) -> i64 {
        let candidate = MessageId::PLACEHOLDER_FLOOR.saturating_add(now.timestamp_millis().max(0));
        let id = candidate.max(self.next_placeholder);
        self.next_placeholder = id.saturating_add(1);
        id
    }

    /// Record the outcome of sending the message keyed by `placeholder`.
    ///
    /// Returns the entry's status afterwards, or `None` if the entry no
    /// longer exists.
    pub fn apply_send_result(
        &mut self,
        placeholder: MessageId,
        outcome: SendOutcome,
    ) -> Option<MessageStatus> {
        let current = self.resolve(placeholder);
        let index = self.messages.iter().position(|m| m.id == current)?;

        match outcome {
            SendOutcome::Failed => {
                if !self.messages[index].advance(MessageStatus::Failed) {
                    tracing::debug!(id = %current, status = ?self.messages[index].status, "send failure ignored, message already settled");
                }
            }
            SendOutcome::Confirmed(real) if current.is_placeholder() => {
                if let Some(existing) = self.messages.iter().position(|m| m.id == real) {
                    // A pushed or polled copy already carries the real id.
                    self.messages.remove(index);
                    self.promoted.insert(placeholder, real);
                    let survivor = if existing > index { existing - 1 } else { existing };
                    self.messages[survivor].advance(MessageStatus::Delivered);
                    return Some(self.messages[survivor].status);
                }
                let entry = &mut self.messages[index];
                entry.id = real;
                entry.advance(MessageStatus::Delivered);
                self.promoted.insert(placeholder, real);
                tracing::debug!(%placeholder, %real, "placeholder confirmed");
            }
            SendOutcome::Confirmed(real) => {
                if current != real {
                    tracing::debug!(%placeholder, matched = %current, confirmed = %real, "confirmation for a message already matched by content");
                }
                self.messages[index].advance(MessageStatus::Delivered);
            }
        }
        Some(self.messages[index].status)
    }

    /// Merge a message pushed by the gateway.
    ///
    /// Messages that do not belong to this conversation are ignored. Returns
    /// whether a new entry was appended.
    pub fn apply_incoming(&mut self, pushed: &IncomingMessage, now: DateTime<Utc>) -> bool {
        if !pushed.is_between(self.me, self.other) {
            tracing::debug!(message_id = %pushed.message_id, "push for another conversation ignored");
            return false;
        }
        let direction = if pushed.sender_id == self.me {
            Direction::Outgoing
        } else {
            Direction::Incoming
        };
        let candidate = Message {
            id: pushed.message_id,
            content: pushed.content.clone(),
            direction,
            status: MessageStatus::Delivered,
            is_read: false,
            read_at: None,
            created_at: now,
            sender_id: pushed.sender_id,
            receiver_id: pushed.receiver_id,
        };
        self.merge_one(candidate)
    }

    /// Merge a polled page of the newest messages (newest first, as the
    /// backend returns it).
    ///
    /// Unmatched messages are appended oldest first so the list stays
    /// newest-last. Merging the same page twice changes nothing the second
    /// time. Returns the number of appended entries.
    pub fn merge_snapshot(&mut self, page: &[HistoryMessage], now: DateTime<Utc>) -> usize {
        let mut appended = 0;
        for entry in page.iter().rev() {
            let candidate = self.from_history(entry, now);
            if self.merge_one(candidate) {
                appended += 1;
            }
        }
        if appended > 0 {
            tracing::debug!(appended, "poll snapshot added messages");
        }
        appended
    }

    /// Prepend a page of older history (newest first, as returned).
    ///
    /// Older pages are not reconciled against the list; only entries whose
    /// id is already present are skipped. Returns the number of prepended
    /// entries.
    pub fn prepend_older(&mut self, page: &[HistoryMessage], now: DateTime<Utc>) -> usize {
        let mut older: Vec<Message> = page
            .iter()
            .rev()
            .filter(|entry| !self.messages.iter().any(|m| m.id == entry.id))
            .map(|entry| self.from_history(entry, now))
            .collect();
        let count = older.len();
        older.append(&mut self.messages);
        self.messages = older;
        count
    }

    /// Smallest server id in the list; the cursor for loading older history.
    #[must_use]
    pub fn oldest_real_id(&self) -> Option<MessageId> {
        self.messages
            .iter()
            .filter(|m| !m.is_placeholder())
            .map(|m| m.id)
            .min()
    }

    /// Highest server id among incoming messages not yet read locally.
    #[must_use]
    pub fn highest_unread_incoming(&self) -> Option<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Incoming && !m.is_read && !m.is_placeholder())
            .map(|m| m.id)
            .max()
    }

    /// Mark every incoming message with id up to `watermark` as read.
    ///
    /// Returns how many entries changed.
    pub fn mark_read_up_to(&mut self, watermark: MessageId, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for msg in &mut self.messages {
            if msg.direction == Direction::Incoming
                && !msg.is_read
                && !msg.is_placeholder()
                && msg.id <= watermark
            {
                msg.is_read = true;
                msg.read_at = Some(now);
                changed += 1;
            }
        }
        changed
    }

    /// Put a failed message back to `Sending` for an explicit retry.
    ///
    /// Returns the content to resend, or `None` if `id` is not a failed
    /// outgoing message.
    pub fn mark_retrying(&mut self, id: MessageId, now: DateTime<Utc>) -> Option<String> {
        let id = self.resolve(id);
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.is_outgoing() && m.status == MessageStatus::Failed)?;
        msg.status = MessageStatus::Sending;
        msg.created_at = now;
        Some(msg.content.clone())
    }

    /// Drop every message.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.promoted.clear();
    }

    fn resolve(&self, id: MessageId) -> MessageId {
        self.promoted.get(&id).copied().unwrap_or(id)
    }

    fn from_history(&self, entry: &HistoryMessage, now: DateTime<Utc>) -> Message {
        let (direction, sender_id, receiver_id) = if entry.is_sent {
            (Direction::Outgoing, self.me, self.other)
        } else {
            (Direction::Incoming, self.other, self.me)
        };
        Message {
            id: entry.id,
            content: entry.content.clone(),
            direction,
            status: status_from_history(entry),
            is_read: entry.is_read,
            read_at: entry.read_at,
            created_at: now,
            sender_id,
            receiver_id,
        }
    }

    /// Merge one copy into the list. Returns whether it was appended.
    fn merge_one(&mut self, candidate: Message) -> bool {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .find(|m| !m.is_placeholder() && m.id == candidate.id)
        {
            absorb(existing, &candidate);
            return false;
        }

        let window = self.dedup_window;
        if let Some(existing) = self.messages.iter_mut().find(|m| {
            m.is_placeholder()
                && m.direction == candidate.direction
                && m.content.trim() == candidate.content.trim()
                && (m.created_at - candidate.created_at).abs() <= window
        }) {
            let placeholder = existing.id;
            existing.id = candidate.id;
            absorb(existing, &candidate);
            self.promoted.insert(placeholder, candidate.id);
            tracing::debug!(%placeholder, real = %candidate.id, "placeholder matched by content");
            return false;
        }

        self.messages.push(candidate);
        true
    }
}

/// Refresh `existing` with what `update` knows, without moving backwards.
fn absorb(existing: &mut Message, update: &Message) {
    if existing.is_outgoing() {
        existing.advance(update.status);
    }
    if update.is_read && !existing.is_read {
        existing.is_read = true;
    }
    if existing.read_at.is_none() {
        existing.read_at = update.read_at;
    }
}

/// Local status of a history entry.
fn status_from_history(entry: &HistoryMessage) -> MessageStatus {
    if !entry.is_sent {
        return MessageStatus::Delivered;
    }
    if entry.is_read {
        return MessageStatus::Read;
    }
    match entry.status {
        Some(DeliveryStatus::Sending) => MessageStatus::Sending,
        Some(DeliveryStatus::Read) => MessageStatus::Read,
        Some(DeliveryStatus::Failed) => MessageStatus::Failed,
        Some(DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Unknown) | None => {
            MessageStatus::Delivered
        }
    }
}
