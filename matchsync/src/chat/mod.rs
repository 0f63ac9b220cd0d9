//! Conversation state: the message model, reconciliation and read tracking.
//!
//! Nothing in here performs I/O. The session actor feeds network results in
//! and reads the resulting state back out, which keeps every rule in this
//! module testable without a runtime.

pub mod read;
pub mod reconcile;

use chrono::{DateTime, Utc};

use matchsync_proto::message::{MessageId, UserId};

/// Which participant wrote a message, from the local user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Written by the local user.
    Outgoing,
    /// Written by the other participant.
    Incoming,
}

/// Delivery status of a message.
///
/// Outgoing messages move forward only: `Sending` to `Delivered` or
/// `Failed`, and `Delivered` to `Read`. `Sending` may jump straight to
/// `Read` when the first news about a message is that it was read. A
/// `Failed` message only leaves that state through an explicit retry.
/// Incoming messages are always `Delivered`; their read state lives in
/// [`Message::is_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Written locally, not yet acknowledged.
    Sending,
    /// Accepted by the server.
    Delivered,
    /// Read by the recipient.
    Read,
    /// The send did not succeed.
    Failed,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` is a forward step.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Sending, Self::Delivered | Self::Read | Self::Failed)
                | (Self::Delivered, Self::Read)
        )
    }
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a placeholder until the server assigns one.
    pub id: MessageId,
    /// Text as written.
    pub content: String,
    /// Who wrote it.
    pub direction: Direction,
    /// Delivery status.
    pub status: MessageStatus,
    /// Whether the recipient has read it.
    pub is_read: bool,
    /// When it was read, if known.
    pub read_at: Option<DateTime<Utc>>,
    /// Local wall-clock time at which this copy was created. Only used to
    /// match copies of the same message; never for ordering.
    pub created_at: DateTime<Utc>,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
}

impl Message {
    /// Whether the local user wrote this message.
    #[must_use]
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    /// Whether the id is still a local placeholder.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }

    /// Move the status forward if `next` is a legal step, returning whether it changed.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
