//! Read-receipt watermark.
//!
//! The [`ReadTracker`] decides when a read receipt is worth sending. A pass
//! picks the highest unread incoming message as the candidate and issues a
//! receipt only if the candidate is above the last watermark the backend
//! accepted and no receipt is already in flight. Periodic passes therefore
//! debounce themselves: nothing new to read, nothing sent.

use matchsync_proto::message::MessageId;

use super::reconcile::Conversation;

/// Tracks the read watermark of one session.
#[derive(Debug, Default, Clone)]
pub struct ReadTracker {
    /// Highest watermark the backend acknowledged.
    acknowledged: Option<MessageId>,
    in_flight: Option<MessageId>,
    /// Watermark of a failed receipt, retried on the next pass.
    retry: Option<MessageId>,
}

impl ReadTracker {
    /// Tracker with no watermark yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest watermark acknowledged by the backend.
    #[must_use]
    pub const fn watermark(&self) -> Option<MessageId> {
        self.acknowledged
    }

    /// Whether a receipt is awaiting its response.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start a read pass over `conversation`.
    ///
    /// Returns the watermark to send, if any. The caller marks messages up to
    /// it as read locally, issues the receipt and reports back through
    /// [`complete`](Self::complete).
    pub fn begin(&mut self, conversation: &Conversation) -> Option<MessageId> {
        if self.in_flight.is_some() {
            return None;
        }
        let candidate = conversation.highest_unread_incoming().max(self.retry.take())?;
        if self.acknowledged.is_some_and(|sent| candidate <= sent) {
            return None;
        }
        self.in_flight = Some(candidate);
        Some(candidate)
    }

    /// Record the outcome of the receipt for `watermark`.
    pub fn complete(&mut self, watermark: MessageId, accepted: bool) {
        if self.in_flight == Some(watermark) {
            self.in_flight = None;
        }
        if accepted {
            self.acknowledged = self.acknowledged.max(Some(watermark));
        } else {
            tracing::warn!(%watermark, "read receipt failed, retrying on next pass");
            self.retry = self.retry.max(Some(watermark));
        }
    }

    /// Forget all watermark state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
