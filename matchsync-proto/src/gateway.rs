//! Gateway wire types exchanged over the duplex connection.
//!
//! The client only ever sends [`ClientCommand`]s. The gateway answers with
//! [`GatewayEvent`]s: a [`SendConfirmation`] correlated with an earlier send,
//! or an [`IncomingMessage`] pushed when the other participant writes.
//! Frames whose `type` this client does not know are surfaced as
//! [`GatewayEvent::Unknown`] instead of being coerced into a known shape.

use serde::{Deserialize, Serialize};

use crate::message::{DeliveryStatus, MessageId, UserId, lenient_timestamp};

/// Commands sent from the client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientCommand {
    /// Deliver a chat message to `receiver_id`.
    #[serde(rename = "sendMessage")]
    SendMessage(OutgoingMessage),
}

impl ClientCommand {
    /// The user on whose behalf the command is sent.
    #[must_use]
    pub const fn sender_id(&self) -> UserId {
        match self {
            Self::SendMessage(msg) => msg.sender_id,
        }
    }
}

/// Body of a `sendMessage` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Message text.
    pub content: String,
    /// The pair is a confirmed match.
    #[serde(default)]
    pub is_final_match: bool,
    /// The pair is a potential (not yet confirmed) match.
    #[serde(default)]
    pub is_potential_match: bool,
}

/// Gateway reply to a `sendMessage` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfirmation {
    /// Id the server assigned, absent when the send was rejected.
    #[serde(default)]
    pub message_id: Option<MessageId>,
    /// Outcome reported by the server.
    pub status: DeliveryStatus,
    /// Author of the confirmed message, when the gateway includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

impl SendConfirmation {
    /// Whether the server accepted the message.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        self.message_id.is_some() && !self.status.is_failure()
    }
}

/// A message pushed by the gateway as soon as it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Server-assigned id.
    pub message_id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Message text.
    pub content: String,
    /// Server-side creation time.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl IncomingMessage {
    /// Whether this message belongs to the conversation between `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// Events received from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Confirmation of an earlier `sendMessage` command.
    SendConfirmation(SendConfirmation),
    /// A message pushed in realtime.
    IncomingMessage(IncomingMessage),
    /// A well-formed frame with a `type` this client does not handle.
    Unknown {
        /// The frame's `type` field, if it had one.
        kind: Option<String>,
    },
}
