//! Message-level wire types for the `MatchSync` protocol.
//!
//! Identifiers are plain integers on the wire. The history and read-receipt
//! payloads mirror what the REST backend returns; the engine converts them
//! into its own richer message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Maximum allowed message content size in bytes (4 KB).
pub const MAX_CONTENT_SIZE: usize = 4 * 1024;

/// Identifies a participant (the engine owner or their match).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Creates a user identifier from its numeric value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a message.
///
/// Server-assigned ids are small positive integers. Ids at or above
/// [`MessageId::PLACEHOLDER_FLOOR`] are reserved for locally generated
/// placeholders that have not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Lowest id a placeholder may take. No server id ever reaches it.
    pub const PLACEHOLDER_FLOOR: i64 = 1_000_000_000_000;

    /// Creates a message identifier from its numeric value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this id is a local placeholder rather than a server id.
    #[must_use]
    pub const fn is_placeholder(self) -> bool {
        self.0 >= Self::PLACEHOLDER_FLOOR
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Not yet accepted by the server.
    Sending,
    /// Accepted by the server.
    Sent,
    /// Handed to the recipient.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Rejected by the server.
    Failed,
    /// Anything this client does not understand.
    #[serde(other)]
    Unknown,
}

impl DeliveryStatus {
    /// Whether the server reports the message as rejected.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// One entry of a history page, as returned by the REST backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Message text.
    pub content: String,
    /// `true` when the requesting user sent this message.
    pub is_sent: bool,
    /// Delivery status, if the backend reports one.
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    /// Whether the receiving side has read the message.
    #[serde(default)]
    pub is_read: bool,
    /// When the message was read, if it was.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Response body of the history endpoint.
///
/// `messages` may be `null`; that means "no history", not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Messages ordered newest first.
    #[serde(default)]
    pub messages: Option<Vec<HistoryMessage>>,
}

impl HistoryPage {
    /// Returns the messages, treating an absent list as empty.
    #[must_use]
    pub fn into_messages(self) -> Vec<HistoryMessage> {
        self.messages.unwrap_or_default()
    }
}

/// Reads an optional timestamp given as RFC 3339 text or epoch milliseconds.
///
/// Any other value, including text that does not parse, reads as `None` so
/// an odd timestamp never drops the message carrying it.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

/// Request body of the read-receipt endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    /// The user whose messages are being marked as read.
    pub sender_id: UserId,
    /// Every message from `sender_id` up to and including this id is read.
    pub last_read_message_id: MessageId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_floor_is_exclusive_of_server_ids() {
        assert!(!MessageId::new(42).is_placeholder());
        assert!(!MessageId::new(MessageId::PLACEHOLDER_FLOOR - 1).is_placeholder());
        assert!(MessageId::new(MessageId::PLACEHOLDER_FLOOR).is_placeholder());
    }

    #[test]
    fn ids_serialize_as_bare_integers() {
        let json = serde_json::to_string(&MessageId::new(17)).unwrap();
        assert_eq!(json, "17");
        let user: UserId = serde_json::from_str("5").unwrap();
        assert_eq!(user, UserId::new(5));
    }

    #[test]
    fn unknown_status_string_maps_to_unknown() {
        let status: DeliveryStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(status, DeliveryStatus::Unknown);
        let status: DeliveryStatus = serde_json::from_str("\"delivered\"").unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[test]
    fn null_message_list_is_empty() {
        let page: HistoryPage = serde_json::from_str(r#"{"messages":null}"#).unwrap();
        assert!(page.into_messages().is_empty());
        let page: HistoryPage = serde_json::from_str("{}").unwrap();
        assert!(page.into_messages().is_empty());
    }

    #[test]
    fn history_message_uses_camel_case() {
        let json = r#"{"id":3,"content":"hey","isSent":true,"status":"read","isRead":true,"readAt":"2024-05-01T10:00:00Z"}"#;
        let msg: HistoryMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, MessageId::new(3));
        assert!(msg.is_sent);
        assert_eq!(msg.status, Some(DeliveryStatus::Read));
        assert!(msg.read_at.is_some());
    }

    #[test]
    fn history_message_tolerates_missing_optional_fields() {
        let json = r#"{"id":9,"content":"yo","isSent":false}"#;
        let msg: HistoryMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.status, None);
        assert!(!msg.is_read);
        assert_eq!(msg.read_at, None);
    }

    #[test]
    fn read_at_accepts_epoch_millis_and_ignores_garbage() {
        let json = r#"{"id":4,"content":"a","isSent":true,"readAt":1714557600000}"#;
        let msg: HistoryMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.read_at, DateTime::from_timestamp(1_714_557_600, 0));

        let json = r#"{"id":5,"content":"b","isSent":true,"readAt":"yesterday"}"#;
        let msg: HistoryMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.read_at, None);

        let json = r#"{"id":6,"content":"c","isSent":true,"readAt":null}"#;
        let msg: HistoryMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.read_at, None);
    }

    #[test]
    fn mark_read_request_field_names() {
        let req = MarkReadRequest {
            sender_id: UserId::new(2),
            last_read_message_id: MessageId::new(40),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"senderId":2,"lastReadMessageId":40}"#);
    }
}
