//! JSON text-frame codec for the gateway protocol.
//!
//! Decoding of inbound events is two-step: the frame is parsed as a generic
//! JSON object first, its `type` is inspected, and only known types are
//! deserialized into their concrete shape. Unknown types become
//! [`GatewayEvent::Unknown`]; a known type with missing or mistyped fields
//! is a [`CodecError`].

use serde::{Deserialize, Serialize};

use crate::gateway::{ClientCommand, GatewayEvent, IncomingMessage, SendConfirmation};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is not valid JSON, or does not match the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Wire shape of the events this client understands.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum KnownEvent {
    #[serde(rename = "sendMessage")]
    SendMessage(SendConfirmation),
    #[serde(rename = "message")]
    Message(IncomingMessage),
}

/// Encodes a [`ClientCommand`] as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_command(command: &ClientCommand) -> Result<String, CodecError> {
    Ok(serde_json::to_string(command)?)
}

/// Decodes a [`ClientCommand`] from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the frame is not a known command.
pub fn decode_command(frame: &str) -> Result<ClientCommand, CodecError> {
    Ok(serde_json::from_str(frame)?)
}

/// Encodes a [`GatewayEvent`] as a JSON text frame.
///
/// [`GatewayEvent::Unknown`] encodes as an object carrying only its `type`.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_event(event: &GatewayEvent) -> Result<String, CodecError> {
    let json = match event {
        GatewayEvent::SendConfirmation(conf) => {
            serde_json::to_string(&KnownEvent::SendMessage(conf.clone()))?
        }
        GatewayEvent::IncomingMessage(msg) => {
            serde_json::to_string(&KnownEvent::Message(msg.clone()))?
        }
        GatewayEvent::Unknown { kind } => serde_json::json!({ "type": kind }).to_string(),
    };
    Ok(json)
}

/// Decodes a [`GatewayEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the frame is not a JSON object, or if it carries
/// a known `type` but does not match that type's shape.
pub fn decode_event(frame: &str) -> Result<GatewayEvent, CodecError> {
    let value: serde_json::Value = serde_json::from_str(frame)?;
    let Some(object) = value.as_object() else {
        return Err(CodecError::NotAnObject);
    };

    let kind = object
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);

    match kind.as_deref() {
        Some("sendMessage" | "message") => match serde_json::from_value(value)? {
            KnownEvent::SendMessage(conf) => Ok(GatewayEvent::SendConfirmation(conf)),
            KnownEvent::Message(msg) => Ok(GatewayEvent::IncomingMessage(msg)),
        },
        _ => Ok(GatewayEvent::Unknown { kind }),
    }
}
