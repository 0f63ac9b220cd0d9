#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

//! Property tests for the gateway wire format.
//!
//! 1. Arbitrary text never makes the decoders panic.
//! 2. Any object whose `type` is not a known event decodes as `Unknown`.
//! 3. Message content of any shape survives the command and push codecs.

use matchsync_proto::codec::{decode_command, decode_event, encode_command, encode_event};
use matchsync_proto::gateway::{ClientCommand, GatewayEvent, IncomingMessage, OutgoingMessage};
use matchsync_proto::message::{MessageId, UserId};
use proptest::prelude::*;

fn arb_user() -> impl Strategy<Value = UserId> {
    any::<i64>().prop_map(UserId::new)
}

proptest! {
    #[test]
    fn decoders_never_panic(frame in ".{0,256}") {
        let _ = decode_event(&frame);
        let _ = decode_command(&frame);
    }

    #[test]
    fn unknown_types_are_surfaced(
        kind in "[a-zA-Z]{1,16}",
        extra in any::<i64>(),
    ) {
        prop_assume!(kind != "message" && kind != "sendMessage");
        let frame = serde_json::json!({ "type": kind, "payload": extra }).to_string();
        let event = decode_event(&frame).unwrap();
        prop_assert_eq!(event, GatewayEvent::Unknown { kind: Some(kind) });
    }

    #[test]
    fn command_content_survives(
        sender in arb_user(),
        receiver in arb_user(),
        content in any::<String>(),
        is_final_match in any::<bool>(),
        is_potential_match in any::<bool>(),
    ) {
        let cmd = ClientCommand::SendMessage(OutgoingMessage {
            sender_id: sender,
            receiver_id: receiver,
            content,
            is_final_match,
            is_potential_match,
        });
        let frame = encode_command(&cmd).unwrap();
        prop_assert_eq!(decode_command(&frame).unwrap(), cmd);
    }

    #[test]
    fn pushed_message_survives(
        id in 1..i64::MAX,
        sender in arb_user(),
        receiver in arb_user(),
        content in any::<String>(),
    ) {
        let event = GatewayEvent::IncomingMessage(IncomingMessage {
            message_id: MessageId::new(id),
            sender_id: sender,
            receiver_id: receiver,
            content,
            timestamp: None,
        });
        let frame = encode_event(&event).unwrap();
        prop_assert_eq!(decode_event(&frame).unwrap(), event);
    }
}
