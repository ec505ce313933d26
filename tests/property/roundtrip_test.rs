// tests/property/roundtrip_test.rs

//! Round-trip properties: any valid message serialized and parsed again is
//! structurally equal to the original.

use bytes::BytesMut;
use latzero::core::protocol::{
    EmitMessage, ErrorMessage, Message, ResponseMessage, ResponseStatus, TriggerMessage,
    WireCodec,
};
use latzero::core::ErrorCode;
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

fn ident() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Za-z0-9._-]{1,64}").unwrap()
}

fn uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

fn payload() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
        proptest::collection::vec(any::<u8>(), 0..16)
            .prop_map(|v| json!(v)),
        proptest::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..4)
            .prop_map(|m| json!(m)),
    ]
}

fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::ValidationError),
        Just(ErrorCode::HandshakeError),
        Just(ErrorCode::AccessDenied),
        Just(ErrorCode::NotFound),
        Just(ErrorCode::Timeout),
        Just(ErrorCode::TooManyRequests),
        Just(ErrorCode::RoutingError),
        Just(ErrorCode::ShortCircuitNotImplemented),
        Just(ErrorCode::OutOfBounds),
        Just(ErrorCode::InternalError),
    ]
}

fn trigger_message() -> impl Strategy<Value = TriggerMessage> {
    (
        uuid(),
        ident(),
        ident(),
        payload(),
        proptest::option::of(ident()),
        proptest::option::of(ident()),
        proptest::option::of(0u64..600_000),
    )
        .prop_map(
            |(id, origin, trigger, payload, pool, destination, ttl_ms)| TriggerMessage {
                id,
                origin,
                trigger,
                payload,
                pool,
                destination,
                ttl_ms,
                flags: None,
                timestamp: None,
            },
        )
}

proptest! {
    #[test]
    fn prop_trigger_round_trips(original in trigger_message()) {
        let reparsed = Message::from_json(Message::Trigger(original.clone()).to_json()).unwrap();
        prop_assert_eq!(reparsed, Message::Trigger(original));
    }

    #[test]
    fn prop_emit_round_trips(
        trigger in ident(),
        payload in payload(),
        pool in proptest::option::of(ident()),
    ) {
        let original = Message::Emit(EmitMessage { trigger, payload, pool });
        let reparsed = Message::from_json(original.to_json()).unwrap();
        prop_assert_eq!(reparsed, original);
    }

    #[test]
    fn prop_response_round_trips(
        correlation_id in uuid(),
        success in any::<bool>(),
        result in proptest::option::of(payload()),
        error in proptest::option::of("[ -~]{0,32}".prop_map(String::from)),
    ) {
        let original = Message::Response(ResponseMessage {
            correlation_id,
            status: if success { ResponseStatus::Success } else { ResponseStatus::Error },
            result,
            error,
        });
        let reparsed = Message::from_json(original.to_json()).unwrap();
        prop_assert_eq!(reparsed, original);
    }

    #[test]
    fn prop_error_round_trips(
        correlation_id in uuid(),
        error in "[ -~]{1,48}",
        code in error_code(),
    ) {
        let original = Message::Error(ErrorMessage {
            correlation_id,
            error,
            error_code: code,
        });
        let reparsed = Message::from_json(original.to_json()).unwrap();
        prop_assert_eq!(reparsed, original);
    }

    #[test]
    fn prop_frame_codec_round_trips(original in trigger_message()) {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Trigger(original.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, Message::Trigger(original));
        prop_assert!(buf.is_empty());
    }
}
