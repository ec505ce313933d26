// tests/integration/trigger_test.rs

//! End-to-end trigger routing scenarios: round-trips, timeouts, disconnect
//! cleanup, and fan-out.

use super::test_helpers::{TestContext, trigger_msg};
use latzero::core::ErrorCode;
use latzero::core::protocol::{
    EmitMessage, Message, ResponseMessage, ResponseStatus,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use uuid::Uuid;

#[tokio::test]
async fn test_echo_round_trip() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["echo"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    // B calls echo on A.
    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "echo", Some("A"), json!({"x": 1}), None);
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();

    // A receives the trigger.
    let delivered = match conn_a.recv().await {
        Message::Trigger(t) => t,
        other => panic!("expected trigger, got {}", other.kind()),
    };
    assert_eq!(delivered.id, t1);
    assert_eq!(delivered.trigger, "echo");
    assert_eq!(delivered.payload, json!({"x": 1}));

    // A responds with the payload.
    let response = ResponseMessage {
        correlation_id: t1,
        status: ResponseStatus::Success,
        result: Some(json!({"x": 1})),
        error: None,
    };
    ctx.dispatch(1, Message::Response(response)).await.unwrap();

    // B receives the correlated response and the record is gone.
    let reply = match conn_b.recv().await {
        Message::Response(r) => r,
        other => panic!("expected response, got {}", other.kind()),
    };
    assert_eq!(reply.correlation_id, t1);
    assert_eq!(reply.status, ResponseStatus::Success);
    assert_eq!(reply.result, Some(json!({"x": 1})));
    assert_eq!(ctx.state.router.inflight_count(), 0);
}

#[tokio::test]
async fn test_trigger_without_handler_is_not_found() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let msg = trigger_msg(Uuid::new_v4(), "B", "ghost", None, json!({}), None);
    let err = ctx.dispatch(2, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NotFound);
    assert_eq!(ctx.state.router.inflight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_times_out() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["slow"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "slow", None, json!({}), Some(100));
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();

    // A receives the trigger but never answers.
    conn_a.recv().await;

    let reply = match conn_b.recv().await {
        Message::Error(e) => e,
        other => panic!("expected error, got {}", other.kind()),
    };
    assert_eq!(reply.correlation_id, t1);
    assert_eq!(reply.error_code, ErrorCode::Timeout);
    assert_eq!(ctx.state.router.inflight_count(), 0);
    assert_eq!(
        ctx.state.stats.triggers_timed_out.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_ttl_zero_times_out_immediately() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["t"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "t", None, json!({}), Some(0));
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();

    let reply = match conn_b.recv().await {
        Message::Error(e) => e,
        other => panic!("expected error, got {}", other.kind()),
    };
    assert_eq!(reply.error_code, ErrorCode::Timeout);
    assert_eq!(ctx.state.router.inflight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_is_clamped_to_the_configured_max() {
    let ctx = TestContext::with_config(|c| c.routing.max_ttl_ms = 200).await;
    let _conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["t"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    // Asks for an hour; the clamp brings it down to 200 ms.
    let msg = trigger_msg(Uuid::new_v4(), "B", "t", None, json!({}), Some(3_600_000));
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();

    let reply = match conn_b.recv().await {
        Message::Error(e) => e,
        other => panic!("expected error, got {}", other.kind()),
    };
    assert_eq!(reply.error_code, ErrorCode::Timeout);
}

#[tokio::test]
async fn test_disconnect_mid_flight_fails_the_record() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["x"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "x", None, json!({}), None);
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();
    conn_a.recv().await;

    // A goes away before answering.
    ctx.disconnect(1).await;

    let reply = match conn_b.recv().await {
        Message::Error(e) => e,
        other => panic!("expected error, got {}", other.kind()),
    };
    assert_eq!(reply.correlation_id, t1);
    assert_eq!(reply.error_code, ErrorCode::RoutingError);
    assert_eq!(ctx.state.router.inflight_count(), 0);
    assert!(ctx.state.registry.has_cached("A"));
}

#[tokio::test]
async fn test_intra_app_trigger_is_rejected() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &["self"]).await.unwrap();

    let msg = trigger_msg(Uuid::new_v4(), "A", "self", None, json!({}), None);
    let err = ctx.dispatch(1, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ShortCircuitNotImplemented);
    assert_eq!(
        ctx.state.stats.triggers_failed.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_inflight_cap_rejects_with_too_many_requests() {
    let ctx = TestContext::with_config(|c| c.routing.max_inflight = 1).await;
    let mut conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["t"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let first = trigger_msg(Uuid::new_v4(), "B", "t", None, json!({}), None);
    ctx.dispatch(2, Message::Trigger(first)).await.unwrap();
    conn_a.recv().await;

    let second = trigger_msg(Uuid::new_v4(), "B", "t", None, json!({}), None);
    let err = ctx.dispatch(2, Message::Trigger(second)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::TooManyRequests);
}

#[tokio::test]
async fn test_explicit_destination_that_does_not_handle_is_denied() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let msg = trigger_msg(Uuid::new_v4(), "B", "t", Some("A"), json!({}), None);
    let err = ctx.dispatch(2, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AccessDenied);
}

#[tokio::test]
async fn test_round_robin_alternates_between_handlers() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_c = ctx.connect(2);
    let _conn_b = ctx.connect(3);
    ctx.handshake(1, "A", &["default"], &["rr"]).await.unwrap();
    ctx.handshake(2, "C", &["default"], &["rr"]).await.unwrap();
    ctx.handshake(3, "B", &["default"], &[]).await.unwrap();

    for _ in 0..4 {
        let msg = trigger_msg(Uuid::new_v4(), "B", "rr", None, json!({}), None);
        ctx.dispatch(3, Message::Trigger(msg)).await.unwrap();
    }

    let mut a_count = 0;
    while let Ok(Some(_)) = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        conn_a.rx.recv(),
    )
    .await
    {
        a_count += 1;
    }
    let mut c_count = 0;
    while let Ok(Some(_)) = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        conn_c.rx.recv(),
    )
    .await
    {
        c_count += 1;
    }
    assert_eq!(a_count, 2);
    assert_eq!(c_count, 2);
}

#[tokio::test]
async fn test_emit_fans_out_without_a_record() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_c = ctx.connect(2);
    let _conn_b = ctx.connect(3);
    ctx.handshake(1, "A", &["default"], &["ev"]).await.unwrap();
    ctx.handshake(2, "C", &["default"], &["ev"]).await.unwrap();
    ctx.handshake(3, "B", &["default"], &[]).await.unwrap();

    let emit = EmitMessage {
        trigger: "ev".to_string(),
        payload: json!({"n": 7}),
        pool: None,
    };
    ctx.dispatch(3, Message::Emit(emit)).await.unwrap();

    for conn in [&mut conn_a, &mut conn_c] {
        match conn.recv().await {
            Message::Emit(e) => assert_eq!(e.payload, json!({"n": 7})),
            other => panic!("expected emit, got {}", other.kind()),
        }
    }
    assert_eq!(ctx.state.router.inflight_count(), 0);
    assert_eq!(ctx.state.stats.emits_delivered.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_timeout_is_dropped() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["slow"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "slow", None, json!({}), Some(50));
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();
    conn_a.recv().await;

    // The timeout lands first.
    match conn_b.recv().await {
        Message::Error(e) => assert_eq!(e.error_code, ErrorCode::Timeout),
        other => panic!("expected error, got {}", other.kind()),
    }

    // A late answer is dropped silently.
    let response = ResponseMessage {
        correlation_id: t1,
        status: ResponseStatus::Success,
        result: Some(json!("late")),
        error: None,
    };
    ctx.dispatch(1, Message::Response(response)).await.unwrap();
    assert!(conn_b.is_empty());
}

#[tokio::test]
async fn test_error_reply_routes_like_a_response() {
    let ctx = TestContext::new().await;
    let mut conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &["t"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let t1 = Uuid::new_v4();
    let msg = trigger_msg(t1, "B", "t", None, json!({}), None);
    ctx.dispatch(2, Message::Trigger(msg)).await.unwrap();
    conn_a.recv().await;

    let err_reply = latzero::core::protocol::ErrorMessage {
        correlation_id: t1,
        error: "handler blew up".to_string(),
        error_code: ErrorCode::InternalError,
    };
    ctx.dispatch(1, Message::Error(err_reply)).await.unwrap();

    match conn_b.recv().await {
        Message::Error(e) => {
            assert_eq!(e.correlation_id, t1);
            assert_eq!(e.error_code, ErrorCode::InternalError);
        }
        other => panic!("expected error, got {}", other.kind()),
    }
    assert_eq!(ctx.state.router.inflight_count(), 0);
}
