// tests/integration/pool_test.rs

//! Pool membership and access scenarios across components.

use super::test_helpers::{TestContext, trigger_msg};
use latzero::core::ErrorCode;
use latzero::core::protocol::Message;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_trigger_into_foreign_pool_is_denied() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    // A handles echo in the default pool; B lives only in "island".
    ctx.handshake(1, "A", &["default"], &["echo"]).await.unwrap();
    ctx.handshake(2, "B", &["island"], &[]).await.unwrap();

    let msg = trigger_msg(Uuid::new_v4(), "B", "echo", None, json!({}), None);
    let err = ctx.dispatch(2, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AccessDenied);
}

#[tokio::test]
async fn test_trigger_into_missing_pool_is_not_found() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();

    let mut msg = trigger_msg(Uuid::new_v4(), "A", "t", None, json!({}), None);
    msg.pool = Some("nowhere".to_string());
    let err = ctx.dispatch(1, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_handlers_outside_the_pool_are_filtered() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    // A handles "t" but only in "island"; B asks in default.
    ctx.handshake(1, "A", &["island"], &["t"]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();

    let msg = trigger_msg(Uuid::new_v4(), "B", "t", None, json!({}), None);
    let err = ctx.dispatch(2, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_membership_is_dropped_while_offline() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["p1"], &["t"]).await.unwrap();
    assert!(ctx.state.pools.validate_membership("A", "p1"));

    ctx.disconnect(1).await;
    // Offline apps are not pool members; the pool itself survives.
    assert!(!ctx.state.pools.validate_membership("A", "p1"));
    assert!(ctx.state.pools.exists("p1"));
}

#[tokio::test]
async fn test_disconnect_then_reconnect_restores_membership() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["p1"], &["t"]).await.unwrap();
    ctx.disconnect(1).await;

    let _conn2 = ctx.connect(2);
    ctx.handshake(2, "A", &[], &[]).await.unwrap();
    assert!(ctx.state.pools.validate_membership("A", "p1"));
    assert_eq!(ctx.state.pools.members("p1"), vec!["A".to_string()]);
}
