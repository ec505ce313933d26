// tests/integration/handshake_test.rs

//! End-to-end handshake and rehydration scenarios.

use super::test_helpers::TestContext;
use latzero::core::ErrorCode;
use latzero::core::protocol::{HandshakeMessage, Message};
use uuid::Uuid;

#[tokio::test]
async fn test_full_handshake_assigns_fields() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    let ack = ctx
        .handshake(1, "myApp", &["default"], &["echo"])
        .await
        .unwrap();
    assert_eq!(ack.status, "success");
    assert_eq!(ack.assigned.app_id, "myApp");
    assert_eq!(ack.assigned.pools, vec!["default".to_string()]);
    assert_eq!(ack.assigned.triggers, vec!["echo".to_string()]);
    assert!(!ack.assigned.rehydrated);
    assert!(ctx.state.registry.is_bound("myApp"));
}

#[tokio::test]
async fn test_handshake_with_no_pools_joins_default() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    let ack = ctx.handshake(1, "floating", &[], &[]).await.unwrap();
    assert_eq!(ack.assigned.pools, vec!["default".to_string()]);
    assert!(ctx.state.pools.validate_membership("floating", "default"));
}

#[tokio::test]
async fn test_handshake_creates_named_pool_implicitly() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    ctx.handshake(1, "a", &["p1"], &["t1"]).await.unwrap();
    assert!(ctx.state.pools.exists("p1"));
    assert!(ctx.state.pools.validate_membership("a", "p1"));
}

#[tokio::test]
async fn test_rehydration_restores_pools_and_triggers() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    ctx.handshake(1, "a", &["p1"], &["t1", "t2"]).await.unwrap();
    ctx.disconnect(1).await;
    assert!(!ctx.state.registry.is_bound("a"));
    assert!(ctx.state.registry.has_cached("a"));

    // Reconnect with an empty handshake; the prior registration returns.
    let _conn2 = ctx.connect(2);
    let ack = ctx.handshake(2, "a", &[], &[]).await.unwrap();
    assert!(ack.assigned.rehydrated);
    assert_eq!(ack.assigned.pools, vec!["p1".to_string()]);
    assert_eq!(
        ack.assigned.triggers,
        vec!["t1".to_string(), "t2".to_string()]
    );
    assert_eq!(ctx.state.registry.handlers_for("t1"), vec!["a".to_string()]);
    assert_eq!(ctx.state.registry.handlers_for("t2"), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_rebind_on_same_connection_is_an_update() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    ctx.handshake(1, "a", &["default"], &["t1"]).await.unwrap();
    let ack = ctx.handshake(1, "a", &["default"], &["t2"]).await.unwrap();

    assert_eq!(ack.assigned.triggers, vec!["t2".to_string()]);
    assert!(ctx.state.registry.handlers_for("t1").is_empty());
    assert_eq!(ctx.state.registry.handlers_for("t2"), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_duplicate_app_id_newer_connection_wins() {
    let ctx = TestContext::new().await;
    let _conn1 = ctx.connect(1);
    let _conn2 = ctx.connect(2);

    ctx.handshake(1, "a", &["default"], &["t"]).await.unwrap();
    ctx.handshake(2, "a", &["default"], &["t"]).await.unwrap();

    // At most one bound connection per AppID.
    assert_eq!(ctx.state.registry.session_of_app("a"), Some(2));
    assert!(ctx.state.registry.app_of_session(1).is_none());
}

#[tokio::test]
async fn test_handshake_for_second_app_on_bound_connection_fails() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    ctx.handshake(1, "a", &["default"], &[]).await.unwrap();
    let err = ctx.handshake(1, "b", &["default"], &[]).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::HandshakeError);
}

#[tokio::test]
async fn test_handshake_ack_is_server_to_client_only() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    let ack = ctx.handshake(1, "a", &["default"], &[]).await.unwrap();
    let err = ctx
        .dispatch(1, Message::HandshakeAck(ack))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_unbound_connection_cannot_trigger() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    let msg = super::test_helpers::trigger_msg(
        Uuid::new_v4(),
        "ghost",
        "anything",
        None,
        serde_json::json!({}),
        None,
    );
    let err = ctx.dispatch(1, Message::Trigger(msg)).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_metadata_survives_rehydration() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);

    let mut metadata = serde_json::Map::new();
    metadata.insert("lang".into(), serde_json::json!("rust"));
    let msg = HandshakeMessage {
        id: Some(Uuid::new_v4()),
        app_id: "meta-app".to_string(),
        pools: vec!["default".to_string()],
        triggers: vec!["t".to_string()],
        metadata,
        protocol_version: None,
    };
    ctx.dispatch(1, Message::Handshake(msg)).await.unwrap();
    ctx.disconnect(1).await;

    let _conn2 = ctx.connect(2);
    ctx.handshake(2, "meta-app", &[], &[]).await.unwrap();
    let registration = ctx.state.registry.get("meta-app").unwrap();
    assert_eq!(
        registration.metadata.get("lang"),
        Some(&serde_json::json!("rust"))
    );
}
