// tests/integration/memory_test.rs

//! End-to-end memory block scenarios through the dispatcher.

use super::test_helpers::TestContext;
use latzero::core::ErrorCode;
use latzero::core::dispatch::DispatchReply;
use latzero::core::protocol::{
    AttachMode, BinaryFrame, BlockKind, LockMode, MemoryMessage, MemoryOp, Message,
    ResponseStatus,
};
use serde_json::{Value, json};
use uuid::Uuid;

fn memory_msg(block_id: &str, op: MemoryOp) -> Message {
    Message::Memory(MemoryMessage {
        id: Some(Uuid::new_v4()),
        block_id: block_id.to_string(),
        op,
    })
}

async fn expect_result(ctx: &TestContext, session: u64, msg: Message) -> Value {
    match ctx.dispatch(session, msg).await.unwrap() {
        DispatchReply::Message(Message::Response(r)) => {
            assert_eq!(r.status, ResponseStatus::Success);
            r.result.unwrap()
        }
        _ => panic!("expected a response message"),
    }
}

async fn create_block(ctx: &TestContext, session: u64, block_id: &str, size: u64) {
    expect_result(
        ctx,
        session,
        memory_msg(
            block_id,
            MemoryOp::Create {
                name: None,
                pool: None,
                size,
                kind: BlockKind::Shared,
                permissions: None,
            },
        ),
    )
    .await;
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 16).await;

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Write {
                offset: 0,
                data: b"hello".to_vec(),
            },
        ),
    )
    .await;
    assert_eq!(result["version"], json!(1));

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Read {
                offset: 0,
                length: Some(5),
            },
        ),
    )
    .await;
    assert_eq!(result["data"], json!("hello"));
    assert_eq!(result["length"], json!(5));
}

#[tokio::test]
async fn test_cas_success_returns_previous_and_bumps_version_twice() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 16).await;

    expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Write {
                offset: 0,
                data: b"hello".to_vec(),
            },
        ),
    )
    .await;

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::CompareAndSwap {
                offset: 0,
                expected: b"hello".to_vec(),
                data: b"world".to_vec(),
            },
        ),
    )
    .await;
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["previous"], json!("hello"));
    // One bump per successful write across the two operations.
    assert_eq!(result["version"], json!(2));
}

#[tokio::test]
async fn test_cas_failure_returns_current_bytes() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 8).await;

    expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Write {
                offset: 0,
                data: b"base".to_vec(),
            },
        ),
    )
    .await;

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::CompareAndSwap {
                offset: 0,
                expected: b"nope".to_vec(),
                data: b"data".to_vec(),
            },
        ),
    )
    .await;
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["previous"], json!("base"));
    assert_eq!(result["version"], json!(1));
}

#[tokio::test]
async fn test_out_of_bounds_read_and_write() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 8).await;

    let err = ctx
        .dispatch(
            1,
            memory_msg(
                "m",
                MemoryOp::Read {
                    offset: 4,
                    length: Some(8),
                },
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::OutOfBounds);

    let err = ctx
        .dispatch(
            1,
            memory_msg(
                "m",
                MemoryOp::Write {
                    offset: 8,
                    data: b"x".to_vec(),
                },
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::OutOfBounds);
}

#[tokio::test]
async fn test_lock_conflict_and_release() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 8).await;

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Lock {
                mode: LockMode::Exclusive,
                timeout_ms: 60_000,
            },
        ),
    )
    .await;
    let lock_id: Uuid = result["lock_id"].as_str().unwrap().parse().unwrap();

    // B cannot take any lock while A holds exclusive.
    let err = ctx
        .dispatch(
            2,
            memory_msg(
                "m",
                MemoryOp::Lock {
                    mode: LockMode::Read,
                    timeout_ms: 1_000,
                },
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AccessDenied);

    // The lock id is the release capability; afterwards B succeeds.
    expect_result(&ctx, 1, memory_msg("m", MemoryOp::Unlock { lock_id })).await;
    expect_result(
        &ctx,
        2,
        memory_msg(
            "m",
            MemoryOp::Lock {
                mode: LockMode::Read,
                timeout_ms: 1_000,
            },
        ),
    )
    .await;
}

#[tokio::test]
async fn test_remove_fails_while_attached() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let _conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 8).await;

    expect_result(
        &ctx,
        2,
        memory_msg(
            "m",
            MemoryOp::Attach {
                mode: AttachMode::Read,
            },
        ),
    )
    .await;

    let err = ctx
        .dispatch(1, memory_msg("m", MemoryOp::Remove))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ValidationError);

    expect_result(&ctx, 2, memory_msg("m", MemoryOp::Detach)).await;
    expect_result(&ctx, 1, memory_msg("m", MemoryOp::Remove)).await;
    let err = ctx
        .dispatch(1, memory_msg("m", MemoryOp::Stat))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_write_notifies_attached_apps() {
    let ctx = TestContext::new().await;
    let _conn_a = ctx.connect(1);
    let mut conn_b = ctx.connect(2);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    ctx.handshake(2, "B", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "m", 8).await;

    expect_result(
        &ctx,
        2,
        memory_msg(
            "m",
            MemoryOp::Attach {
                mode: AttachMode::Read,
            },
        ),
    )
    .await;

    expect_result(
        &ctx,
        1,
        memory_msg(
            "m",
            MemoryOp::Write {
                offset: 0,
                data: b"ping".to_vec(),
            },
        ),
    )
    .await;

    match conn_b.recv().await {
        Message::Emit(e) => {
            assert_eq!(e.trigger, "memory.updated");
            assert_eq!(e.payload["block_id"], json!("m"));
            assert_eq!(e.payload["version"], json!(1));
        }
        other => panic!("expected emit, got {}", other.kind()),
    }
}

#[tokio::test]
async fn test_binary_frame_performs_bulk_write() {
    let ctx = TestContext::new().await;
    let _conn = ctx.connect(1);
    ctx.handshake(1, "A", &["default"], &[]).await.unwrap();
    create_block(&ctx, 1, "big", 64).await;

    let id = Uuid::new_v4();
    let mut header = serde_json::Map::new();
    header.insert("type".into(), json!("binary_frame"));
    header.insert("operation".into(), json!("write"));
    header.insert("block_id".into(), json!("big"));
    header.insert("offset".into(), json!(8));
    header.insert("id".into(), json!(id.to_string()));
    header.insert("binary_size".into(), json!(4));
    let frame = Message::Binary(BinaryFrame {
        header,
        data: bytes::Bytes::from_static(b"\xff\xfe\xfd\xfc"),
    });

    match ctx.dispatch(1, frame).await.unwrap() {
        DispatchReply::Message(Message::Response(r)) => {
            assert_eq!(r.status, ResponseStatus::Success);
            assert_eq!(r.result.unwrap()["version"], json!(1));
        }
        _ => panic!("expected a response"),
    }

    let result = expect_result(
        &ctx,
        1,
        memory_msg(
            "big",
            MemoryOp::Read {
                offset: 8,
                length: Some(4),
            },
        ),
    )
    .await;
    assert_eq!(result["data"], json!([255, 254, 253, 252]));
}
