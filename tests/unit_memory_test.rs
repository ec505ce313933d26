// tests/unit_memory_test.rs

use latzero::core::memory::{LockTable, MemoryManager};
use latzero::core::persistence::Persistence;
use latzero::core::pools::PoolManager;
use latzero::core::protocol::{AttachMode, BlockKind, LockMode};
use latzero::core::security::AllowAllSecurity;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn fixture() -> (Arc<MemoryManager>, Arc<PoolManager>, TempDir) {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(Persistence::open(dir.path(), false, 3).unwrap());
    let security = Arc::new(AllowAllSecurity);
    let pools = Arc::new(PoolManager::new(persistence.clone(), security.clone()));
    pools.load().await.unwrap();
    pools.add_app_to_pool("a", "default").unwrap();

    let memory = Arc::new(MemoryManager::new(
        persistence,
        security,
        Some(dir.path().join("memory")),
        Duration::from_secs(0),
    ));
    memory.load().unwrap();
    (memory, pools, dir)
}

#[tokio::test]
async fn test_create_rejects_zero_size_and_duplicates() {
    let (memory, pools, _dir) = fixture().await;
    assert!(
        memory
            .create_block(&pools, "a", "m", None, None, 0, BlockKind::Shared, None)
            .await
            .is_err()
    );
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();
    assert!(
        memory
            .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_write_then_read_at_matching_offset() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 16, BlockKind::Shared, None)
        .await
        .unwrap();

    memory.write(&pools, "a", "m", 3, b"abc").await.unwrap();
    let read = memory.read(&pools, "a", "m", 3, Some(3)).await.unwrap();
    assert_eq!(read, b"abc");
}

#[tokio::test]
async fn test_version_is_strictly_monotonic() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();

    let v1 = memory.write(&pools, "a", "m", 0, b"x").await.unwrap();
    let v2 = memory.write(&pools, "a", "m", 0, b"y").await.unwrap();
    let v3 = memory.write(&pools, "a", "m", 0, b"z").await.unwrap();
    assert!(v1 < v2 && v2 < v3);
}

#[tokio::test]
async fn test_zero_byte_write_is_a_no_op() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();

    let v1 = memory.write(&pools, "a", "m", 0, b"x").await.unwrap();
    let v2 = memory.write(&pools, "a", "m", 0, b"").await.unwrap();
    assert_eq!(v1, v2);
}

#[tokio::test]
async fn test_read_at_size_is_empty_and_write_at_size_rejects() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();

    let read = memory.read(&pools, "a", "m", 8, None).await.unwrap();
    assert!(read.is_empty());
    assert!(memory.write(&pools, "a", "m", 8, b"x").await.is_err());
    assert!(memory.read(&pools, "a", "m", 9, None).await.is_err());
}

#[tokio::test]
async fn test_permission_map_blocks_foreign_writer() {
    let (memory, pools, _dir) = fixture().await;
    pools.add_app_to_pool("b", "default").unwrap();

    let mut permissions = indexmap::IndexMap::new();
    permissions.insert("write".to_string(), vec!["a".to_string()]);
    permissions.insert("read".to_string(), vec!["*".to_string()]);
    memory
        .create_block(
            &pools,
            "a",
            "m",
            None,
            None,
            8,
            BlockKind::Shared,
            Some(permissions),
        )
        .await
        .unwrap();

    assert!(memory.write(&pools, "b", "m", 0, b"x").await.is_err());
    memory.write(&pools, "a", "m", 0, b"x").await.unwrap();
    assert!(memory.read(&pools, "b", "m", 0, None).await.is_ok());
}

#[tokio::test]
async fn test_non_member_is_denied() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();
    assert!(memory.read(&pools, "stranger", "m", 0, None).await.is_err());
}

#[tokio::test]
async fn test_detach_is_idempotent() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "m", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();

    memory.attach(&pools, "a", "m", AttachMode::Write).await.unwrap();
    memory.detach("a", "m").unwrap();
    memory.detach("a", "m").unwrap();
}

#[tokio::test]
async fn test_idle_gc_skips_persistent_and_attached_blocks() {
    let (memory, pools, _dir) = fixture().await;
    memory
        .create_block(&pools, "a", "keep", None, None, 8, BlockKind::Persistent, None)
        .await
        .unwrap();
    memory
        .create_block(&pools, "a", "held", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();
    memory
        .create_block(&pools, "a", "idle", None, None, 8, BlockKind::Shared, None)
        .await
        .unwrap();
    memory.attach(&pools, "a", "held", AttachMode::Read).await.unwrap();

    // idle_max_age is zero in the fixture, so anything unattached and
    // non-persistent is collectible immediately.
    let collected = memory.collect_idle_blocks();
    assert_eq!(collected, 1);
    assert!(memory.stat("keep").is_ok());
    assert!(memory.stat("held").is_ok());
    assert!(memory.stat("idle").is_err());
}

#[tokio::test]
async fn test_persistent_block_reloads_data() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(Persistence::open(dir.path(), false, 3).unwrap());
    let security = Arc::new(AllowAllSecurity);
    let pools = Arc::new(PoolManager::new(persistence.clone(), security.clone()));
    pools.load().await.unwrap();
    pools.add_app_to_pool("a", "default").unwrap();

    {
        let memory = MemoryManager::new(
            persistence.clone(),
            security.clone(),
            Some(dir.path().join("memory")),
            Duration::from_secs(3600),
        );
        memory.load().unwrap();
        memory
            .create_block(&pools, "a", "m", None, None, 8, BlockKind::Persistent, None)
            .await
            .unwrap();
        memory.write(&pools, "a", "m", 0, b"saved").await.unwrap();
    }

    let memory = MemoryManager::new(
        persistence,
        security,
        Some(dir.path().join("memory")),
        Duration::from_secs(3600),
    );
    memory.load().unwrap();
    let read = memory.read(&pools, "a", "m", 0, Some(5)).await.unwrap();
    assert_eq!(read, b"saved");
}

// --- Advisory lock table ----------------------------------------------------

#[test]
fn test_lock_conflict_matrix() {
    let locks = LockTable::new();
    let timeout = Duration::from_secs(60);

    // Two readers coexist.
    locks.acquire("m", "a", LockMode::Read, timeout).unwrap();
    locks.acquire("m", "b", LockMode::Read, timeout).unwrap();
    // A writer coexists with readers but not with another writer.
    locks.acquire("m", "c", LockMode::Write, timeout).unwrap();
    assert!(locks.acquire("m", "d", LockMode::Write, timeout).is_err());
    // Exclusive conflicts with everything.
    assert!(locks.acquire("m", "e", LockMode::Exclusive, timeout).is_err());
}

#[test]
fn test_exclusive_blocks_everyone() {
    let locks = LockTable::new();
    let timeout = Duration::from_secs(60);
    locks.acquire("m", "a", LockMode::Exclusive, timeout).unwrap();
    assert!(locks.acquire("m", "b", LockMode::Read, timeout).is_err());
    assert!(locks.acquire("m", "b", LockMode::Write, timeout).is_err());
}

#[test]
fn test_lock_release_by_id() {
    let locks = LockTable::new();
    let id = locks
        .acquire("m", "a", LockMode::Exclusive, Duration::from_secs(60))
        .unwrap();
    assert!(locks.release("m", id));
    assert!(!locks.release("m", id));
    locks
        .acquire("m", "b", LockMode::Exclusive, Duration::from_secs(60))
        .unwrap();
}

#[test]
fn test_expired_lock_no_longer_conflicts() {
    let locks = LockTable::new();
    locks
        .acquire("m", "a", LockMode::Exclusive, Duration::from_millis(0))
        .unwrap();
    // The previous lock expired instantly; acquisition succeeds.
    locks
        .acquire("m", "b", LockMode::Exclusive, Duration::from_secs(60))
        .unwrap();
}

#[test]
fn test_purge_expired_counts_reaped_locks() {
    let locks = LockTable::new();
    locks
        .acquire("m", "a", LockMode::Read, Duration::from_millis(0))
        .unwrap();
    locks
        .acquire("n", "b", LockMode::Read, Duration::from_secs(60))
        .unwrap();
    assert_eq!(locks.purge_expired(), 1);
    assert_eq!(locks.held("n").len(), 1);
}
