//! Cache store behavior shared by the persistent and in-memory backends

use std::time::Duration;

use ghnotify::cache::{CacheError, CacheStore, MemoryCacheStore, RocksCacheStore};
use tempfile::TempDir;

const LONG_TTL: Duration = Duration::from_secs(3600);

fn open_rocks(dir: &TempDir) -> RocksCacheStore {
    RocksCacheStore::open(dir.path().join("cache"), Duration::ZERO).unwrap()
}

async fn assert_ttl_expiry(store: &dyn CacheStore) {
    store
        .set("short", b"soon gone".to_vec(), Duration::from_millis(100), None)
        .await
        .unwrap();
    store.set("long", b"stays".to_vec(), LONG_TTL, None).await.unwrap();

    assert_eq!(store.get("short").await.unwrap().unwrap().value, b"soon gone");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(store.get("short").await.unwrap().is_none());
    assert_eq!(store.get("long").await.unwrap().unwrap().value, b"stays");
}

async fn assert_delete_expire_and_clear(store: &dyn CacheStore) {
    for key in ["a", "b", "c"] {
        store.set(key, key.as_bytes().to_vec(), LONG_TTL, None).await.unwrap();
    }

    store.delete("a").await.unwrap();
    store.delete("missing").await.unwrap();
    assert!(store.get("a").await.unwrap().is_none());

    store.expire("b").await.unwrap();
    assert!(store.get("b").await.unwrap().is_none());

    let mut keys = store.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["c".to_string()]);

    store.clear().await.unwrap();
    assert!(store.keys().await.unwrap().is_empty());
}

async fn assert_closed_rejects_operations(store: &dyn CacheStore) {
    store.set("k", b"v".to_vec(), LONG_TTL, None).await.unwrap();
    store.close().await.unwrap();

    assert!(matches!(store.get("k").await, Err(CacheError::Closed)));
    assert!(matches!(
        store.set("k", b"v".to_vec(), LONG_TTL, None).await,
        Err(CacheError::Closed)
    ));
}

#[tokio::test]
async fn test_memory_store_ttl_expiry() {
    assert_ttl_expiry(&MemoryCacheStore::new()).await;
}

#[tokio::test]
async fn test_rocks_store_ttl_expiry() {
    let dir = TempDir::new().unwrap();
    assert_ttl_expiry(&open_rocks(&dir)).await;
}

#[tokio::test]
async fn test_memory_store_delete_expire_and_clear() {
    assert_delete_expire_and_clear(&MemoryCacheStore::new()).await;
}

#[tokio::test]
async fn test_rocks_store_delete_expire_and_clear() {
    let dir = TempDir::new().unwrap();
    assert_delete_expire_and_clear(&open_rocks(&dir)).await;
}

#[tokio::test]
async fn test_memory_store_close() {
    assert_closed_rejects_operations(&MemoryCacheStore::new()).await;
}

#[tokio::test]
async fn test_rocks_store_close() {
    let dir = TempDir::new().unwrap();
    assert_closed_rejects_operations(&open_rocks(&dir)).await;
}

#[tokio::test]
async fn test_rocks_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache");

    {
        let store = RocksCacheStore::open(&path, Duration::from_secs(3600)).unwrap();
        store
            .set("notifications:all", b"[1,2,3]".to_vec(), LONG_TTL, Some("\"abc\"".to_string()))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = RocksCacheStore::open(&path, Duration::from_secs(3600)).unwrap();
    let entry = store.get("notifications:all").await.unwrap().unwrap();
    assert_eq!(entry.value, b"[1,2,3]");
    assert_eq!(entry.revision_tag.as_deref(), Some("\"abc\""));
    assert!(!entry.is_expired());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_rocks_store_background_sweep_removes_expired() {
    let dir = TempDir::new().unwrap();
    let store = RocksCacheStore::open(dir.path().join("cache"), Duration::from_millis(50)).unwrap();

    store
        .set("stale", b"x".to_vec(), Duration::from_millis(10), None)
        .await
        .unwrap();
    store.set("fresh", b"y".to_vec(), LONG_TTL, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The sweep already ran, so nothing is left for a manual pass.
    assert_eq!(store.sweep_expired().await.unwrap(), 0);
    assert_eq!(store.keys().await.unwrap(), vec!["fresh".to_string()]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_rocks_store_refuses_foreign_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("important.txt"), b"keep me").unwrap();

    let err = RocksCacheStore::open(dir.path(), Duration::ZERO).unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));
    assert_eq!(std::fs::read(dir.path().join("important.txt")).unwrap(), b"keep me");
}

#[tokio::test]
async fn test_rocks_store_concurrent_sets_and_expires_settle() {
    let dir = TempDir::new().unwrap();
    let store = std::sync::Arc::new(open_rocks(&dir));

    let mut handles = Vec::new();
    for i in 0..32u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                store.set("shared", i.to_be_bytes().to_vec(), LONG_TTL, None).await
            } else {
                store.expire("shared").await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // A set after the storm is always visible.
    store.set("shared", b"final".to_vec(), LONG_TTL, None).await.unwrap();
    assert_eq!(store.get("shared").await.unwrap().unwrap().value, b"final");
    store.close().await.unwrap();
}
