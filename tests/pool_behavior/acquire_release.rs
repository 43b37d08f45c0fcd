// ABOUTME: Acquire/release reference counting, connection identity and misuse detection

use std::sync::Arc;

use mgmt_pool::{ConnectionError, ErrorKind, Misuse};

use crate::fixtures::{Harness, MemoryProxy, Script, OPAQUE_ENDPOINT};

#[tokio::test]
async fn test_first_acquire_creates_single_entry() {
    let h = Harness::new();

    let conn = h.pool.acquire(100).await.unwrap();

    assert_eq!(h.pool.len(), 1);
    assert_eq!(h.pool.usage_count(100), Some(1));
    assert!(h.pool.is_ready(100));
    assert_eq!(conn.pid(), 100);
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.dialer.dials(), 1);
}

#[tokio::test]
async fn test_opaque_endpoint_is_handed_to_dialer() {
    let h = Harness::new();
    h.launcher.script(110, Script::Opaque);

    let conn = h.pool.acquire(110).await.unwrap();

    assert_eq!(conn.endpoint().to_string(), OPAQUE_ENDPOINT);
    assert_eq!(h.pool.usage_count(110), Some(1));
    assert_eq!(h.dialer.dials(), 1);
    h.pool.release(110, &conn).await.unwrap();
}

#[tokio::test]
async fn test_repeated_acquires_share_connection() {
    let h = Harness::new();

    let a = h.pool.acquire(100).await.unwrap();
    let b = h.pool.acquire(100).await.unwrap();
    let c = h.pool.acquire(100).await.unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(h.pool.usage_count(100), Some(3));
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn test_last_release_closes_connection_and_detaches_helper() {
    let h = Harness::new();
    let conn = h.pool.acquire(100).await.unwrap();
    h.pool.acquire(100).await.unwrap();
    h.pool.acquire(100).await.unwrap();

    h.pool.release(100, &conn).await.unwrap();
    h.pool.release(100, &conn).await.unwrap();
    assert_eq!(h.pool.usage_count(100), Some(1));
    assert!(!conn.is_closed());

    h.pool.release(100, &conn).await.unwrap();

    assert!(!h.pool.contains(100));
    assert!(conn.is_closed());
    assert_eq!(h.launcher.detaches(), 1);
    h.eventually("target saw the hang-up", |h| h.dialer.closed() == 1)
        .await;
}

#[tokio::test]
async fn test_acquire_release_pairs_leave_no_entry() {
    let h = Harness::new();

    for _ in 0..5 {
        let conn = h.pool.acquire(100).await.unwrap();
        h.pool.release(100, &conn).await.unwrap();
        assert!(!h.pool.contains(100));
    }

    assert!(h.pool.is_empty());
    assert_eq!(h.launcher.launches(), 5);
    assert_eq!(h.launcher.detaches(), 5);
}

#[tokio::test]
async fn test_reacquire_after_full_release_gets_fresh_connection() {
    let h = Harness::new();

    let first = h.pool.acquire(100).await.unwrap();
    h.pool.release(100, &first).await.unwrap();
    let second = h.pool.acquire(100).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_closed());
    assert!(!second.is_closed());
}

#[tokio::test]
async fn test_release_with_foreign_connection_is_misuse() {
    let h = Harness::new();
    let mine = h.pool.acquire(100).await.unwrap();
    let other = h.pool.acquire(101).await.unwrap();
    h.pool.acquire(100).await.unwrap();

    let err = h.pool.release(100, &other).await.unwrap_err();

    assert!(matches!(
        err,
        ConnectionError::Misuse {
            pid: 100,
            misuse: Misuse::ConnectionMismatch
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Misuse);
    assert_eq!(h.pool.usage_count(100), Some(2));
    assert!(!mine.is_closed());
}

#[tokio::test]
async fn test_release_after_entry_removed_is_misuse() {
    let h = Harness::new();
    let conn = h.pool.acquire(100).await.unwrap();
    h.pool.release(100, &conn).await.unwrap();

    let err = h.pool.release(100, &conn).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Misuse {
            misuse: Misuse::UnknownPid,
            ..
        }
    ));
}

#[tokio::test]
async fn test_pids_are_independent() {
    let h = Harness::new();
    let a = h.pool.acquire(100).await.unwrap();
    let b = h.pool.acquire(200).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(h.pool.pids(), vec![100, 200]);

    h.pool.release(100, &a).await.unwrap();
    assert_eq!(h.pool.pids(), vec![200]);
    assert!(!b.is_closed());
}

#[tokio::test]
async fn test_typed_proxy_over_pooled_connection() {
    let h = Harness::new();
    let conn = h.pool.acquire(100).await.unwrap();

    let memory: MemoryProxy = conn.create_proxy("runtime:type=Memory").unwrap();
    assert_eq!(memory.heap_used().await.unwrap(), 1024);

    memory.gc().await.unwrap();
    assert_eq!(memory.heap_used().await.unwrap(), 0);

    h.pool.release(100, &conn).await.unwrap();
    let err = memory.heap_used().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Closed { pid: 100 }));
}
