// ABOUTME: Concurrent acquires sharing one setup, and pids not blocking each other

use std::sync::Arc;
use std::time::{Duration, Instant};

use mgmt_pool::ErrorKind;

use crate::fixtures::{Harness, Script};

#[tokio::test]
async fn test_concurrent_acquires_block_on_one_handshake() {
    let h = Harness::new();
    h.launcher.set_report_delay(Duration::from_millis(200));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&h.pool);
            tokio::spawn(async move { pool.acquire(100).await })
        })
        .collect();

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap().unwrap());
    }

    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(h.pool.usage_count(100), Some(3));
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.dialer.dials(), 1);
}

#[tokio::test]
async fn test_many_concurrent_acquires_settle_to_usage_n() {
    let h = Harness::new();
    h.launcher.set_report_delay(Duration::from_millis(50));
    const N: usize = 16;

    let tasks: Vec<_> = (0..N)
        .map(|_| {
            let pool = Arc::clone(&h.pool);
            tokio::spawn(async move { pool.acquire(4242).await })
        })
        .collect();

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap().unwrap());
    }

    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(h.pool.usage_count(4242), Some(N));

    for conn in &conns {
        h.pool.release(4242, conn).await.unwrap();
    }
    assert!(!h.pool.contains(4242));
    assert!(conns[0].is_closed());
}

#[tokio::test]
async fn test_concurrent_waiters_share_setup_failure() {
    let h = Harness::new();
    h.launcher.script(100, Script::Fail);
    h.launcher.set_report_delay(Duration::from_millis(200));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&h.pool);
            tokio::spawn(async move { pool.acquire(100).await })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeFailure);
        assert!(err.to_string().contains("target refused attach"));
    }

    assert_eq!(h.launcher.launches(), 1);
    assert!(!h.pool.contains(100));
}

#[tokio::test]
async fn test_slow_pid_does_not_block_other_pids() {
    let h = Harness::with_config(|c| c.handshake_timeout = Duration::from_secs(3));
    h.launcher.script(700, Script::Silent);

    let slow = tokio::spawn({
        let pool = Arc::clone(&h.pool);
        async move { pool.acquire(700).await }
    });
    h.eventually("slow setup started", |h| h.pool.contains(700))
        .await;

    let started = Instant::now();
    let conn = h.pool.acquire(701).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.pool.is_ready(700));

    h.pool.release(701, &conn).await.unwrap();
    slow.abort();
}
