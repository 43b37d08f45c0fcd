// ABOUTME: Failure classification and cleanup for every stage of connection setup

use std::error::Error as _;
use std::time::{Duration, Instant};

use mgmt_pool::error::HelperFailure;
use mgmt_pool::{ConnectionError, ErrorKind};

use crate::fixtures::{Harness, Script, UNDIALABLE_ENDPOINT};

#[tokio::test]
async fn test_unresolvable_owner_creates_no_entry() {
    let h = Harness::new();
    h.resolver.mark_unknown(200);

    let err = h.pool.acquire(200).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(err.pid(), Some(200));
    assert!(!h.pool.contains(200));
    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn test_silent_helper_times_out_without_leftover_state() {
    let h = Harness::with_config(|c| c.handshake_timeout = Duration::from_millis(200));
    h.launcher.script(300, Script::Silent);

    let started = Instant::now();
    let err = h.pool.acquire(300).await.unwrap_err();

    assert!(matches!(
        err,
        ConnectionError::HandshakeTimeout { pid: 300, timeout } if timeout == Duration::from_millis(200)
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.pool.is_empty());
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn test_helper_failure_keeps_original_cause() {
    let h = Harness::new();
    h.launcher.script(400, Script::Fail);

    let err = h.pool.acquire(400).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HandshakeFailure);
    assert_eq!(err.source().unwrap().to_string(), "target refused attach");
    let ConnectionError::HandshakeFailure { cause, .. } = &err else {
        panic!("Expected HandshakeFailure, got {err:?}");
    };
    assert_eq!(
        cause.downcast_ref::<HelperFailure>(),
        Some(&HelperFailure::new("target refused attach"))
    );
    assert!(!h.pool.contains(400));
}

#[tokio::test]
async fn test_failed_helper_is_told_to_detach() {
    let h = Harness::new();
    h.launcher.script(401, Script::Fail);

    h.pool.acquire(401).await.unwrap_err();

    assert_eq!(h.launcher.detaches(), 1);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_protocol_error_and_detaches() {
    let h = Harness::new();
    h.launcher.script(500, Script::Unreachable);

    let err = h.pool.acquire(500).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolConnect);
    assert!(err.to_string().contains("tcp://127.0.0.1:1"));
    assert!(!h.pool.contains(500));
    assert_eq!(h.launcher.detaches(), 1);
    assert_eq!(h.dialer.dials(), 0);
}

#[tokio::test]
async fn test_undialable_scheme_is_protocol_error_and_detaches() {
    let h = Harness::new();
    h.launcher.script(510, Script::Undialable);

    let err = h.pool.acquire(510).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolConnect);
    assert!(err.to_string().contains(UNDIALABLE_ENDPOINT));
    assert!(!h.pool.contains(510));
    assert_eq!(h.launcher.detaches(), 1);
}

#[tokio::test]
async fn test_acquire_after_failure_starts_over() {
    let h = Harness::new();
    h.launcher.script(600, Script::Fail);
    h.pool.acquire(600).await.unwrap_err();

    h.launcher.script(600, Script::Ready);
    let conn = h.pool.acquire(600).await.unwrap();

    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(h.pool.usage_count(600), Some(1));
    h.pool.release(600, &conn).await.unwrap();
}
