//! Shutdown and cancellation tests.
//!
//! Covers:
//! - Waiters released promptly when their group is removed
//! - Shutting-down results on every handle operation after removal
//! - Cancelled acquisitions leaving no reservation behind
//! - Releases after removal being safe no-ops

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use cg_throttle::{BinLimits, StaticThrottleSpec, Throttler};

fn limits(min_ms_between_fetches: u64, min_ms_per_byte: f64) -> BinLimits {
    BinLimits {
        max_open_connections: 10,
        min_ms_between_fetches,
        min_ms_per_byte,
    }
}

async fn install(throttler: &Throttler, limits: BinLimits) {
    throttler
        .create_or_update("web", "main", StaticThrottleSpec::new(limits).into_shared())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn remove_releases_fetch_waiter() {
    let throttler = Arc::new(Throttler::new());
    install(&throttler, limits(600_000, 0.0)).await;

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = ct.obtain_connection_permission().unwrap().unwrap();

    // Consume the immediate slot so the next fetch must wait ten minutes.
    let st = ft.obtain_fetch_document_permission().await.unwrap().unwrap();
    st.close_stream();

    let waiter = {
        let ct = throttler
            .obtain_connection_throttler("web", "main", &["h1"])
            .unwrap();
        tokio::spawn(async move {
            let ft = ct.obtain_connection_permission().unwrap().unwrap();
            ft.obtain_fetch_document_permission().await.unwrap()
        })
    };
    tokio::task::yield_now().await;

    throttler.remove("web", "main").await;

    let result = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter was not released by group removal")
        .unwrap();
    assert!(result.is_none());

    // Nothing of the old group survives: the key can be reused immediately
    // with zero-valued bins.
    install(&throttler, limits(0, 0.0)).await;
    let fresh = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = fresh.obtain_connection_permission().unwrap().unwrap();
    assert!(ft.obtain_fetch_document_permission().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn destroy_releases_read_waiter() {
    let throttler = Arc::new(Throttler::new());
    install(&throttler, limits(0, 1_000.0)).await;

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = ct.obtain_connection_permission().unwrap().unwrap();
    let st = ft.obtain_fetch_document_permission().await.unwrap().unwrap();

    let waiter = tokio::spawn(async move { st.obtain_read_permission(1_000_000).await });
    tokio::task::yield_now().await;

    throttler.destroy().await;

    let granted = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("read waiter was not released by destroy")
        .unwrap();
    assert!(!granted);
}

#[tokio::test]
async fn handles_degrade_after_removal() {
    let throttler = Throttler::new();
    install(&throttler, limits(0, 0.0)).await;

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = ct.obtain_connection_permission().unwrap().unwrap();
    let st = ft.obtain_fetch_document_permission().await.unwrap().unwrap();

    throttler.remove("web", "main").await;

    assert!(ct.obtain_connection_permission().unwrap().is_none());
    assert_eq!(ct.over_connection_quota_count(), u32::MAX);
    assert!(ft.obtain_fetch_document_permission().await.unwrap().is_none());
    assert!(!st.obtain_read_permission(10).await);

    // Releases against the dead group must not panic.
    st.release_read_permission(10, 0);
    st.close_stream();
    ct.release_connection_permission();
}

#[tokio::test(start_paused = true)]
async fn cancelled_fetch_waiter_leaves_no_reservation() {
    let throttler = Arc::new(Throttler::new());
    install(&throttler, limits(100, 0.0)).await;

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = ct.obtain_connection_permission().unwrap().unwrap();

    let start = Instant::now();
    let st = ft.obtain_fetch_document_permission().await.unwrap().unwrap();
    st.close_stream();

    // A second waiter queues for the t=100ms slot, then is cancelled.
    let cancelled = {
        let throttler = throttler.clone();
        tokio::spawn(async move {
            let ct = throttler
                .obtain_connection_throttler("web", "main", &["h1"])
                .unwrap();
            let ft = ct.obtain_connection_permission().unwrap().unwrap();
            ft.obtain_fetch_document_permission().await
        })
    };
    tokio::task::yield_now().await;
    cancelled.abort();
    let _ = cancelled.await;

    // The cancelled waiter's queue slot is gone: the next caller takes the
    // t=100ms slot instead of parking behind a ghost.
    let st = ft.obtain_fetch_document_permission().await.unwrap().unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    st.close_stream();
}

#[tokio::test(start_paused = true)]
async fn cancelled_read_waiter_unblocks_the_queue() {
    let throttler = Arc::new(Throttler::new());
    install(&throttler, limits(0, 1.0)).await;

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let ft = ct.obtain_connection_permission().unwrap().unwrap();
    let st = Arc::new(ft.obtain_fetch_document_permission().await.unwrap().unwrap());

    let start = Instant::now();

    // A huge read parks at the head of the queue, then is cancelled.
    let cancelled = {
        let st = st.clone();
        tokio::spawn(async move { st.obtain_read_permission(1_000_000).await })
    };
    tokio::task::yield_now().await;
    cancelled.abort();
    let _ = cancelled.await;

    // The cancelled waiter neither holds its queue position nor its bytes.
    assert!(st.obtain_read_permission(100).await);
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    st.close_stream();
}
