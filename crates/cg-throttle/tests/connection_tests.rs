//! Connection quota tests.
//!
//! Covers:
//! - Per-bin connection caps
//! - Multi-bin intersection (all-or-nothing reserve)
//! - Rewind on partial reservation failure
//! - Downward limit adjustments and over-quota reporting
//! - Spec failure propagation

use std::sync::Arc;

use cg_throttle::{BinLimits, StaticThrottleSpec, ThrottleError, ThrottleSpec, Throttler, UnlimitedSpec};

fn limits(max_open_connections: u32) -> BinLimits {
    BinLimits {
        max_open_connections,
        min_ms_between_fetches: 0,
        min_ms_per_byte: 0.0,
    }
}

async fn throttler_with(spec: StaticThrottleSpec) -> Throttler {
    let throttler = Throttler::new();
    throttler
        .create_or_update("web", "main", spec.into_shared())
        .await
        .unwrap();
    throttler
}

#[tokio::test]
async fn connection_cap_grants_exactly_max_active() {
    let throttler = throttler_with(StaticThrottleSpec::new(limits(2))).await;
    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();

    let first = ct.obtain_connection_permission().unwrap();
    let second = ct.obtain_connection_permission().unwrap();
    let third = ct.obtain_connection_permission().unwrap();

    assert!(first.is_some());
    assert!(second.is_some());
    assert!(third.is_none());

    // A release opens the slot back up.
    ct.release_connection_permission();
    assert!(ct.obtain_connection_permission().unwrap().is_some());
}

#[tokio::test]
async fn multi_bin_intersection() {
    let spec = StaticThrottleSpec::new(limits(5)).with_bin("h1", limits(1));
    let throttler = throttler_with(spec).await;

    let a = throttler
        .obtain_connection_throttler("web", "main", &["h1", "h2"])
        .unwrap();
    let b = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    let c = throttler
        .obtain_connection_throttler("web", "main", &["h2"])
        .unwrap();

    assert!(a.obtain_connection_permission().unwrap().is_some());
    // h1 is exhausted by A.
    assert!(b.obtain_connection_permission().unwrap().is_none());
    // h2 still has room.
    assert!(c.obtain_connection_permission().unwrap().is_some());

    a.release_connection_permission();
    assert!(b.obtain_connection_permission().unwrap().is_some());
}

#[tokio::test]
async fn failed_reservation_rewinds_earlier_bins() {
    let spec = StaticThrottleSpec::new(limits(1));
    let throttler = throttler_with(spec).await;

    let blocker = throttler
        .obtain_connection_throttler("web", "main", &["b"])
        .unwrap();
    assert!(blocker.obtain_connection_permission().unwrap().is_some());

    // [a, b] fails on b; the reservation taken on a must be rewound.
    let pair = throttler
        .obtain_connection_throttler("web", "main", &["a", "b"])
        .unwrap();
    assert!(pair.obtain_connection_permission().unwrap().is_none());

    let a_only = throttler
        .obtain_connection_throttler("web", "main", &["a"])
        .unwrap();
    assert!(a_only.obtain_connection_permission().unwrap().is_some());
}

#[tokio::test]
async fn zero_bin_acquisition_trivially_succeeds() {
    let throttler = Throttler::new();
    throttler
        .create_or_update("web", "main", Arc::new(UnlimitedSpec))
        .await
        .unwrap();

    let ct = throttler
        .obtain_connection_throttler("web", "main", &[])
        .unwrap();
    assert!(ct.obtain_connection_permission().unwrap().is_some());
    assert_eq!(ct.over_connection_quota_count(), 0);
}

#[tokio::test]
async fn zero_max_active_blocks_all_connections() {
    let throttler = throttler_with(StaticThrottleSpec::new(limits(0))).await;
    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();
    assert!(ct.obtain_connection_permission().unwrap().is_none());
}

#[tokio::test]
async fn downward_adjustment_reports_over_quota() {
    let throttler = throttler_with(StaticThrottleSpec::new(limits(2))).await;
    let ct = throttler
        .obtain_connection_throttler("web", "main", &["h1"])
        .unwrap();

    assert!(ct.obtain_connection_permission().unwrap().is_some());
    assert!(ct.obtain_connection_permission().unwrap().is_some());
    assert_eq!(ct.over_connection_quota_count(), 0);

    // Lower the limit below the open count; the handle keeps working and
    // sees the new limit at its next operation.
    throttler
        .create_or_update("web", "main", StaticThrottleSpec::new(limits(1)).into_shared())
        .await
        .unwrap();

    assert_eq!(ct.over_connection_quota_count(), 1);
    assert!(ct.obtain_connection_permission().unwrap().is_none());

    ct.release_connection_permission();
    assert_eq!(ct.over_connection_quota_count(), 0);
    // Back at the new limit, still full.
    assert!(ct.obtain_connection_permission().unwrap().is_none());

    ct.release_connection_permission();
    assert!(ct.obtain_connection_permission().unwrap().is_some());
}

/// Spec whose connection query fails for one bin.
struct RejectingSpec;

impl ThrottleSpec for RejectingSpec {
    fn max_open_connections(&self, bin: &str) -> anyhow::Result<u32> {
        if bin == "forbidden" {
            anyhow::bail!("no limits configured for {bin}");
        }
        Ok(10)
    }

    fn min_ms_between_fetches(&self, _bin: &str) -> anyhow::Result<u64> {
        Ok(0)
    }

    fn min_ms_per_byte(&self, _bin: &str) -> anyhow::Result<f64> {
        Ok(0.0)
    }
}

#[tokio::test]
async fn spec_failure_aborts_acquisition() {
    let throttler = Throttler::new();
    throttler
        .create_or_update("web", "main", Arc::new(RejectingSpec))
        .await
        .unwrap();

    let ct = throttler
        .obtain_connection_throttler("web", "main", &["ok", "forbidden"])
        .unwrap();
    let err = ct.obtain_connection_permission().unwrap_err();
    assert!(matches!(err, ThrottleError::Spec { ref bin, .. } if bin == "forbidden"));

    // The reservation on "ok" was rewound: the bin is still fully available.
    let ok = throttler
        .obtain_connection_throttler("web", "main", &["ok"])
        .unwrap();
    for _ in 0..10 {
        assert!(ok.obtain_connection_permission().unwrap().is_some());
    }
    assert!(ok.obtain_connection_permission().unwrap().is_none());
}
