//! ThrottleGroup - one self-consistent throttling environment.
//!
//! A group owns three lazily-populated bin tables (connection, fetch,
//! stream) and the live spec that parameterizes them. Acquisitions run the
//! same three-phase protocol over every named bin:
//!
//! 1. Reserve (non-blocking, all-or-nothing): claim a slot on each bin in
//!    order; the first refusal rewinds everything claimed so far.
//! 2. Wait (fetch and read bins only): sleep on each bin's pacing condition,
//!    FIFO per bin. Shutdown or cancellation rewinds what is still reserved.
//! 3. Confirm: convert reservations into active counts.
//!
//! Reserve never sleeps with partial state and waits happen only after every
//! reservation succeeded, so acquisitions over arbitrary bin subsets cannot
//! deadlock. Rewinds are RAII guards, which also covers callers that drop an
//! acquisition future mid-wait.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use cg_common::GroupStats;

use crate::bins::{ConnectionBin, FetchBin, ThrottleBin};
use crate::error::ThrottleError;
use crate::registry::ClusterRegistry;
use crate::spec::ThrottleSpec;
use crate::throttle_metrics;
use crate::Result;

const STATE_ALIVE: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_DEAD: u8 = 2;

pub struct ThrottleGroup {
    group_type: Arc<str>,
    group_name: Arc<str>,
    spec: RwLock<Arc<dyn ThrottleSpec>>,
    connection_bins: DashMap<Arc<str>, Arc<ConnectionBin>>,
    fetch_bins: DashMap<Arc<str>, Arc<FetchBin>>,
    throttle_bins: DashMap<Arc<str>, Arc<ThrottleBin>>,
    /// Alive -> Draining -> Dead.
    state: AtomicU8,
    /// Identity returned by the cluster registry, ended on destruction.
    service_id: Mutex<Option<String>>,
}

/// Unconfirmed claim on a connection bin; rewinds on drop.
struct ConnectionReservation {
    bin: Arc<ConnectionBin>,
    armed: bool,
}

impl ConnectionReservation {
    fn confirm(&mut self) {
        self.bin.note_connection_creation();
        self.armed = false;
    }
}

impl Drop for ConnectionReservation {
    fn drop(&mut self) {
        if self.armed {
            self.bin.clear_reservation();
        }
    }
}

/// Queue slot on a fetch bin; rewinds on drop until the slot is granted.
struct FetchReservation {
    bin: Arc<FetchBin>,
    ticket: u64,
    armed: bool,
}

impl Drop for FetchReservation {
    fn drop(&mut self) {
        if self.armed {
            self.bin.clear_reservation(self.ticket);
        }
    }
}

/// Provisional byte claims across stream bins; rewinds on drop.
struct ProvisionalReads {
    bins: Vec<Arc<ThrottleBin>>,
    byte_count: u64,
    armed: bool,
}

impl Drop for ProvisionalReads {
    fn drop(&mut self) {
        if self.armed {
            for bin in self.bins.iter().rev() {
                bin.end_read(self.byte_count, 0);
            }
        }
    }
}

impl ThrottleGroup {
    pub(crate) fn new(
        group_type: Arc<str>,
        group_name: Arc<str>,
        spec: Arc<dyn ThrottleSpec>,
        service_id: String,
    ) -> Self {
        Self {
            group_type,
            group_name,
            spec: RwLock::new(spec),
            connection_bins: DashMap::new(),
            fetch_bins: DashMap::new(),
            throttle_bins: DashMap::new(),
            state: AtomicU8::new(STATE_ALIVE),
            service_id: Mutex::new(Some(service_id)),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_ALIVE
    }

    /// Replace the live spec and push its answers into every existing bin.
    /// Outstanding handles see the new limits at their next operation.
    pub(crate) fn set_spec(&self, spec: Arc<dyn ThrottleSpec>) -> Result<()> {
        *self.spec.write() = spec;
        self.refresh_from_spec()
    }

    /// Re-read the live spec for every existing bin. Idempotent when the
    /// spec's answers have not changed.
    pub(crate) fn refresh_from_spec(&self) -> Result<()> {
        let spec = self.spec.read().clone();
        for entry in self.connection_bins.iter() {
            let limit = spec
                .max_open_connections(entry.key())
                .map_err(|e| self.spec_error(entry.key(), e))?;
            entry.value().update_max_active_connections(limit);
        }
        for entry in self.fetch_bins.iter() {
            let interval = spec
                .min_ms_between_fetches(entry.key())
                .map_err(|e| self.spec_error(entry.key(), e))?;
            entry.value().update_min_time_between_fetches(interval);
        }
        for entry in self.throttle_bins.iter() {
            let rate = spec
                .min_ms_per_byte(entry.key())
                .map_err(|e| self.spec_error(entry.key(), e))?;
            entry.value().update_min_ms_per_byte(rate);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection acquisition
    // ------------------------------------------------------------------

    /// Claim one connection slot on every named bin, all or nothing. Never
    /// waits: `Ok(false)` means some bin is full (or the group is going
    /// away) and the caller's backpressure loop decides when to retry.
    pub(crate) fn obtain_connection_permission(&self, bins: &[Arc<str>]) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }

        let mut reservations = Vec::with_capacity(bins.len());
        for name in bins {
            let bin = self.connection_bin(name)?;
            if !bin.reserve_a_connection() {
                // Guards rewind every earlier reservation.
                throttle_metrics::record_connection_denied(&self.group_type, &self.group_name);
                return Ok(false);
            }
            reservations.push(ConnectionReservation { bin, armed: true });
        }

        for reservation in &mut reservations {
            reservation.confirm();
        }
        throttle_metrics::record_connection_granted(&self.group_type, &self.group_name);
        Ok(true)
    }

    /// Return one connection on every named bin.
    pub(crate) fn release_connection_permission(&self, bins: &[Arc<str>]) {
        for name in bins {
            if let Some(bin) = self.connection_bins.get(name) {
                bin.note_connection_destruction();
            }
        }
        throttle_metrics::record_connection_released(&self.group_type, &self.group_name);
    }

    /// Number of named bins left over quota by a downward limit adjustment.
    /// `u32::MAX` while shutting down, so "release if positive" callers
    /// drain naturally.
    pub(crate) fn over_connection_quota_count(&self, bins: &[Arc<str>]) -> u32 {
        if !self.is_alive() {
            return u32::MAX;
        }
        bins.iter()
            .filter(|name| {
                self.connection_bins
                    .get(*name)
                    .map(|bin| bin.is_over_quota())
                    .unwrap_or(false)
            })
            .count() as u32
    }

    // ------------------------------------------------------------------
    // Fetch acquisition
    // ------------------------------------------------------------------

    /// Wait for a pacing slot on every named fetch bin (FIFO per bin), then
    /// open one stream on each corresponding stream bin. `Ok(false)` means
    /// the group shut down while waiting; nothing stays reserved.
    pub(crate) async fn obtain_fetch_document_permission(&self, bins: &[Arc<str>]) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }

        // Reserve: a queue slot on every bin before any wait, so waiters
        // cannot starve each other across bins.
        let mut reservations = Vec::with_capacity(bins.len());
        for name in bins {
            let bin = self.fetch_bin(name)?;
            let ticket = bin.reserve_fetch_request();
            reservations.push(FetchReservation {
                bin,
                ticket,
                armed: true,
            });
        }

        // Wait: consume each slot in turn. A consumed slot is not restored
        // if a later bin reports shutdown; only still-reserved slots rewind.
        for reservation in &mut reservations {
            let bin = Arc::clone(&reservation.bin);
            if !bin.wait_next_fetch(reservation.ticket).await {
                return Ok(false);
            }
            reservation.armed = false;
        }

        // Confirm: one stream per fetch on each named stream bin, created
        // lazily here because each stream corresponds to one fetch.
        let mut begun: Vec<Arc<ThrottleBin>> = Vec::with_capacity(bins.len());
        for name in bins {
            match self.throttle_bin(name) {
                Ok(bin) => {
                    bin.begin_fetch();
                    begun.push(bin);
                }
                Err(e) => {
                    for bin in begun.iter().rev() {
                        bin.end_fetch();
                    }
                    return Err(e);
                }
            }
        }

        throttle_metrics::record_fetch_granted(&self.group_type, &self.group_name);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Stream read acquisition
    // ------------------------------------------------------------------

    /// Wait until `byte_count` bytes fit every named bin's series budget.
    /// `false` means shutdown; provisional claims on earlier bins are
    /// rewound.
    pub(crate) async fn obtain_read_permission(&self, bins: &[Arc<str>], byte_count: u64) -> bool {
        if !self.is_alive() {
            return false;
        }

        let mut provisional = ProvisionalReads {
            bins: Vec::with_capacity(bins.len()),
            byte_count,
            armed: true,
        };
        for name in bins {
            let Some(bin) = self.throttle_bins.get(name).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if !bin.begin_read(byte_count).await {
                return false;
            }
            provisional.bins.push(bin);
        }
        provisional.armed = false;
        throttle_metrics::record_bytes_granted(&self.group_type, &self.group_name, byte_count);
        true
    }

    /// Settle a granted read against the bytes actually delivered.
    pub(crate) fn release_read_permission(&self, bins: &[Arc<str>], orig: u64, actual: u64) {
        for name in bins {
            if let Some(bin) = self.throttle_bins.get(name) {
                bin.end_read(orig, actual);
            }
        }
    }

    /// Close one stream on every named bin; the last stream out of a bin
    /// resets its pacing series.
    pub(crate) fn close_stream(&self, bins: &[Arc<str>]) {
        for name in bins {
            if let Some(bin) = self.throttle_bins.get(name) {
                bin.end_fetch();
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drain and destroy: no new acquisitions, every waiter released with a
    /// shutting-down result, service activity ended, bins dropped.
    pub(crate) async fn shut_down(&self, registry: &Arc<dyn ClusterRegistry>) {
        self.state.store(STATE_DRAINING, Ordering::SeqCst);
        info!(
            group_type = %self.group_type,
            group = %self.group_name,
            "Shutting down throttle group"
        );

        for entry in self.connection_bins.iter() {
            entry.value().shut_down();
        }
        for entry in self.fetch_bins.iter() {
            entry.value().shut_down();
        }
        for entry in self.throttle_bins.iter() {
            entry.value().shut_down();
        }

        if let Some(service_id) = self.service_id.lock().take() {
            if let Err(e) = registry.end_service(&service_id).await {
                warn!(
                    group_type = %self.group_type,
                    group = %self.group_name,
                    error = %e,
                    "Failed to end service activity for group"
                );
            }
        }

        self.connection_bins.clear();
        self.fetch_bins.clear();
        self.throttle_bins.clear();
        self.state.store(STATE_DEAD, Ordering::SeqCst);
    }

    /// Drop bins with no open resources and no waiters.
    pub(crate) fn free_unused_resources(&self) {
        self.connection_bins.retain(|_, bin| !bin.is_idle());
        self.fetch_bins.retain(|_, bin| !bin.is_idle());
        self.throttle_bins.retain(|_, bin| !bin.is_idle());
    }

    pub(crate) fn stats(&self) -> GroupStats {
        GroupStats {
            group_type: self.group_type.to_string(),
            group_name: self.group_name.to_string(),
            connection_bins: self
                .connection_bins
                .iter()
                .map(|e| e.value().stats())
                .collect(),
            fetch_bins: self.fetch_bins.iter().map(|e| e.value().stats()).collect(),
            stream_bins: self
                .throttle_bins
                .iter()
                .map(|e| e.value().stats())
                .collect(),
            captured_at: Utc::now(),
        }
    }

    // ------------------------------------------------------------------
    // Lazy bin creation
    // ------------------------------------------------------------------

    fn connection_bin(&self, name: &Arc<str>) -> Result<Arc<ConnectionBin>> {
        if let Some(bin) = self.connection_bins.get(name) {
            return Ok(Arc::clone(bin.value()));
        }
        let spec = self.spec.read().clone();
        let max_active = spec
            .max_open_connections(name)
            .map_err(|e| self.spec_error(name, e))?;
        let bin = self
            .connection_bins
            .entry(Arc::clone(name))
            .or_insert_with(|| Arc::new(ConnectionBin::new(Arc::clone(name), max_active)))
            .clone();
        Ok(bin)
    }

    fn fetch_bin(&self, name: &Arc<str>) -> Result<Arc<FetchBin>> {
        if let Some(bin) = self.fetch_bins.get(name) {
            return Ok(Arc::clone(bin.value()));
        }
        let spec = self.spec.read().clone();
        let interval = spec
            .min_ms_between_fetches(name)
            .map_err(|e| self.spec_error(name, e))?;
        let bin = self
            .fetch_bins
            .entry(Arc::clone(name))
            .or_insert_with(|| Arc::new(FetchBin::new(Arc::clone(name), interval)))
            .clone();
        Ok(bin)
    }

    fn throttle_bin(&self, name: &Arc<str>) -> Result<Arc<ThrottleBin>> {
        if let Some(bin) = self.throttle_bins.get(name) {
            return Ok(Arc::clone(bin.value()));
        }
        let spec = self.spec.read().clone();
        let rate = spec
            .min_ms_per_byte(name)
            .map_err(|e| self.spec_error(name, e))?;
        let bin = self
            .throttle_bins
            .entry(Arc::clone(name))
            .or_insert_with(|| Arc::new(ThrottleBin::new(Arc::clone(name), rate)))
            .clone();
        Ok(bin)
    }

    fn spec_error(&self, bin: &str, source: anyhow::Error) -> ThrottleError {
        warn!(
            group_type = %self.group_type,
            group = %self.group_name,
            bin = %bin,
            error = %source,
            "Throttle spec rejected bin"
        );
        ThrottleError::Spec {
            bin: bin.to_string(),
            source,
        }
    }
}
