use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Throttle Limit Types
// ============================================================================

/// The three throttle parameters for a single bin.
///
/// A bin is a caller-named throttling unit (a hostname, a service identifier,
/// a tenant). Every acquisition names one or more bins and is bounded by the
/// intersection of their limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinLimits {
    /// Maximum connections that may be open against this bin at once.
    pub max_open_connections: u32,
    /// Minimum milliseconds between successive fetch starts on this bin.
    /// Zero disables interval pacing.
    pub min_ms_between_fetches: u64,
    /// Minimum milliseconds per byte read from streams on this bin.
    /// Zero disables byte-rate pacing.
    pub min_ms_per_byte: f64,
}

impl Default for BinLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl BinLimits {
    /// Limits that never throttle anything.
    pub const fn unlimited() -> Self {
        Self {
            max_open_connections: u32::MAX,
            min_ms_between_fetches: 0,
            min_ms_per_byte: 0.0,
        }
    }
}

// ============================================================================
// Stats Snapshot Types
// ============================================================================

/// Point-in-time counters for one connection bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionBinStats {
    pub bin: String,
    pub in_use: u32,
    pub reserved: u32,
    pub max_active: u32,
}

/// Point-in-time counters for one fetch-pacing bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBinStats {
    pub bin: String,
    pub min_interval_ms: u64,
    /// Fetch requests currently queued for a pacing slot.
    pub reserved: u32,
}

/// Point-in-time counters for one stream-read bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBinStats {
    pub bin: String,
    pub ms_per_byte: f64,
    pub active_streams: u32,
    /// Bytes granted during the current pacing series. Resets when the last
    /// stream on the bin closes.
    pub series_bytes_read: u64,
}

/// Snapshot of one throttle group and all of its bins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStats {
    pub group_type: String,
    pub group_name: String,
    pub connection_bins: Vec<ConnectionBinStats>,
    pub fetch_bins: Vec<FetchBinStats>,
    pub stream_bins: Vec<StreamBinStats>,
    pub captured_at: DateTime<Utc>,
}
