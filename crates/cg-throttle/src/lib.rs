//! CrawlGate Throttling Engine
//!
//! A multi-dimensional throttling coordinator for crawl workloads. Three
//! independent resources are gated per caller-named bin (hostname, service
//! identifier, tenant):
//!
//! - concurrent connections (`max_open_connections`)
//! - minimum interval between fetch starts (`min_ms_between_fetches`)
//! - minimum time per byte read from a stream (`min_ms_per_byte`)
//!
//! Callers obtain a [`ConnectionThrottler`] from the [`Throttler`] for a
//! group and bin set, then walk down the handle chain: connection permission
//! -> fetch permission (paced, FIFO per bin) -> per-block read permissions
//! (byte-rate paced), releasing in reverse order. A `None` handle, `false`
//! permission, or `u32::MAX` quota count means the group is shutting down
//! and the work unit should be abandoned.
//!
//! Limits come from a caller-supplied [`ThrottleSpec`] and can be replaced
//! live; [`spawn_poll_task`] keeps bins synchronized with specs that change
//! behind the engine's back.

pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod spec;
pub mod throttle_metrics;

mod bins;
mod group;
mod handle;
mod throttler;

pub use error::ThrottleError;
pub use handle::{ConnectionThrottler, FetchThrottler, StreamThrottler};
pub use lifecycle::{spawn_poll_task, PollTaskConfig};
pub use registry::{ClusterRegistry, LocalRegistry};
pub use spec::{StaticThrottleSpec, ThrottleSpec, UnlimitedSpec};
pub use throttler::Throttler;

// Re-export the shared limit and stats types for callers.
pub use cg_common::{BinLimits, GroupStats};

pub type Result<T> = std::result::Result<T, ThrottleError>;
