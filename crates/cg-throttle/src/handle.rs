//! Issued permission handles.
//!
//! Handles are immutable (group reference, bin-name set) pairs; all mutable
//! state lives in the group's bins. The group reference is weak so an
//! outstanding handle never keeps a destroyed group alive: once the group is
//! removed, every operation degrades to the shutting-down result (`None`,
//! `false`, or the `u32::MAX` quota sentinel).

use std::sync::{Arc, Weak};

use crate::group::ThrottleGroup;
use crate::Result;

/// Permission source for connections against one bin set. Obtained from
/// [`crate::Throttler::obtain_connection_throttler`].
pub struct ConnectionThrottler {
    group: Weak<ThrottleGroup>,
    bin_names: Arc<[Arc<str>]>,
}

impl ConnectionThrottler {
    pub(crate) fn new(group: Weak<ThrottleGroup>, bin_names: Arc<[Arc<str>]>) -> Self {
        Self { group, bin_names }
    }

    /// Ask to open one connection. Never waits: `Ok(None)` means a bin is at
    /// capacity or the group is going away; retry after a release, or drain
    /// when [`Self::over_connection_quota_count`] says so.
    pub fn obtain_connection_permission(&self) -> Result<Option<FetchThrottler>> {
        let Some(group) = self.group.upgrade() else {
            return Ok(None);
        };
        if group.obtain_connection_permission(&self.bin_names)? {
            Ok(Some(FetchThrottler {
                group: self.group.clone(),
                bin_names: self.bin_names.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// How many of this handle's bins are over quota after a downward limit
    /// adjustment. `u32::MAX` when the group is shutting down, so callers
    /// using "release while positive" drain on shutdown too.
    pub fn over_connection_quota_count(&self) -> u32 {
        match self.group.upgrade() {
            Some(group) => group.over_connection_quota_count(&self.bin_names),
            None => u32::MAX,
        }
    }

    /// Return one connection previously granted through this handle.
    pub fn release_connection_permission(&self) {
        if let Some(group) = self.group.upgrade() {
            group.release_connection_permission(&self.bin_names);
        }
    }
}

/// One granted connection; hands out paced fetch permissions.
#[derive(Debug)]
pub struct FetchThrottler {
    group: Weak<ThrottleGroup>,
    bin_names: Arc<[Arc<str>]>,
}

impl FetchThrottler {
    /// Wait for a fetch pacing slot on every bin (FIFO per bin). `Ok(None)`
    /// means the group shut down while waiting; abandon the work unit.
    pub async fn obtain_fetch_document_permission(&self) -> Result<Option<StreamThrottler>> {
        let Some(group) = self.group.upgrade() else {
            return Ok(None);
        };
        if group.obtain_fetch_document_permission(&self.bin_names).await? {
            Ok(Some(StreamThrottler {
                group: self.group.clone(),
                bin_names: self.bin_names.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

/// One open stream; paces its reads and must be closed when the stream ends.
pub struct StreamThrottler {
    group: Weak<ThrottleGroup>,
    bin_names: Arc<[Arc<str>]>,
}

impl StreamThrottler {
    /// Wait until `byte_count` bytes fit every bin's series budget. `false`
    /// means shutdown; abandon the stream.
    pub async fn obtain_read_permission(&self, byte_count: u64) -> bool {
        match self.group.upgrade() {
            Some(group) => group.obtain_read_permission(&self.bin_names, byte_count).await,
            None => false,
        }
    }

    /// Settle a granted read against the bytes actually delivered; a short
    /// read gives pacing budget back.
    pub fn release_read_permission(&self, orig_byte_count: u64, actual_byte_count: u64) {
        if let Some(group) = self.group.upgrade() {
            group.release_read_permission(&self.bin_names, orig_byte_count, actual_byte_count);
        }
    }

    /// Close the stream; the last stream on a bin resets its pacing series.
    pub fn close_stream(&self) {
        if let Some(group) = self.group.upgrade() {
            group.close_stream(&self.bin_names);
        }
    }
}
