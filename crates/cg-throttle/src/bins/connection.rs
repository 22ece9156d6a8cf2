//! Connection-count bins.
//!
//! Purely counter-based: a reservation either succeeds immediately or fails
//! immediately, so connection acquisition never waits. Backpressure is pushed
//! to the caller, which retries after a release or drains when
//! `over_quota` reports an exceeded bin.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use cg_common::ConnectionBinStats;

#[derive(Debug)]
struct ConnectionState {
    alive: bool,
    /// Confirmed-open connections.
    in_use: u32,
    /// Permissions granted but not yet confirmed.
    reserved: u32,
    max_active: u32,
}

/// One connection-quota unit. Invariant at every confirmation checkpoint:
/// `in_use + reserved <= max_active`, temporarily violable after a downward
/// `max_active` update, in which case no new reservation succeeds until the
/// count drains.
pub struct ConnectionBin {
    name: Arc<str>,
    state: Mutex<ConnectionState>,
    wakeup: Notify,
}

impl ConnectionBin {
    pub(crate) fn new(name: Arc<str>, max_active: u32) -> Self {
        debug!(bin = %name, max_active, "Creating connection bin");
        Self {
            name,
            state: Mutex::new(ConnectionState {
                alive: true,
                in_use: 0,
                reserved: 0,
                max_active,
            }),
            wakeup: Notify::new(),
        }
    }

    /// Try to reserve one connection slot. Never blocks.
    pub(crate) fn reserve_a_connection(&self) -> bool {
        let mut state = self.state.lock();
        if !state.alive {
            return false;
        }
        if (state.in_use as u64 + state.reserved as u64) < state.max_active as u64 {
            state.reserved += 1;
            true
        } else {
            false
        }
    }

    /// Rewind a reservation that will not be confirmed.
    pub(crate) fn clear_reservation(&self) {
        {
            let mut state = self.state.lock();
            state.reserved = state.reserved.saturating_sub(1);
        }
        self.wakeup.notify_waiters();
    }

    /// Convert a reservation into an open connection.
    pub(crate) fn note_connection_creation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        state.in_use += 1;
    }

    /// Record a connection close and wake anyone watching the bin.
    pub(crate) fn note_connection_destruction(&self) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.wakeup.notify_waiters();
    }

    /// True when a downward limit adjustment left the bin over quota.
    pub(crate) fn is_over_quota(&self) -> bool {
        let state = self.state.lock();
        state.in_use > state.max_active
    }

    pub(crate) fn update_max_active_connections(&self, max_active: u32) {
        {
            let mut state = self.state.lock();
            if state.max_active == max_active {
                return;
            }
            debug!(bin = %self.name, old = state.max_active, new = max_active,
                "Updating connection bin limit");
            state.max_active = max_active;
        }
        self.wakeup.notify_waiters();
    }

    pub(crate) fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.alive = false;
        }
        self.wakeup.notify_waiters();
    }

    /// No open connections and no pending reservations.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.in_use == 0 && state.reserved == 0
    }

    pub(crate) fn stats(&self) -> ConnectionBinStats {
        let state = self.state.lock();
        ConnectionBinStats {
            bin: self.name.to_string(),
            in_use: state.in_use,
            reserved: state.reserved,
            max_active: state.max_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_respect_max_active() {
        let bin = ConnectionBin::new(Arc::from("h1"), 2);
        assert!(bin.reserve_a_connection());
        assert!(bin.reserve_a_connection());
        assert!(!bin.reserve_a_connection());

        bin.note_connection_creation();
        bin.note_connection_creation();
        assert!(!bin.reserve_a_connection());

        bin.note_connection_destruction();
        assert!(bin.reserve_a_connection());
    }

    #[test]
    fn zero_max_active_blocks_everything() {
        let bin = ConnectionBin::new(Arc::from("h1"), 0);
        assert!(!bin.reserve_a_connection());
    }

    #[test]
    fn downward_adjustment_marks_over_quota() {
        let bin = ConnectionBin::new(Arc::from("h1"), 2);
        assert!(bin.reserve_a_connection());
        assert!(bin.reserve_a_connection());
        bin.note_connection_creation();
        bin.note_connection_creation();

        bin.update_max_active_connections(1);
        assert!(bin.is_over_quota());
        assert!(!bin.reserve_a_connection());

        bin.note_connection_destruction();
        assert!(!bin.is_over_quota());
        // Still full at the new limit.
        assert!(!bin.reserve_a_connection());
    }

    #[test]
    fn shut_down_refuses_reservations() {
        let bin = ConnectionBin::new(Arc::from("h1"), 5);
        bin.shut_down();
        assert!(!bin.reserve_a_connection());
    }
}
