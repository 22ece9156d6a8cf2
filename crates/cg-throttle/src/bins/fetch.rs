//! Fetch-interval bins.
//!
//! Paces fetch starts so that successive grants on the same bin are at least
//! `min_interval` apart. Reservation is a queue slot, not a grant: waiters
//! line up FIFO and exactly one (the queue head) takes each pacing slot,
//! rewrites `next_fetch_earliest`, and wakes the rest.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use cg_common::FetchBinStats;
use super::{TicketQueue, WaitStep};

#[derive(Debug)]
struct FetchState {
    alive: bool,
    min_interval: Duration,
    /// Earliest instant at which the next fetch may begin.
    next_fetch_earliest: Instant,
    /// Fetch requests waiting in line.
    reserved: u32,
    tickets: TicketQueue,
}

pub struct FetchBin {
    name: Arc<str>,
    state: Mutex<FetchState>,
    wakeup: Notify,
}

impl FetchBin {
    pub(crate) fn new(name: Arc<str>, min_interval_ms: u64) -> Self {
        debug!(bin = %name, min_interval_ms, "Creating fetch bin");
        Self {
            name,
            state: Mutex::new(FetchState {
                alive: true,
                min_interval: Duration::from_millis(min_interval_ms),
                next_fetch_earliest: Instant::now(),
                reserved: 0,
                tickets: TicketQueue::default(),
            }),
            wakeup: Notify::new(),
        }
    }

    /// Join the grant queue. Always succeeds; the wait happens in
    /// [`FetchBin::wait_next_fetch`].
    pub(crate) fn reserve_fetch_request(&self) -> u64 {
        let mut state = self.state.lock();
        state.reserved += 1;
        state.tickets.join()
    }

    /// Rewind a reservation that will not be granted.
    pub(crate) fn clear_reservation(&self, ticket: u64) {
        {
            let mut state = self.state.lock();
            state.reserved = state.reserved.saturating_sub(1);
            state.tickets.leave(ticket);
        }
        self.wakeup.notify_waiters();
    }

    /// Wait until this reservation's pacing slot arrives, then consume it.
    ///
    /// Returns `false` when the bin shuts down first; the reservation is
    /// still held in that case and must be rewound by the caller.
    pub(crate) async fn wait_next_fetch(&self, ticket: u64) -> bool {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register for wakeups before evaluating, so a broadcast landing
            // between the check and the await is not lost.
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                if !state.alive {
                    WaitStep::Dead
                } else if state.tickets.is_front(ticket) {
                    let now = Instant::now();
                    if now >= state.next_fetch_earliest {
                        state.next_fetch_earliest = now + state.min_interval;
                        state.reserved = state.reserved.saturating_sub(1);
                        state.tickets.advance();
                        WaitStep::Granted
                    } else {
                        WaitStep::Until(state.next_fetch_earliest)
                    }
                } else {
                    WaitStep::Turn
                }
            };

            match step {
                WaitStep::Granted => {
                    self.wakeup.notify_waiters();
                    return true;
                }
                WaitStep::Dead => return false,
                WaitStep::Until(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                WaitStep::Turn => notified.await,
            }
        }
    }

    pub(crate) fn update_min_time_between_fetches(&self, min_interval_ms: u64) {
        {
            let mut state = self.state.lock();
            let new = Duration::from_millis(min_interval_ms);
            if state.min_interval == new {
                return;
            }
            debug!(bin = %self.name, min_interval_ms, "Updating fetch bin interval");
            state.min_interval = new;
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

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.reserved == 0 && state.tickets.is_empty()
    }

    pub(crate) fn stats(&self) -> FetchBinStats {
        let state = self.state.lock();
        FetchBinStats {
            bin: self.name.to_string(),
            min_interval_ms: state.min_interval.as_millis() as u64,
            reserved: state.reserved,
        }
    }
}
