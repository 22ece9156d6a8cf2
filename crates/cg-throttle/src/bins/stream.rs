//! Stream-read bins.
//!
//! Paces bytes read from open streams. Pacing is measured within a series:
//! the interval during which the bin has at least one active stream. The
//! budget is `(now - series_start) / ms_per_byte` bytes; readers that would
//! exceed it sleep until their request fits. Short reads give time back
//! through [`ThrottleBin::end_read`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use cg_common::StreamBinStats;
use super::{TicketQueue, WaitStep};

#[derive(Debug)]
struct StreamState {
    alive: bool,
    ms_per_byte: f64,
    /// Open streams referencing this bin.
    active_streams: u32,
    /// Bytes granted during the current series.
    total_bytes_read: u64,
    /// Set when `active_streams` transitions 0 -> 1.
    series_start: Option<Instant>,
    tickets: TicketQueue,
}

pub struct ThrottleBin {
    name: Arc<str>,
    state: Mutex<StreamState>,
    wakeup: Notify,
}

/// Removes a read waiter's ticket if it exits without a grant.
struct TicketGuard<'a> {
    bin: &'a ThrottleBin,
    ticket: u64,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.bin.state.lock();
                state.tickets.leave(self.ticket);
            }
            self.bin.wakeup.notify_waiters();
        }
    }
}

impl ThrottleBin {
    pub(crate) fn new(name: Arc<str>, ms_per_byte: f64) -> Self {
        debug!(bin = %name, ms_per_byte, "Creating stream bin");
        Self {
            name,
            state: Mutex::new(StreamState {
                alive: true,
                ms_per_byte,
                active_streams: 0,
                total_bytes_read: 0,
                series_start: None,
                tickets: TicketQueue::default(),
            }),
            wakeup: Notify::new(),
        }
    }

    /// Register one more open stream; the first stream starts a fresh series.
    pub(crate) fn begin_fetch(&self) {
        let mut state = self.state.lock();
        state.active_streams += 1;
        if state.active_streams == 1 {
            state.series_start = Some(Instant::now());
            state.total_bytes_read = 0;
        }
    }

    /// Drop one open stream; the last one out clears the series so the next
    /// fetch starts a fresh pacing window.
    pub(crate) fn end_fetch(&self) {
        {
            let mut state = self.state.lock();
            state.active_streams = state.active_streams.saturating_sub(1);
            if state.active_streams == 0 {
                state.series_start = None;
                state.total_bytes_read = 0;
            }
        }
        self.wakeup.notify_waiters();
    }

    /// Wait until `byte_count` more bytes fit the series budget, then claim
    /// them provisionally. Returns `false` when the bin shuts down first.
    pub(crate) async fn begin_read(&self, byte_count: u64) -> bool {
        let ticket = {
            let mut state = self.state.lock();
            state.tickets.join()
        };
        let mut guard = TicketGuard {
            bin: self,
            ticket,
            armed: true,
        };

        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                if !state.alive {
                    WaitStep::Dead
                } else if state.tickets.is_front(ticket) {
                    let now = Instant::now();
                    let earliest = Self::earliest_ok(&state, byte_count, now);
                    if now >= earliest {
                        state.total_bytes_read += byte_count;
                        state.tickets.advance();
                        WaitStep::Granted
                    } else {
                        WaitStep::Until(earliest)
                    }
                } else {
                    WaitStep::Turn
                }
            };

            match step {
                WaitStep::Granted => {
                    guard.armed = false;
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

    fn earliest_ok(state: &StreamState, byte_count: u64, now: Instant) -> Instant {
        if state.ms_per_byte <= 0.0 {
            return now;
        }
        let start = state.series_start.unwrap_or(now);
        let needed_ms = (state.total_bytes_read + byte_count) as f64 * state.ms_per_byte;
        start + Duration::from_secs_f64(needed_ms / 1000.0)
    }

    /// Settle a provisional claim against the bytes actually read. A short
    /// read (`actual < orig`) returns budget to the series.
    pub(crate) fn end_read(&self, orig: u64, actual: u64) {
        {
            let mut state = self.state.lock();
            if actual >= orig {
                state.total_bytes_read += actual - orig;
            } else {
                let refund = orig - actual;
                state.total_bytes_read = state.total_bytes_read.saturating_sub(refund);
            }
        }
        self.wakeup.notify_waiters();
    }

    pub(crate) fn update_min_ms_per_byte(&self, ms_per_byte: f64) {
        {
            let mut state = self.state.lock();
            if state.ms_per_byte == ms_per_byte {
                return;
            }
            debug!(bin = %self.name, ms_per_byte, "Updating stream bin byte rate");
            state.ms_per_byte = ms_per_byte;
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
        state.active_streams == 0 && state.tickets.is_empty()
    }

    pub(crate) fn stats(&self) -> StreamBinStats {
        let state = self.state.lock();
        StreamBinStats {
            bin: self.name.to_string(),
            ms_per_byte: state.ms_per_byte,
            active_streams: state.active_streams,
            series_bytes_read: state.total_bytes_read,
        }
    }
}
