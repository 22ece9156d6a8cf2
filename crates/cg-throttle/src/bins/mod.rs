//! Bin primitives.
//!
//! A bin is a miniature monitor: a `parking_lot::Mutex` guards its counters,
//! a `tokio::sync::Notify` hosts its waiters. Locks are held for counter
//! arithmetic only, never across an await. Parameter updates and shutdown
//! broadcast via `notify_waiters` so every waiter re-evaluates its grant
//! condition under the lock.

mod connection;
mod fetch;
mod stream;

pub use connection::ConnectionBin;
pub use fetch::FetchBin;
pub use stream::ThrottleBin;

use std::collections::VecDeque;

/// FIFO grant order for a bin's waiters.
///
/// Each waiter takes a ticket when it queues; only the head of the queue may
/// take the next pacing slot. A cancelled waiter leaves the queue from
/// whatever position it holds, which unblocks the next ticket.
#[derive(Debug, Default)]
pub(crate) struct TicketQueue {
    next: u64,
    waiting: VecDeque<u64>,
}

impl TicketQueue {
    pub(crate) fn join(&mut self) -> u64 {
        let ticket = self.next;
        self.next += 1;
        self.waiting.push_back(ticket);
        ticket
    }

    pub(crate) fn is_front(&self, ticket: u64) -> bool {
        self.waiting.front() == Some(&ticket)
    }

    /// Remove the head after its grant.
    pub(crate) fn advance(&mut self) {
        self.waiting.pop_front();
    }

    /// Remove a ticket from any position (cancellation, shutdown rewind).
    pub(crate) fn leave(&mut self, ticket: u64) {
        if let Some(pos) = self.waiting.iter().position(|&t| t == ticket) {
            self.waiting.remove(pos);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Outcome of one grant-condition evaluation under a bin's lock.
pub(crate) enum WaitStep {
    /// The slot was taken; the waiter proceeds.
    Granted,
    /// The bin was shut down; the waiter rewinds.
    Dead,
    /// Head of the queue, but the pacing deadline is in the future.
    Until(tokio::time::Instant),
    /// Not at the head yet; wait for a wakeup.
    Turn,
}
