//! Relay engine: moves messages between pub/sub channels and module sets.
//!
//! ```text
//!   source channel ──► InboundRelay ──► <m>in ──► workers ──► <m>out ──► OutboundRelay ──► destinations
//!                           │             ▲
//!                           ▼             │
//!                      <m>in_delayed ── DelayedScheduler
//! ```
//!
//! - **InboundRelay**: subscribes to a module's source channel and stores
//!   each message in the ready set, or in the delayed set when `run_at` is in
//!   the future
//! - **DelayedScheduler**: promotes due delayed messages into the ready set
//! - **OutboundRelay**: drains the result set and publishes each message to
//!   every destination channel
//!
//! Each relay runs as its own OS process under the supervisor and talks to
//! the others only through the broker.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod inbound;
pub mod outbound;
pub mod scheduler;

pub use inbound::{InboundRelay, Ingested};
pub use outbound::{Destination, OutboundExit, OutboundRelay};
pub use scheduler::DelayedScheduler;

/// Counters of one relay process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages inserted straight into the ready set.
    pub ready: u64,
    /// Messages parked in the delayed set.
    pub delayed: u64,
    /// Messages moved from the delayed set to the ready set.
    pub promoted: u64,
    /// Malformed payloads dropped at ingestion.
    pub dropped: u64,
    /// Messages fanned out to destinations.
    pub relayed: u64,
}

#[derive(Default)]
pub(crate) struct SharedRelayStats {
    ready: AtomicU64,
    delayed: AtomicU64,
    promoted: AtomicU64,
    dropped: AtomicU64,
    relayed: AtomicU64,
}

impl SharedRelayStats {
    pub(crate) fn record_ready(&self) {
        self.ready.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delayed(&self) {
        self.delayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_promoted(&self, count: usize) {
        self.promoted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            ready: self.ready.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_relay_stats() {
        let stats = SharedRelayStats::default();
        stats.record_ready();
        stats.record_ready();
        stats.record_delayed();
        stats.record_promoted(3);
        stats.record_dropped();

        assert_eq!(
            stats.snapshot(),
            RelayStats {
                ready: 2,
                delayed: 1,
                promoted: 3,
                dropped: 1,
                relayed: 0,
            }
        );
    }
}
