//! Per-binding dispatch counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for one consumer binding, cumulative across reconnects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages read off the stream.
    pub received: usize,
    /// Callbacks that returned `Ok`.
    pub handled: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
    /// Bodies that were not a decodable envelope.
    pub decode_failed: usize,
    /// Envelopes that decoded but failed validation.
    pub invalid: usize,
    /// Consumer streams opened (one per session, more if a stream was reopened).
    pub streams_opened: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) received: AtomicUsize,
    pub(crate) handled: AtomicUsize,
    pub(crate) failed: AtomicUsize,
    pub(crate) decode_failed: AtomicUsize,
    pub(crate) invalid: AtomicUsize,
    pub(crate) streams_opened: AtomicUsize,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
        }
    }
}
