//! Diagnostic counters.
//!
//! Per-frame failures never unwind across component boundaries; they are
//! absorbed where detected and show up here instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Traffic and drop counters for one link layer instance. All counters are
/// monotonic; relaxed ordering is fine for diagnostics.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Frames popped from the inbound queue by the dispatcher.
    pub rx_frames: AtomicU64,
    /// Frames written out through a device.
    pub tx_frames: AtomicU64,
    /// Payloads handed to the layer above.
    pub delivered: AtomicU64,
    /// Dispatch misses: no handler for the frame's protocol id.
    pub dropped_no_protocol: AtomicU64,
    /// Routing misses.
    pub dropped_no_route: AtomicU64,
    /// Frames discarded when a neighbor entry exhausted its retries.
    pub dropped_resolution: AtomicU64,
    /// Oldest-frame drops from a full pending queue.
    pub dropped_pending_overflow: AtomicU64,
    /// Frames a device produced that did not parse.
    pub dropped_malformed: AtomicU64,
    /// Frames with no resolver registered for their address family.
    pub dropped_no_resolver: AtomicU64,
}

/// Point-in-time copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub delivered: u64,
    pub dropped_no_protocol: u64,
    pub dropped_no_route: u64,
    pub dropped_resolution: u64,
    pub dropped_pending_overflow: u64,
    pub dropped_malformed: u64,
    pub dropped_no_resolver: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_no_protocol: self.dropped_no_protocol.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            dropped_resolution: self.dropped_resolution.load(Ordering::Relaxed),
            dropped_pending_overflow: self.dropped_pending_overflow.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_no_resolver: self.dropped_no_resolver.load(Ordering::Relaxed),
        }
    }
}
