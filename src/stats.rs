use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-device traffic counters. Updated from the transmit path and the receive poll cycle
/// without locking.
#[derive(Debug)]
pub struct Stats {
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    t0: Instant,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            tx_frames: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            t0: Instant::now(),
        }
    }

    pub fn inc_tx(&self, bytes: usize) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx(&self, bytes: usize) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, tag: &str) {
        let s = self.snapshot();
        let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
        log::info!(
            "[{}] tx={} ({} B, {} dropped) rx={} ({} B, {} dropped) over {:.1}s => {:.0} frames/s",
            tag,
            s.tx_frames,
            s.tx_bytes,
            s.tx_dropped,
            s.rx_frames,
            s.rx_bytes,
            s.rx_dropped,
            dur,
            (s.tx_frames + s.rx_frames) as f64 / dur
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.inc_tx(8);
        stats.inc_tx(64);
        stats.inc_tx_dropped();
        stats.inc_rx(3);
        stats.inc_rx_dropped();
        stats.inc_rx_dropped();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                tx_frames: 2,
                tx_bytes: 72,
                tx_dropped: 1,
                rx_frames: 1,
                rx_bytes: 3,
                rx_dropped: 2,
            }
        );
    }
}
