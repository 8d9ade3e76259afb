//! Per-adapter metrics.
//!
//! Every read/write/frame/drop event bumps a named counter synchronously on
//! the loop thread. Once per second the session loop calls [`Metrics::flush`],
//! which finalizes derived averages, emits the snapshot, and resets every
//! metric to its baseline. Rate-limit flags piggyback on the same cycle so
//! congestion warnings fire at most once per interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of one metrics interval, emitted at flush time.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub rx_bytes: u64,
    pub rx_frames: u64,
    pub tx_bytes: u64,
    pub tx_frames: u64,
    pub dropped_bytes: u64,
    pub rejected_frames: u64,
    pub session_restarts: u64,
    /// Last observed TTY output-queue depth (gauge).
    pub outq_pending: u64,
    /// Mean accepted-frame length over the interval, derived at flush.
    pub avg_frame_len: f64,
}

/// Adapter metrics table. All counters are only touched from the loop
/// thread (atomics keep the CAN worker threads honest where they report
/// drops directly).
pub struct Metrics {
    name: String,

    rx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    tx_frames: AtomicU64,
    dropped_bytes: AtomicU64,
    rejected_frames: AtomicU64,
    session_restarts: AtomicU64,
    outq_pending: AtomicU64,

    // sum/count pair behind the derived average
    frame_len_sum: AtomicU64,
    frame_len_count: AtomicU64,

    // "already warned this interval" flags
    outq_warned: AtomicBool,
    congestion_warned: AtomicBool,
}

impl Metrics {
    /// Create a metrics table for the adapter `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rx_bytes: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            rejected_frames: AtomicU64::new(0),
            session_restarts: AtomicU64::new(0),
            outq_pending: AtomicU64::new(0),
            frame_len_sum: AtomicU64::new(0),
            frame_len_count: AtomicU64::new(0),
            outq_warned: AtomicBool::new(false),
            congestion_warned: AtomicBool::new(false),
        }
    }

    /// Adapter identity the table was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw bytes read from a source.
    pub fn record_read(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A frame arrived from a source (bus message or framed read).
    pub fn record_rx_frame(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// An accepted frame of `len` bytes was delivered to a sink.
    pub fn record_tx_frame(&self, len: usize) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.frame_len_sum.fetch_add(len as u64, Ordering::Relaxed);
        self.frame_len_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivered prefix of a partially written frame; the frame itself is
    /// not counted as transmitted.
    pub fn record_tx_bytes(&self, n: usize) {
        self.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// `n` bytes were dropped under congestion or backpressure.
    pub fn record_dropped(&self, n: usize) {
        self.dropped_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A frame was rejected by the filter.
    pub fn record_rejected(&self) {
        self.rejected_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A transport session ended and will be restarted.
    pub fn record_restart(&self) {
        self.session_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Latest observed TTY output-queue depth.
    pub fn set_outq_pending(&self, n: usize) {
        self.outq_pending.store(n as u64, Ordering::Relaxed);
    }

    /// Returns true exactly once per interval: the caller owns the warning.
    pub fn claim_outq_warning(&self) -> bool {
        !self.outq_warned.swap(true, Ordering::Relaxed)
    }

    /// Returns true exactly once per interval for congestion-drop warnings.
    pub fn claim_congestion_warning(&self) -> bool {
        !self.congestion_warned.swap(true, Ordering::Relaxed)
    }

    /// Current dropped-bytes total (test hook).
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }

    /// Build the snapshot for the current interval without resetting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sum = self.frame_len_sum.load(Ordering::Relaxed);
        let count = self.frame_len_count.load(Ordering::Relaxed);
        MetricsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            session_restarts: self.session_restarts.load(Ordering::Relaxed),
            outq_pending: self.outq_pending.load(Ordering::Relaxed),
            avg_frame_len: if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            },
        }
    }

    /// Finalize averages, emit the snapshot, reset everything to baseline.
    pub fn flush(&self) -> MetricsSnapshot {
        let snap = self.snapshot();
        match serde_json::to_string(&snap) {
            Ok(json) => {
                tracing::info!(target: "epad::metrics", "{} {}", self.name, json)
            }
            Err(e) => tracing::warn!("metrics serialization failed: {}", e),
        }
        self.reset();
        snap
    }

    /// Reset counters to baseline (0) and warning flags to "not yet warned".
    pub fn reset(&self) {
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_frames.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_frames.store(0, Ordering::Relaxed);
        self.dropped_bytes.store(0, Ordering::Relaxed);
        self.rejected_frames.store(0, Ordering::Relaxed);
        self.session_restarts.store(0, Ordering::Relaxed);
        self.outq_pending.store(0, Ordering::Relaxed);
        self.frame_len_sum.store(0, Ordering::Relaxed);
        self.frame_len_count.store(0, Ordering::Relaxed);
        self.outq_warned.store(false, Ordering::Relaxed);
        self.congestion_warned.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new("t");
        m.record_read(100);
        m.record_rx_frame();
        m.record_tx_frame(8);
        m.record_tx_frame(16);
        m.record_dropped(4);

        let snap = m.snapshot();
        assert_eq!(snap.rx_bytes, 100);
        assert_eq!(snap.rx_frames, 1);
        assert_eq!(snap.tx_frames, 2);
        assert_eq!(snap.tx_bytes, 24);
        assert_eq!(snap.dropped_bytes, 4);
        assert_eq!(snap.avg_frame_len, 12.0);
    }

    #[test]
    fn test_flush_resets_to_baseline() {
        let m = Metrics::new("t");
        m.record_read(10);
        m.record_tx_frame(10);
        assert!(m.claim_outq_warning());
        m.flush();

        let snap = m.snapshot();
        assert_eq!(snap.rx_bytes, 0);
        assert_eq!(snap.tx_frames, 0);
        assert_eq!(snap.avg_frame_len, 0.0);
        // warning flag came back after the flush
        assert!(m.claim_outq_warning());
    }

    #[test]
    fn test_warning_claimed_once_per_interval() {
        let m = Metrics::new("t");
        assert!(m.claim_congestion_warning());
        assert!(!m.claim_congestion_warning());
        m.reset();
        assert!(m.claim_congestion_warning());
    }
}
