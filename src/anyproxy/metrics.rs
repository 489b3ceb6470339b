//! Atomic counters for the tunnel core.
//!
//! Per the concurrency model, metrics never share the structural locks that
//! protect the connection manager / group registry / port-forward tables —
//! they are incremented off the hot path with plain atomics. This module
//! intentionally stops at a `snapshot()`; wiring it to a scrape endpoint or a
//! dashboard is the monitoring aggregator's job, which is out of scope here.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub lcs_opened: AtomicU64,
    pub lcs_closed: AtomicU64,
    pub queue_overflow_closes: AtomicU64,
    pub dial_failures: AtomicU64,
    pub tunnels_connected: AtomicU64,
    pub tunnels_disconnected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub lcs_opened: u64,
    pub lcs_closed: u64,
    pub queue_overflow_closes: u64,
    pub dial_failures: u64,
    pub tunnels_connected: u64,
    pub tunnels_disconnected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lcs_opened(&self) {
        self.lcs_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lcs_closed(&self) {
        self.lcs_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_overflow_closes(&self) {
        self.queue_overflow_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dial_failures(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tunnels_connected(&self) {
        self.tunnels_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tunnels_disconnected(&self) {
        self.tunnels_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            lcs_opened: self.lcs_opened.load(Ordering::Relaxed),
            lcs_closed: self.lcs_closed.load(Ordering::Relaxed),
            queue_overflow_closes: self.queue_overflow_closes.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            tunnels_connected: self.tunnels_connected.load(Ordering::Relaxed),
            tunnels_disconnected: self.tunnels_disconnected.load(Ordering::Relaxed),
        }
    }
}
