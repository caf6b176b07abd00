//! Per-session loop counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters written only by one session's loop task.
#[derive(Default)]
pub struct SessionMetrics {
    pub frames_decoded: AtomicU64,
    pub samples: AtomicU64,
    pub updates_sent: AtomicU64,
    pub analyzer_failures: AtomicU64,
    pub send_failures: AtomicU64,
    pub loop_faults: AtomicU64,
    pub rewinds: AtomicU64,
    pub total_analysis_ms: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_frame(&self, frame_index: u64) {
        let previous = self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        if frame_index == 0 && previous > 0 {
            self.rewinds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_analysis(&self, success: bool, latency_ms: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.analyzer_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_analysis_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_send(&self, success: bool) {
        if success {
            self.updates_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fault(&self) {
        self.loop_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.samples.load(Ordering::Relaxed);
        let total_ms = self.total_analysis_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            samples,
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            analyzer_failures: self.analyzer_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            loop_faults: self.loop_faults.load(Ordering::Relaxed),
            rewinds: self.rewinds.load(Ordering::Relaxed),
            avg_analysis_ms: if samples > 0 { total_ms / samples } else { 0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_decoded: u64,
    pub samples: u64,
    pub updates_sent: u64,
    pub analyzer_failures: u64,
    pub send_failures: u64,
    pub loop_faults: u64,
    pub rewinds: u64,
    pub avg_analysis_ms: u64,
}

/// Timer for tracking analysis latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
