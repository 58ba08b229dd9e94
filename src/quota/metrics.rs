//! Lock-free tracker counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// Counters updated by the tracker loop and readable from any thread.
#[derive(Debug, Default)]
pub struct TrackerMetrics {
    /// Resolve passes started.
    pub passes: AtomicU64,
    /// Threshold registrations installed.
    pub rearms: AtomicU64,
    /// Passes that found the armed registration still current.
    pub skipped_rearms: AtomicU64,
    /// Threshold callbacks ignored because their token was superseded.
    pub stale_callbacks: AtomicU64,
    /// Passes aborted by a configuration error.
    pub failed_resolutions: AtomicU64,
    /// Collaborator calls that failed and were recovered from.
    pub collaborator_failures: AtomicU64,
}

/// Point-in-time copy of [`TrackerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub passes: u64,
    pub rearms: u64,
    pub skipped_rearms: u64,
    pub stale_callbacks: u64,
    pub failed_resolutions: u64,
    pub collaborator_failures: u64,
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            rearms: self.rearms.load(Ordering::Relaxed),
            skipped_rearms: self.skipped_rearms.load(Ordering::Relaxed),
            stale_callbacks: self.stale_callbacks.load(Ordering::Relaxed),
            failed_resolutions: self.failed_resolutions.load(Ordering::Relaxed),
            collaborator_failures: self.collaborator_failures.load(Ordering::Relaxed),
        }
    }

    /// Emit current counters as a structured log line.
    pub fn emit_summary(&self, reason: &str) {
        let s = self.snapshot();
        info!(
            event = "tracker_summary",
            reason = reason,
            passes = s.passes,
            rearms = s.rearms,
            skipped_rearms = s.skipped_rearms,
            stale_callbacks = s.stale_callbacks,
            failed_resolutions = s.failed_resolutions,
            collaborator_failures = s.collaborator_failures,
            "Tracker metrics"
        );
    }
}
