//! Metrics collection for swap monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Swap node metrics.
pub struct SwapMetrics {
    /// Requests created by this node as buyer.
    pub requests_created: AtomicU64,
    /// Requests approved by this node as seller.
    pub requests_approved: AtomicU64,
    /// Requests denied by this node as seller.
    pub requests_denied: AtomicU64,
    /// Swap flows started (either role).
    pub swaps_started: AtomicU64,
    /// Flows that ended with the escrow released.
    pub swaps_settled: AtomicU64,
    /// Flows that ended with the escrow reverted.
    pub swaps_reverted: AtomicU64,
    /// Flows aborted before value moved.
    pub swaps_aborted: AtomicU64,
    /// Flows in progress.
    pub swaps_active: AtomicU64,
    /// Escrow transactions committed.
    pub escrows_committed: AtomicU64,
    /// Locks neither released nor reverted.
    pub locks_active: AtomicU64,
    /// Total messages sent.
    pub messages_sent: AtomicU64,
    /// Total messages received.
    pub messages_received: AtomicU64,
}

impl SwapMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            requests_created: AtomicU64::new(0),
            requests_approved: AtomicU64::new(0),
            requests_denied: AtomicU64::new(0),
            swaps_started: AtomicU64::new(0),
            swaps_settled: AtomicU64::new(0),
            swaps_reverted: AtomicU64::new(0),
            swaps_aborted: AtomicU64::new(0),
            swaps_active: AtomicU64::new(0),
            escrows_committed: AtomicU64::new(0),
            locks_active: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn request_created(&self) {
        self.requests_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_decided(&self, approved: bool) {
        if approved {
            self.requests_approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment swap started.
    pub fn swap_started(&self) {
        self.swaps_started.fetch_add(1, Ordering::Relaxed);
        self.swaps_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swap_settled(&self) {
        self.swaps_settled.fetch_add(1, Ordering::Relaxed);
        self.swaps_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn swap_reverted(&self) {
        self.swaps_reverted.fetch_add(1, Ordering::Relaxed);
        self.swaps_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn swap_aborted(&self) {
        self.swaps_aborted.fetch_add(1, Ordering::Relaxed);
        self.swaps_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Flow stopped without reaching an outcome (e.g. session lost).
    pub fn swap_interrupted(&self) {
        self.swaps_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record escrow committed and its lock opened.
    pub fn escrow_committed(&self) {
        self.escrows_committed.fetch_add(1, Ordering::Relaxed);
        self.locks_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record lock released or reverted.
    pub fn lock_closed(&self) {
        self.locks_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> SwapMetricsSnapshot {
        SwapMetricsSnapshot {
            requests_created: self.requests_created.load(Ordering::Relaxed),
            requests_approved: self.requests_approved.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            swaps_started: self.swaps_started.load(Ordering::Relaxed),
            swaps_settled: self.swaps_settled.load(Ordering::Relaxed),
            swaps_reverted: self.swaps_reverted.load(Ordering::Relaxed),
            swaps_aborted: self.swaps_aborted.load(Ordering::Relaxed),
            swaps_active: self.swaps_active.load(Ordering::Relaxed),
            escrows_committed: self.escrows_committed.load(Ordering::Relaxed),
            locks_active: self.locks_active.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP crossnotary_requests_created Total exchange requests created
# TYPE crossnotary_requests_created counter
crossnotary_requests_created {}

# HELP crossnotary_requests_approved Total exchange requests approved
# TYPE crossnotary_requests_approved counter
crossnotary_requests_approved {}

# HELP crossnotary_requests_denied Total exchange requests denied
# TYPE crossnotary_requests_denied counter
crossnotary_requests_denied {}

# HELP crossnotary_swaps_started Total swap flows started
# TYPE crossnotary_swaps_started counter
crossnotary_swaps_started {}

# HELP crossnotary_swaps_settled Total swaps settled
# TYPE crossnotary_swaps_settled counter
crossnotary_swaps_settled {}

# HELP crossnotary_swaps_reverted Total swaps reverted after the deadline
# TYPE crossnotary_swaps_reverted counter
crossnotary_swaps_reverted {}

# HELP crossnotary_swaps_aborted Total swaps aborted before escrow
# TYPE crossnotary_swaps_aborted counter
crossnotary_swaps_aborted {}

# HELP crossnotary_swaps_active Current swap flows in progress
# TYPE crossnotary_swaps_active gauge
crossnotary_swaps_active {}

# HELP crossnotary_escrows_committed Total escrow transactions committed
# TYPE crossnotary_escrows_committed counter
crossnotary_escrows_committed {}

# HELP crossnotary_locks_active Current open escrow locks
# TYPE crossnotary_locks_active gauge
crossnotary_locks_active {}

# HELP crossnotary_messages_sent Total session messages sent
# TYPE crossnotary_messages_sent counter
crossnotary_messages_sent {}

# HELP crossnotary_messages_received Total session messages received
# TYPE crossnotary_messages_received counter
crossnotary_messages_received {}
"#,
            snapshot.requests_created,
            snapshot.requests_approved,
            snapshot.requests_denied,
            snapshot.swaps_started,
            snapshot.swaps_settled,
            snapshot.swaps_reverted,
            snapshot.swaps_aborted,
            snapshot.swaps_active,
            snapshot.escrows_committed,
            snapshot.locks_active,
            snapshot.messages_sent,
            snapshot.messages_received,
        )
    }
}

impl Default for SwapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapMetricsSnapshot {
    pub requests_created: u64,
    pub requests_approved: u64,
    pub requests_denied: u64,
    pub swaps_started: u64,
    pub swaps_settled: u64,
    pub swaps_reverted: u64,
    pub swaps_aborted: u64,
    pub swaps_active: u64,
    pub escrows_committed: u64,
    pub locks_active: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<SwapMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_lifecycle_counters() {
        let metrics = SwapMetrics::new();

        metrics.swap_started();
        metrics.escrow_committed();
        assert_eq!(metrics.snapshot().swaps_active, 1);
        assert_eq!(metrics.snapshot().locks_active, 1);

        metrics.lock_closed();
        metrics.swap_settled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.swaps_started, 1);
        assert_eq!(snapshot.swaps_settled, 1);
        assert_eq!(snapshot.swaps_active, 0);
        assert_eq!(snapshot.locks_active, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = SwapMetrics::new();
        metrics.request_created();
        metrics.request_decided(false);

        let output = metrics.to_prometheus();
        assert!(output.contains("crossnotary_requests_created 1"));
        assert!(output.contains("crossnotary_requests_denied 1"));
        assert!(output.contains("# TYPE crossnotary_locks_active gauge"));
    }
}
