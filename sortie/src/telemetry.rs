//! Tracing spans and outcome recording for dispatch, lease, and teardown.
//!
//! Every helper logs through `tracing`; with the `metrics` feature enabled the
//! same calls also update the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use sortie::telemetry::{item_span, record_item_outcome};
//!
//! let span = item_span(0, 3, "alice");
//! let _enter = span.enter();
//! // ... run the item
//! record_item_outcome("alice", "confirmed", elapsed);
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};

/// Span covering one worker's whole batch.
#[must_use]
pub fn worker_span(worker_index: usize, batch_len: usize) -> Span {
    info_span!(
        "sortie.worker",
        worker = worker_index,
        batch_len = batch_len,
    )
}

/// Span covering one work item inside a worker.
#[must_use]
pub fn item_span(worker_index: usize, item_index: usize, identity: impl AsRef<str>) -> Span {
    info_span!(
        "sortie.item",
        worker = worker_index,
        item = item_index,
        identity = %identity.as_ref(),
    )
}

/// Span for a lease operation (acquire, verify, release).
#[must_use]
pub fn lease_span(operation: &'static str, owner: impl AsRef<str>) -> Span {
    info_span!(
        "sortie.lease",
        operation = operation,
        owner = %owner.as_ref(),
    )
}

/// Span for tearing down a worker's storage.
#[must_use]
pub fn teardown_span(worker_index: usize, path: &std::path::Path) -> Span {
    info_span!(
        "sortie.teardown",
        worker = worker_index,
        path = %path.display(),
    )
}

/// Record a terminal item outcome.
pub fn record_item_outcome(identity: impl AsRef<str>, status: impl AsRef<str>, elapsed: Duration) {
    tracing::info!(
        identity = %identity.as_ref(),
        status = %status.as_ref(),
        elapsed_ms = elapsed.as_millis() as u64,
        "item finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_item(status.as_ref(), elapsed.as_secs_f64());
}

/// Record the result of a teardown.
pub fn record_teardown(path: &std::path::Path, attempts: u32, removed: bool) {
    if removed {
        tracing::debug!(path = %path.display(), attempts, "worker storage removed");
    } else {
        tracing::error!(path = %path.display(), attempts, "worker storage left behind");
    }

    #[cfg(feature = "metrics")]
    if !removed {
        crate::metrics::record_teardown_failure();
    }
}

/// Record the cached lease validity.
pub fn record_lease_validity(valid: bool) {
    tracing::debug!(valid, "lease validity updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_lease_valid(valid);
}

/// Record whether an error report reached the collector.
pub fn record_error_report(delivered: bool) {
    tracing::trace!(delivered, "error report attempted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_error_report(if delivered { "delivered" } else { "dropped" });
}

/// Start a timer for an item.
pub fn start_item_timer() -> ItemTimer {
    ItemTimer {
        start: Instant::now(),
    }
}

/// Elapsed-time tracker for a single item.
#[derive(Debug, Clone, Copy)]
pub struct ItemTimer {
    start: Instant,
}

impl ItemTimer {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
