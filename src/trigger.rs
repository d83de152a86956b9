//! Trigger policy: decides whether a newly stored error event warrants
//! AI analysis and enqueues the task if so.
//!
//! The enqueue is fire-and-forget: it must never block or fail the
//! ingestion path. Enqueue failures are logged and swallowed. No
//! deduplication happens here; duplicate-delivery protection is the
//! worker's idempotency check plus the analysis uniqueness constraint.

use tracing::{debug, info, warn};

use crate::config::ANALYSIS_CHANNEL;
use crate::models::ErrorEvent;
use crate::queue::TaskQueue;

/// Minimum status code that warrants analysis. Server-side failures only.
pub const ANALYSIS_STATUS_THRESHOLD: i64 = 500;

pub struct TriggerPolicy {
    queue: TaskQueue,
}

impl TriggerPolicy {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }

    /// Pure decision: analyze iff the event carries a status code at or
    /// above the threshold.
    pub fn decide(event: &ErrorEvent) -> bool {
        matches!(event.status_code, Some(status) if status >= ANALYSIS_STATUS_THRESHOLD)
    }

    /// Called by the ingestion path after an event is stored. Infallible
    /// from the caller's point of view.
    pub async fn on_error_stored(&self, event: &ErrorEvent) {
        if !Self::decide(event) {
            debug!(event_id = event.id, status = ?event.status_code, "event below analysis threshold");
            return;
        }
        match self.queue.enqueue(ANALYSIS_CHANNEL, event.id).await {
            Ok(task) => {
                info!(event_id = event.id, task_id = task.id, "enqueued analysis task");
            }
            Err(e) => {
                // The event itself is already stored; analysis is best-effort.
                warn!(event_id = event.id, error = %e, "failed to enqueue analysis task");
            }
        }
    }
}
