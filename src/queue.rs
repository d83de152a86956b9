//! Durable work queue over the shared SQLite database.
//!
//! Delivery contract: at-least-once, FIFO per channel for eligible tasks,
//! no ordering guarantee across consumers. A claim holds a lease
//! (`lease_expires_at`); tasks whose lease expires without an ack are
//! redelivered to the next caller. A task is gone only after an explicit
//! `ack`; failed attempts are rescheduled with exponential backoff until
//! the attempt budget is spent, then buried in the dead state.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::config::QueueConfig;
use crate::db::{DbHandle, PipelineDb};
use crate::errors::QueueError;
use crate::models::{TaskRecord, TaskState};

/// Backoff delay for a retry after `attempts` deliveries:
/// `min(base * 2^(attempts-1), cap)` seconds.
pub fn backoff_secs(attempts: i64, base: u64, cap: u64) -> u64 {
    let exp = attempts.saturating_sub(1).clamp(0, 62) as u32;
    base.saturating_mul(2u64.saturating_pow(exp)).min(cap)
}

impl PipelineDb {
    pub fn enqueue_task(&self, channel: &str, error_event_id: i64) -> Result<TaskRecord> {
        let now = Utc::now().timestamp();
        self.conn()
            .execute(
                "INSERT INTO tasks (channel, error_event_id, state, next_eligible_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                params![channel, error_event_id, now],
            )
            .context("Failed to insert task")?;
        let id = self.conn().last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        self.conn()
            .query_row(
                "SELECT id, channel, error_event_id, state, attempts, next_eligible_at,
                        lease_expires_at, locked_by, last_error, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
            .context("Failed to query task")
    }

    /// Claim the oldest eligible task on `channel`: a pending task whose
    /// `next_eligible_at` has elapsed, or an in-flight task whose lease
    /// expired (crash redelivery). Claiming increments the attempt
    /// counter and stamps the caller's lease. The `DbHandle` mutex makes
    /// the select-then-update atomic.
    pub fn claim_task(
        &self,
        channel: &str,
        worker_id: &str,
        visibility_timeout_secs: u64,
    ) -> Result<Option<TaskRecord>> {
        let now = Utc::now().timestamp();
        let candidate: Option<i64> = self
            .conn()
            .query_row(
                "SELECT id FROM tasks
                 WHERE channel = ?1
                   AND ((state = 'pending' AND next_eligible_at <= ?2)
                     OR (state = 'in_flight' AND lease_expires_at IS NOT NULL
                         AND lease_expires_at <= ?2))
                 ORDER BY id
                 LIMIT 1",
                params![channel, now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to select claimable task")?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let lease = now + visibility_timeout_secs as i64;
        self.conn()
            .execute(
                "UPDATE tasks
                 SET state = 'in_flight', attempts = attempts + 1,
                     lease_expires_at = ?1, locked_by = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![lease, worker_id, id],
            )
            .context("Failed to claim task")?;
        Ok(Some(
            self.get_task(id)?.context("Task vanished during claim")?,
        ))
    }

    /// Refresh the caller's lease on an in-flight task. Errors if the
    /// lease is no longer held by `worker_id`.
    pub fn extend_task_lease(
        &self,
        id: i64,
        worker_id: &str,
        visibility_timeout_secs: u64,
    ) -> Result<()> {
        let lease = Utc::now().timestamp() + visibility_timeout_secs as i64;
        let touched = self
            .conn()
            .execute(
                "UPDATE tasks SET lease_expires_at = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND state = 'in_flight' AND locked_by = ?3",
                params![lease, id, worker_id],
            )
            .context("Failed to extend lease")?;
        if touched == 0 {
            return Err(QueueError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Acknowledge completion (success or idempotent no-op): the task row
    /// is removed.
    pub fn ack_task(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to ack task")?;
        Ok(())
    }

    /// Record a failed attempt. Below the attempt budget the task goes
    /// back to pending with backoff; at the budget it is buried dead.
    /// Returns the resulting state.
    pub fn retry_or_bury_task(
        &self,
        id: i64,
        error: &str,
        config: &QueueConfig,
    ) -> Result<TaskState> {
        let task = self
            .get_task(id)?
            .ok_or(QueueError::TaskNotFound { id })?;
        if task.attempts >= config.max_attempts {
            self.conn()
                .execute(
                    "UPDATE tasks
                     SET state = 'dead', lease_expires_at = NULL, locked_by = NULL,
                         last_error = ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![error, id],
                )
                .context("Failed to bury task")?;
            return Ok(TaskState::Dead);
        }

        let delay = backoff_secs(task.attempts, config.backoff_base_secs, config.backoff_cap_secs);
        let eligible = Utc::now().timestamp() + delay as i64;
        self.conn()
            .execute(
                "UPDATE tasks
                 SET state = 'pending', next_eligible_at = ?1, lease_expires_at = NULL,
                     locked_by = NULL, last_error = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![eligible, error, id],
            )
            .context("Failed to reschedule task")?;
        Ok(TaskState::Pending)
    }

    /// Pending + in-flight tasks on a channel.
    pub fn queue_depth(&self, channel: &str) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE channel = ?1 AND state != 'dead'",
                params![channel],
                |row| row.get(0),
            )
            .context("Failed to count queue depth")
    }

    pub fn dead_count(&self, channel: &str) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE channel = ?1 AND state = 'dead'",
                params![channel],
                |row| row.get(0),
            )
            .context("Failed to count dead tasks")
    }

    pub fn list_dead_tasks(&self, channel: &str) -> Result<Vec<TaskRecord>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT id, channel, error_event_id, state, attempts, next_eligible_at,
                        lease_expires_at, locked_by, last_error, created_at, updated_at
                 FROM tasks WHERE channel = ?1 AND state = 'dead' ORDER BY id",
            )
            .context("Failed to prepare list_dead_tasks")?;
        let rows = stmt
            .query_map(params![channel], row_to_task)
            .context("Failed to query dead tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }
        Ok(tasks)
    }

    /// Manual reprocessing: dead tasks return to pending with a fresh
    /// attempt budget. Returns how many were requeued.
    pub fn requeue_dead_tasks(&self, channel: &str) -> Result<usize> {
        let now = Utc::now().timestamp();
        let touched = self
            .conn()
            .execute(
                "UPDATE tasks
                 SET state = 'pending', attempts = 0, next_eligible_at = ?1,
                     lease_expires_at = NULL, locked_by = NULL, last_error = NULL,
                     updated_at = datetime('now')
                 WHERE channel = ?2 AND state = 'dead'",
                params![now, channel],
            )
            .context("Failed to requeue dead tasks")?;
        Ok(touched)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state_raw: String = row.get(3)?;
    let state = state_raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(TaskRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        error_event_id: row.get(2)?,
        state,
        attempts: row.get(4)?,
        next_eligible_at: row.get(5)?,
        lease_expires_at: row.get(6)?,
        locked_by: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Async facade over the task table for producers and workers.
#[derive(Clone)]
pub struct TaskQueue {
    db: DbHandle,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(db: DbHandle, config: QueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, channel: &str, error_event_id: i64) -> Result<TaskRecord> {
        let channel = channel.to_string();
        self.db
            .call(move |db| db.enqueue_task(&channel, error_event_id))
            .await
    }

    /// Single non-blocking claim attempt. Workers poll this in their pull
    /// loop; `None` means no eligible task right now.
    pub async fn dequeue(&self, channel: &str, worker_id: &str) -> Result<Option<TaskRecord>> {
        let channel = channel.to_string();
        let worker_id = worker_id.to_string();
        let visibility = self.config.visibility_timeout_secs;
        self.db
            .call(move |db| db.claim_task(&channel, &worker_id, visibility))
            .await
    }

    pub async fn extend_lease(&self, task_id: i64, worker_id: &str) -> Result<()> {
        let worker_id = worker_id.to_string();
        let visibility = self.config.visibility_timeout_secs;
        self.db
            .call(move |db| db.extend_task_lease(task_id, &worker_id, visibility))
            .await
    }

    pub async fn ack(&self, task_id: i64) -> Result<()> {
        self.db.call(move |db| db.ack_task(task_id)).await
    }

    pub async fn retry_or_bury(&self, task_id: i64, error: String) -> Result<TaskState> {
        let config = self.config.clone();
        self.db
            .call(move |db| db.retry_or_bury_task(task_id, &error, &config))
            .await
    }

    pub async fn depth(&self, channel: &str) -> Result<i64> {
        let channel = channel.to_string();
        self.db.call(move |db| db.queue_depth(&channel)).await
    }

    pub async fn dead_count(&self, channel: &str) -> Result<i64> {
        let channel = channel.to_string();
        self.db.call(move |db| db.dead_count(&channel)).await
    }

    pub async fn requeue_dead(&self, channel: &str) -> Result<usize> {
        let channel = channel.to_string();
        self.db.call(move |db| db.requeue_dead_tasks(&channel)).await
    }
}
