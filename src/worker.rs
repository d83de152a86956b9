//! Worker pool executing the analysis workflow.
//!
//! Each worker runs an independent pull loop: dequeue -> process ->
//! acknowledge-or-retry. Workers share no state beyond the queue and the
//! database; two workers racing the same event are reconciled by the
//! analysis uniqueness constraint, never by in-memory coordination.
//!
//! Per-attempt execution budget: a soft deadline (workflow aborts
//! voluntarily and raises a retryable failure) inside a hard deadline
//! (the attempt future is cancelled outright). Both land the task back in
//! the retry state machine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ANALYSIS_CHANNEL, FetcherConfig, WorkerConfig};
use crate::db::DbHandle;
use crate::engine::{AnalysisEngine, AnalysisRequest};
use crate::errors::WorkflowError;
use crate::models::{Snippet, TaskRecord, TaskState};
use crate::queue::TaskQueue;
use crate::source::SnippetFetcher;
use crate::stacktrace::{parse_stack_trace, repo_relative_path};
use crate::trigger::TriggerPolicy;

/// How a delivered task was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// An analysis was produced and persisted.
    Analyzed,
    /// An analysis already existed (duplicate delivery or lost insert
    /// race); acknowledged without work.
    AlreadyAnalyzed,
    /// The event no longer meets the trigger threshold; acknowledged.
    BelowThreshold,
    /// The referenced event does not exist (stale task); acknowledged.
    EventMissing,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Completed(TaskOutcome),
    /// The attempt failed; the task was rescheduled (`Pending`) or buried
    /// (`Dead`).
    Failed(TaskState),
}

/// A single pull-loop worker.
pub struct PipelineWorker {
    id: String,
    db: DbHandle,
    queue: TaskQueue,
    fetcher: Arc<dyn SnippetFetcher>,
    engine: Arc<dyn AnalysisEngine>,
    config: WorkerConfig,
    fetcher_config: FetcherConfig,
}

impl PipelineWorker {
    pub fn new(
        db: DbHandle,
        queue: TaskQueue,
        fetcher: Arc<dyn SnippetFetcher>,
        engine: Arc<dyn AnalysisEngine>,
        config: WorkerConfig,
        fetcher_config: FetcherConfig,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            db,
            queue,
            fetcher,
            engine,
            config,
            fetcher_config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and fully process at most one task. `None` means the queue
    /// had nothing eligible.
    pub async fn run_once(&self) -> Result<Option<AttemptResult>> {
        let Some(task) = self.queue.dequeue(ANALYSIS_CHANNEL, &self.id).await? else {
            return Ok(None);
        };
        Ok(Some(self.handle_task(&task).await))
    }

    /// Pull loop: runs until the shutdown signal flips. In-flight work is
    /// finished before the loop exits.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.queue.config().poll_interval_ms);
        info!(worker = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(result)) => {
                    debug!(worker = %self.id, ?result, "task attempt finished");
                }
                Ok(None) => {
                    // Idle: wait out the poll interval unless shutdown fires.
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "queue error in pull loop");
                    tokio::time::sleep(idle).await;
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Run one attempt under the deadlines, then settle the task with the
    /// broker: no-ops and successes are acknowledged, failures re-enter
    /// the retry state machine.
    async fn handle_task(&self, task: &TaskRecord) -> AttemptResult {
        let soft = Duration::from_secs(self.config.soft_deadline_secs);
        let hard = Duration::from_secs(self.config.hard_deadline_secs);

        let attempt = async {
            match tokio::time::timeout(soft, self.workflow(task)).await {
                Ok(result) => result,
                Err(_) => Err(WorkflowError::SoftDeadline {
                    budget_secs: self.config.soft_deadline_secs,
                }),
            }
        };

        let outcome = match tokio::time::timeout(hard, attempt).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Retryable(anyhow::anyhow!(
                "hard deadline of {}s exceeded, attempt terminated",
                self.config.hard_deadline_secs
            ))),
        };

        match outcome {
            Ok(outcome) => {
                if let Err(e) = self.queue.ack(task.id).await {
                    // The task will be redelivered and resolved as a no-op
                    // by the idempotency check.
                    warn!(task_id = task.id, error = %e, "failed to ack task");
                }
                info!(
                    task_id = task.id,
                    event_id = task.error_event_id,
                    outcome = ?outcome,
                    "task completed"
                );
                AttemptResult::Completed(outcome)
            }
            Err(e) => {
                let reason = format!("{:#}", anyhow::Error::from(e));
                match self.queue.retry_or_bury(task.id, reason.clone()).await {
                    Ok(state) => {
                        warn!(
                            task_id = task.id,
                            event_id = task.error_event_id,
                            attempts = task.attempts,
                            state = %state,
                            error = %reason,
                            "task attempt failed"
                        );
                        AttemptResult::Failed(state)
                    }
                    Err(settle_err) => {
                        // Leave the task leased; the visibility timeout
                        // will redeliver it.
                        error!(task_id = task.id, error = %settle_err, "failed to settle task");
                        AttemptResult::Failed(TaskState::InFlight)
                    }
                }
            }
        }
    }

    /// The analysis workflow: idempotency check, threshold re-check,
    /// stack parse, snippet fetch, engine call, persist. Returns the
    /// outcome to acknowledge, or a retryable error.
    async fn workflow(&self, task: &TaskRecord) -> Result<TaskOutcome, WorkflowError> {
        let event_id = task.error_event_id;

        // Idempotency check first (duplicate delivery), then a defensive
        // threshold re-check for stale tasks.
        let (event, existing) = self
            .db
            .call(move |db| Ok((db.get_event(event_id)?, db.get_analysis(event_id)?)))
            .await
            .map_err(WorkflowError::Retryable)?;
        if existing.is_some() {
            return Ok(TaskOutcome::AlreadyAnalyzed);
        }
        let Some(event) = event else {
            return Ok(TaskOutcome::EventMissing);
        };
        if !TriggerPolicy::decide(&event) {
            return Ok(TaskOutcome::BelowThreshold);
        }

        // Absent or garbled traces yield no frames, never an error.
        let frames = event
            .stack
            .as_deref()
            .map(parse_stack_trace)
            .unwrap_or_default();

        // Resolve repository context and fetch snippets for the innermost
        // frames. Every per-frame failure is absorbed.
        let project_id = event.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(WorkflowError::Retryable)?;
        let repo_config = project.and_then(|p| p.repo_config);

        let mut snippets: Vec<Snippet> = Vec::new();
        if let Some(repo) = &repo_config {
            let candidates = frames
                .iter()
                .filter_map(|f| repo_relative_path(&f.file).map(|path| (path, f.line)))
                .take(self.fetcher_config.max_frames);
            for (path, line) in candidates {
                match self.fetcher.fetch(repo, &path, line).await {
                    Ok(snippet) => snippets.push(snippet),
                    Err(e) => {
                        debug!(event_id, file = %path, error = %e, "snippet fetch skipped");
                    }
                }
            }
        }
        let has_source_code = !snippets.is_empty();

        // The engine call can run long; refresh the lease first so the
        // visibility timeout cannot lapse mid-call.
        if let Err(e) = self.queue.extend_lease(task.id, &self.id).await {
            warn!(task_id = task.id, error = %e, "lease extension failed");
        }
        let request = AnalysisRequest {
            message: event.message.clone(),
            method: event.method.clone(),
            path: event.path.clone(),
            status_code: event.status_code,
            frames,
            snippets,
        };
        let analysis = self.engine.analyze(&request).await?;

        // Persist exactly once. Losing the insert race to another worker
        // is a no-op success, not a failure.
        let inserted = self
            .db
            .call(move |db| db.try_insert_analysis(event_id, &analysis, has_source_code))
            .await
            .map_err(WorkflowError::Retryable)?;
        match inserted {
            Some(_) => Ok(TaskOutcome::Analyzed),
            None => Ok(TaskOutcome::AlreadyAnalyzed),
        }
    }
}

/// Spawns and supervises the configured number of workers.
pub struct WorkerPool {
    db: DbHandle,
    queue: TaskQueue,
    fetcher: Arc<dyn SnippetFetcher>,
    engine: Arc<dyn AnalysisEngine>,
    config: WorkerConfig,
    fetcher_config: FetcherConfig,
}

impl WorkerPool {
    pub fn new(
        db: DbHandle,
        queue: TaskQueue,
        fetcher: Arc<dyn SnippetFetcher>,
        engine: Arc<dyn AnalysisEngine>,
        config: WorkerConfig,
        fetcher_config: FetcherConfig,
    ) -> Self {
        Self {
            db,
            queue,
            fetcher,
            engine,
            config,
            fetcher_config,
        }
    }

    /// Run the pool until `shutdown` flips to true, then drain.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let count = self.config.count.max(1);
        info!(workers = count, "starting worker pool");
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = PipelineWorker::new(
                self.db.clone(),
                self.queue.clone(),
                Arc::clone(&self.fetcher),
                Arc::clone(&self.engine),
                self.config.clone(),
                self.fetcher_config.clone(),
            );
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run_loop(rx).await }));
        }
        join_all(handles).await;
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::{NewErrorEvent, PipelineDb};
    use crate::errors::{EngineError, FetchError};
    use crate::models::{Analysis, RepoConfig, RepoProvider};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Deterministic engine double: pops scripted results, records calls.
    struct ScriptedEngine {
        script: Mutex<Vec<Result<Analysis, EngineError>>>,
        calls: Mutex<Vec<AnalysisRequest>>,
    }

    impl ScriptedEngine {
        fn ok() -> Self {
            Self::with_script(vec![])
        }

        fn with_script(script: Vec<Result<Analysis, EngineError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, EngineError> {
            self.calls.lock().unwrap().push(request.clone());
            match self.script.lock().unwrap().pop() {
                Some(result) => result,
                None => Ok(Analysis {
                    text: "Likely a missing index on orders.".to_string(),
                    model: "test-model".to_string(),
                    confidence: Some("high".to_string()),
                }),
            }
        }
    }

    /// Fetcher double that serves one file and denies everything else.
    struct OneFileFetcher {
        file: String,
        fail_with_access_denied: bool,
    }

    #[async_trait]
    impl SnippetFetcher for OneFileFetcher {
        async fn fetch(
            &self,
            _repo: &RepoConfig,
            file: &str,
            line: u32,
        ) -> Result<Snippet, FetchError> {
            if self.fail_with_access_denied {
                return Err(FetchError::AccessDenied {
                    path: file.to_string(),
                    status: 403,
                });
            }
            if file == self.file {
                Ok(Snippet {
                    file: file.to_string(),
                    start_line: 1,
                    frame_line: line,
                    text: "const orders = await db.query(sql);".to_string(),
                })
            } else {
                Err(FetchError::NotFound {
                    path: file.to_string(),
                    reference: "main".to_string(),
                })
            }
        }
    }

    struct Harness {
        db: DbHandle,
        queue: TaskQueue,
        engine: Arc<ScriptedEngine>,
    }

    fn harness(engine: ScriptedEngine, fetcher: OneFileFetcher) -> (Harness, PipelineWorker) {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let queue_config = QueueConfig {
            visibility_timeout_secs: 330,
            poll_interval_ms: 10,
            max_attempts: 3,
            backoff_base_secs: 0,
            backoff_cap_secs: 0,
        };
        let queue = TaskQueue::new(db.clone(), queue_config);
        let engine = Arc::new(engine);
        let worker = PipelineWorker::new(
            db.clone(),
            queue.clone(),
            Arc::new(fetcher),
            engine.clone(),
            WorkerConfig::default(),
            FetcherConfig::default(),
        );
        (Harness { db, queue, engine }, worker)
    }

    fn fetcher_ok() -> OneFileFetcher {
        OneFileFetcher {
            file: "a.js".to_string(),
            fail_with_access_denied: false,
        }
    }

    async fn store_event(db: &DbHandle, status: Option<i64>, stack: Option<&str>) -> i64 {
        let stack = stack.map(|s| s.to_string());
        db.call(move |db| {
            db.insert_error_event(&NewErrorEvent {
                project_key: "shop".to_string(),
                timestamp: "2026-01-15T10:30:00Z".to_string(),
                status_code: status,
                message: "DB timeout".to_string(),
                stack,
                method: "GET".to_string(),
                path: "/api/orders".to_string(),
            })
        })
        .await
        .unwrap()
        .id
    }

    async fn configure_repo(db: &DbHandle) {
        db.call(|db| {
            let project = db.get_or_create_project("shop", None)?;
            db.set_repo_config(
                project.id,
                &RepoConfig {
                    provider: RepoProvider::Github,
                    owner: "acme".into(),
                    repo: "shop".into(),
                    branch: "main".into(),
                    access_token: None,
                },
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let (_h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_happy_path_with_source() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        configure_repo(&h.db).await;
        let event_id = store_event(&h.db, Some(500), Some("at f (a.js:10:2)")).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::Analyzed));

        let record = h
            .db
            .call(move |db| db.get_analysis(event_id))
            .await
            .unwrap()
            .unwrap();
        assert!(record.has_source_code);
        assert_eq!(record.confidence.as_deref(), Some("high"));
        // Task row is gone after ack.
        assert_eq!(h.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_access_denied_degrades_to_no_source() {
        let (h, worker) = harness(
            ScriptedEngine::ok(),
            OneFileFetcher {
                file: "a.js".to_string(),
                fail_with_access_denied: true,
            },
        );
        configure_repo(&h.db).await;
        let event_id = store_event(&h.db, Some(500), Some("at f (a.js:10:2)")).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::Analyzed));
        let record = h
            .db
            .call(move |db| db.get_analysis(event_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.has_source_code);
        // Analysis was still produced from message + stack alone.
        assert_eq!(h.engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_repo_config_runs_stack_only() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        let event_id = store_event(&h.db, Some(500), Some("at f (a.js:10:2)")).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::Analyzed));
        let record = h
            .db
            .call(move |db| db.get_analysis(event_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.has_source_code);
    }

    #[tokio::test]
    async fn test_malformed_stack_degrades_to_empty_frames() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        let event_id = store_event(&h.db, Some(500), Some("complete garbage")).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::Analyzed));
        let calls = h.engine.calls.lock().unwrap();
        assert!(calls[0].frames.is_empty());
        assert!(calls[0].snippets.is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_task_is_noop() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        // A stale or forged task for a 404 event.
        let event_id = store_event(&h.db, Some(404), None).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::BelowThreshold));
        assert_eq!(h.engine.call_count(), 0);
        let record = h.db.call(move |db| db.get_analysis(event_id)).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_missing_event_task_is_noop() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        h.queue.enqueue(ANALYSIS_CHANNEL, 9999).await.unwrap();

        let result = worker.run_once().await.unwrap().unwrap();
        assert_eq!(result, AttemptResult::Completed(TaskOutcome::EventMissing));
        assert_eq!(h.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        let event_id = store_event(&h.db, Some(500), None).await;
        // The same event enqueued twice (duplicate delivery).
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let first = worker.run_once().await.unwrap().unwrap();
        let second = worker.run_once().await.unwrap().unwrap();
        assert_eq!(first, AttemptResult::Completed(TaskOutcome::Analyzed));
        assert_eq!(
            second,
            AttemptResult::Completed(TaskOutcome::AlreadyAnalyzed)
        );
        // Exactly one engine call, exactly one record.
        assert_eq!(h.engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_then_success_retries_once() {
        // Script: first call fails, second succeeds (popped from the end).
        let engine = ScriptedEngine::with_script(vec![
            Ok(Analysis {
                text: "fixed".to_string(),
                model: "test-model".to_string(),
                confidence: None,
            }),
            Err(EngineError::Status {
                status: 503,
                body: "overloaded".to_string(),
            }),
        ]);
        let (h, worker) = harness(engine, fetcher_ok());
        let event_id = store_event(&h.db, Some(500), None).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        let first = worker.run_once().await.unwrap().unwrap();
        assert_eq!(first, AttemptResult::Failed(TaskState::Pending));

        // Zero backoff in the test config: eligible immediately.
        let second = worker.run_once().await.unwrap().unwrap();
        assert_eq!(second, AttemptResult::Completed(TaskOutcome::Analyzed));
        assert_eq!(h.engine.call_count(), 2);
        let record = h.db.call(move |db| db.get_analysis(event_id)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_three_failures_bury_task() {
        let engine = ScriptedEngine::with_script(vec![
            Err(EngineError::EmptyCompletion),
            Err(EngineError::EmptyCompletion),
            Err(EngineError::EmptyCompletion),
        ]);
        let (h, worker) = harness(engine, fetcher_ok());
        let event_id = store_event(&h.db, Some(500), None).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        assert_eq!(
            worker.run_once().await.unwrap().unwrap(),
            AttemptResult::Failed(TaskState::Pending)
        );
        assert_eq!(
            worker.run_once().await.unwrap().unwrap(),
            AttemptResult::Failed(TaskState::Pending)
        );
        assert_eq!(
            worker.run_once().await.unwrap().unwrap(),
            AttemptResult::Failed(TaskState::Dead)
        );

        // Dead task, no record, nothing more to deliver.
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(h.queue.dead_count(ANALYSIS_CHANNEL).await.unwrap(), 1);
        let record = h.db.call(move |db| db.get_analysis(event_id)).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_frames_outside_repo_are_not_fetched() {
        let (h, worker) = harness(ScriptedEngine::ok(), fetcher_ok());
        configure_repo(&h.db).await;
        let stack = "at f (node_modules/express/lib/router.js:5:1)\nat g (https://cdn.example.com/x.js:1:1)";
        let event_id = store_event(&h.db, Some(500), Some(stack)).await;
        h.queue.enqueue(ANALYSIS_CHANNEL, event_id).await.unwrap();

        worker.run_once().await.unwrap().unwrap();
        let record = h
            .db
            .call(move |db| db.get_analysis(event_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.has_source_code);
    }
}
