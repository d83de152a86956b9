//! End-to-end pipeline tests over the in-memory database with
//! deterministic engine and fetcher doubles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use faultline::config::{ANALYSIS_CHANNEL, FetcherConfig, QueueConfig, WorkerConfig};
use faultline::db::{AnalysisFilter, DbHandle, NewErrorEvent, PipelineDb};
use faultline::engine::{AnalysisEngine, AnalysisRequest};
use faultline::errors::{EngineError, FetchError};
use faultline::models::{Analysis, RepoConfig, RepoProvider, Snippet};
use faultline::queue::TaskQueue;
use faultline::source::SnippetFetcher;
use faultline::trigger::TriggerPolicy;
use faultline::worker::{PipelineWorker, WorkerPool};

// =============================================================================
// Doubles
// =============================================================================

/// Engine double that always answers.
struct StaticEngine;

#[async_trait]
impl AnalysisEngine for StaticEngine {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, EngineError> {
        Ok(Analysis {
            text: format!("Root cause for: {}", request.message),
            model: "test-model".to_string(),
            confidence: Some("medium".to_string()),
        })
    }
}

/// Fetcher double serving an in-memory file map; everything else is
/// NotFound. `deny` switches all answers to AccessDenied.
struct MapFetcher {
    files: HashMap<String, String>,
    deny: bool,
}

impl MapFetcher {
    fn with_file(path: &str, content: &str) -> Self {
        let mut files = HashMap::new();
        files.insert(path.to_string(), content.to_string());
        Self { files, deny: false }
    }

    fn deny_all() -> Self {
        Self {
            files: HashMap::new(),
            deny: true,
        }
    }
}

#[async_trait]
impl SnippetFetcher for MapFetcher {
    async fn fetch(
        &self,
        _repo: &RepoConfig,
        file: &str,
        line: u32,
    ) -> Result<Snippet, FetchError> {
        if self.deny {
            return Err(FetchError::AccessDenied {
                path: file.to_string(),
                status: 403,
            });
        }
        match self.files.get(file) {
            Some(content) => Ok(faultline::source::window(file, content, line, 10)),
            None => Err(FetchError::NotFound {
                path: file.to_string(),
                reference: "main".to_string(),
            }),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Pipeline {
    db: DbHandle,
    queue: TaskQueue,
    trigger: TriggerPolicy,
}

fn pipeline() -> Pipeline {
    let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
    let queue = TaskQueue::new(db.clone(), test_queue_config());
    let trigger = TriggerPolicy::new(queue.clone());
    Pipeline { db, queue, trigger }
}

fn test_queue_config() -> QueueConfig {
    QueueConfig {
        visibility_timeout_secs: 330,
        poll_interval_ms: 10,
        max_attempts: 3,
        backoff_base_secs: 0,
        backoff_cap_secs: 0,
    }
}

fn worker_with(p: &Pipeline, fetcher: Arc<dyn SnippetFetcher>) -> PipelineWorker {
    PipelineWorker::new(
        p.db.clone(),
        p.queue.clone(),
        fetcher,
        Arc::new(StaticEngine),
        WorkerConfig::default(),
        FetcherConfig::default(),
    )
}

async fn store_event(p: &Pipeline, status: Option<i64>, stack: Option<&str>) -> faultline::models::ErrorEvent {
    let stack = stack.map(|s| s.to_string());
    p.db
        .call(move |db| {
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
}

async fn configure_repo(p: &Pipeline) {
    p.db
        .call(|db| {
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

async fn analysis_count(p: &Pipeline) -> usize {
    p.db
        .call(|db| db.list_analyses(&AnalysisFilter::default()))
        .await
        .unwrap()
        .len()
}

// =============================================================================
// Trigger policy properties
// =============================================================================

#[tokio::test]
async fn below_threshold_events_are_never_enqueued() {
    let p = pipeline();
    for status in [Some(200), Some(404), Some(499), None] {
        let event = store_event(&p, status, None).await;
        p.trigger.on_error_stored(&event).await;
    }
    assert_eq!(p.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
    assert_eq!(analysis_count(&p).await, 0);
}

#[tokio::test]
async fn severe_events_are_enqueued() {
    let p = pipeline();
    for status in [500, 502, 503] {
        let event = store_event(&p, Some(status), None).await;
        p.trigger.on_error_stored(&event).await;
    }
    assert_eq!(p.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 3);
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[tokio::test]
async fn fetchable_source_yields_has_source_code() {
    let p = pipeline();
    configure_repo(&p).await;
    let fetcher = Arc::new(MapFetcher::with_file(
        "a.js",
        "function f() {\n  throw new Error('DB timeout');\n}\n",
    ));
    let worker = worker_with(&p, fetcher);

    let event = store_event(&p, Some(500), Some("at f (a.js:10)")).await;
    p.trigger.on_error_stored(&event).await;
    worker.run_once().await.unwrap().unwrap();

    let event_id = event.id;
    let record = p
        .db
        .call(move |db| db.get_analysis(event_id))
        .await
        .unwrap()
        .expect("analysis should exist");
    assert!(record.has_source_code);
    assert_eq!(record.model, "test-model");
}

#[tokio::test]
async fn access_denied_repo_still_produces_analysis() {
    let p = pipeline();
    configure_repo(&p).await;
    let worker = worker_with(&p, Arc::new(MapFetcher::deny_all()));

    let event = store_event(&p, Some(500), Some("at f (a.js:10)")).await;
    p.trigger.on_error_stored(&event).await;
    worker.run_once().await.unwrap().unwrap();

    let event_id = event.id;
    let record = p
        .db
        .call(move |db| db.get_analysis(event_id))
        .await
        .unwrap()
        .expect("analysis should exist");
    assert!(!record.has_source_code);
    assert!(record.analysis_text.contains("DB timeout"));
}

#[tokio::test]
async fn status_404_leaves_no_trace_in_pipeline() {
    let p = pipeline();
    let event = store_event(&p, Some(404), None).await;
    p.trigger.on_error_stored(&event).await;

    assert_eq!(p.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
    let event_id = event.id;
    let record = p.db.call(move |db| db.get_analysis(event_id)).await.unwrap();
    assert!(record.is_none());
}

// =============================================================================
// Idempotence under duplicate delivery
// =============================================================================

#[tokio::test]
async fn concurrent_duplicate_delivery_yields_one_record() {
    let p = pipeline();
    let event = store_event(&p, Some(500), Some("at f (a.js:10)")).await;

    // The same event delivered twice, processed by two workers at once.
    p.queue.enqueue(ANALYSIS_CHANNEL, event.id).await.unwrap();
    p.queue.enqueue(ANALYSIS_CHANNEL, event.id).await.unwrap();
    let w1 = worker_with(&p, Arc::new(MapFetcher::deny_all()));
    let w2 = worker_with(&p, Arc::new(MapFetcher::deny_all()));

    let (r1, r2) = tokio::join!(w1.run_once(), w2.run_once());
    assert!(r1.unwrap().is_some());
    assert!(r2.unwrap().is_some());

    assert_eq!(analysis_count(&p).await, 1);
    assert_eq!(p.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
}

// =============================================================================
// Worker pool
// =============================================================================

#[tokio::test]
async fn pool_drains_queue_and_shuts_down() {
    let p = pipeline();
    let mut event_ids = Vec::new();
    for _ in 0..3 {
        let event = store_event(&p, Some(500), Some("at f (a.js:3)")).await;
        p.trigger.on_error_stored(&event).await;
        event_ids.push(event.id);
    }

    let pool = WorkerPool::new(
        p.db.clone(),
        p.queue.clone(),
        Arc::new(MapFetcher::deny_all()),
        Arc::new(StaticEngine),
        WorkerConfig {
            count: 2,
            ..Default::default()
        },
        FetcherConfig::default(),
    );
    let (tx, rx) = watch::channel(false);
    let pool_handle = tokio::spawn(async move { pool.run(rx).await });

    // Wait for all three analyses to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while analysis_count(&p).await < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool did not drain the queue in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).unwrap();
    pool_handle.await.unwrap();

    assert_eq!(p.queue.depth(ANALYSIS_CHANNEL).await.unwrap(), 0);
    for event_id in event_ids {
        let record = p.db.call(move |db| db.get_analysis(event_id)).await.unwrap();
        assert!(record.is_some());
    }
}
