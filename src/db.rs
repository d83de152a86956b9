use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::models::*;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also serializes the
/// queue's claim protocol, so claim reads and writes are atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(PipelineDb::new(path)?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Acceptable in startup
    /// code and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Input for storing a new error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewErrorEvent {
    pub project_key: String,
    pub timestamp: String,
    pub status_code: Option<i64>,
    pub message: String,
    pub stack: Option<String>,
    pub method: String,
    pub path: String,
}

/// Listing row for the dashboard collaborator: an event plus whether an
/// analysis exists for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListItem {
    pub id: i64,
    pub timestamp: String,
    pub status_code: Option<i64>,
    pub message: String,
    pub method: String,
    pub path: String,
    pub project_key: String,
    pub has_analysis: bool,
    pub created_at: String,
}

/// Filters for `list_events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_key: Option<String>,
    pub min_status_code: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

/// Filters for `list_analyses`.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFilter {
    pub model: Option<String>,
    pub confidence: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_key TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    repo_config TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS error_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    timestamp TEXT NOT NULL,
                    status_code INTEGER,
                    message TEXT NOT NULL,
                    stack TEXT,
                    method TEXT NOT NULL DEFAULT '',
                    path TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS analysis (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    error_event_id INTEGER NOT NULL UNIQUE
                        REFERENCES error_events(id) ON DELETE CASCADE,
                    analysis_text TEXT NOT NULL,
                    model TEXT NOT NULL,
                    confidence TEXT,
                    has_source_code INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel TEXT NOT NULL,
                    error_event_id INTEGER NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_eligible_at INTEGER NOT NULL DEFAULT 0,
                    lease_expires_at INTEGER,
                    locked_by TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_events_project ON error_events(project_id);
                CREATE INDEX IF NOT EXISTS idx_events_status ON error_events(status_code);
                CREATE INDEX IF NOT EXISTS idx_tasks_claim
                    ON tasks(channel, state, next_eligible_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    /// Get an existing project by key or create it. Insert losers under a
    /// concurrent create re-select the winner's row.
    pub fn get_or_create_project(&self, project_key: &str, name: Option<&str>) -> Result<Project> {
        if let Some(project) = self.get_project_by_key(project_key)? {
            return Ok(project);
        }
        let insert = self.conn.execute(
            "INSERT INTO projects (project_key, name) VALUES (?1, ?2)",
            params![project_key, name.unwrap_or(project_key)],
        );
        match insert {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                self.get_project(id)?
                    .context("Project not found after insert")
            }
            Err(e) if is_unique_violation(&e) => self
                .get_project_by_key(project_key)?
                .context("Project not found after losing create race"),
            Err(e) => Err(e).context("Failed to insert project"),
        }
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, project_key, name, repo_config, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn get_project_by_key(&self, project_key: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, project_key, name, repo_config, created_at
                 FROM projects WHERE project_key = ?1",
                params![project_key],
                row_to_project,
            )
            .optional()
            .context("Failed to query project by key")
    }

    pub fn set_repo_config(&self, project_id: i64, repo: &RepoConfig) -> Result<Project> {
        let json = serde_json::to_string(repo).context("Failed to serialize repo config")?;
        self.conn
            .execute(
                "UPDATE projects SET repo_config = ?1 WHERE id = ?2",
                params![json, project_id],
            )
            .context("Failed to update repo config")?;
        self.get_project(project_id)?
            .context("Project not found after repo config update")
    }

    // ── ErrorEvent CRUD ───────────────────────────────────────────────

    pub fn insert_error_event(&self, event: &NewErrorEvent) -> Result<ErrorEvent> {
        let project = self.get_or_create_project(&event.project_key, None)?;
        self.conn
            .execute(
                "INSERT INTO error_events (project_id, timestamp, status_code, message, stack, method, path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project.id,
                    event.timestamp,
                    event.status_code,
                    event.message,
                    event.stack,
                    event.method,
                    event.path
                ],
            )
            .context("Failed to insert error event")?;
        let id = self.conn.last_insert_rowid();
        self.get_event(id)?.context("Event not found after insert")
    }

    pub fn get_event(&self, id: i64) -> Result<Option<ErrorEvent>> {
        self.conn
            .query_row(
                "SELECT id, project_id, timestamp, status_code, message, stack, method, path, created_at
                 FROM error_events WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ErrorEvent {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        status_code: row.get(3)?,
                        message: row.get(4)?,
                        stack: row.get(5)?,
                        method: row.get(6)?,
                        path: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to query error event")
    }

    /// List events newest-first with the `has_analysis` flag the dashboard
    /// polls for.
    pub fn list_events(&self, filter: &EventFilter) -> Result<(Vec<EventListItem>, i64)> {
        let project_key = filter.project_key.clone().unwrap_or_default();
        let has_project = !project_key.is_empty();
        let limit = if filter.limit > 0 { filter.limit } else { 50 };

        // Events without a status code never satisfy a minimum-status filter.
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM error_events e
                 JOIN projects p ON p.id = e.project_id
                 WHERE (?1 = 0 OR p.project_key = ?2)
                   AND (?3 IS NULL OR (e.status_code IS NOT NULL AND e.status_code >= ?3))",
                params![has_project, project_key, filter.min_status_code],
                |row| row.get(0),
            )
            .context("Failed to count error events")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT e.id, e.timestamp, e.status_code, e.message, e.method, e.path,
                        p.project_key, a.id IS NOT NULL, e.created_at
                 FROM error_events e
                 JOIN projects p ON p.id = e.project_id
                 LEFT JOIN analysis a ON a.error_event_id = e.id
                 WHERE (?1 = 0 OR p.project_key = ?2)
                   AND (?3 IS NULL OR (e.status_code IS NOT NULL AND e.status_code >= ?3))
                 ORDER BY e.timestamp DESC
                 LIMIT ?4 OFFSET ?5",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(
                params![
                    has_project,
                    project_key,
                    filter.min_status_code,
                    limit,
                    filter.offset
                ],
                |row| {
                    Ok(EventListItem {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        status_code: row.get(2)?,
                        message: row.get(3)?,
                        method: row.get(4)?,
                        path: row.get(5)?,
                        project_key: row.get(6)?,
                        has_analysis: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .context("Failed to query error events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok((events, total))
    }

    // ── AnalysisRecord ────────────────────────────────────────────────

    /// Insert an analysis for an event. Returns `None` when another worker
    /// already inserted one; the uniqueness constraint on
    /// `error_event_id` is the backstop against concurrent duplicates.
    pub fn try_insert_analysis(
        &self,
        error_event_id: i64,
        analysis: &Analysis,
        has_source_code: bool,
    ) -> Result<Option<AnalysisRecord>> {
        let insert = self.conn.execute(
            "INSERT INTO analysis (error_event_id, analysis_text, model, confidence, has_source_code)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                error_event_id,
                analysis.text,
                analysis.model,
                analysis.confidence,
                has_source_code
            ],
        );
        match insert {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                Ok(Some(
                    self.get_analysis_by_id(id)?
                        .context("Analysis not found after insert")?,
                ))
            }
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to insert analysis"),
        }
    }

    /// Read surface polled by the dashboard collaborator.
    pub fn get_analysis(&self, error_event_id: i64) -> Result<Option<AnalysisRecord>> {
        self.conn
            .query_row(
                "SELECT id, error_event_id, analysis_text, model, confidence, has_source_code, created_at
                 FROM analysis WHERE error_event_id = ?1",
                params![error_event_id],
                row_to_analysis,
            )
            .optional()
            .context("Failed to query analysis")
    }

    fn get_analysis_by_id(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        self.conn
            .query_row(
                "SELECT id, error_event_id, analysis_text, model, confidence, has_source_code, created_at
                 FROM analysis WHERE id = ?1",
                params![id],
                row_to_analysis,
            )
            .optional()
            .context("Failed to query analysis by id")
    }

    pub fn list_analyses(&self, filter: &AnalysisFilter) -> Result<Vec<AnalysisRecord>> {
        let model = filter.model.clone().unwrap_or_default();
        let confidence = filter.confidence.clone().unwrap_or_default();
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, error_event_id, analysis_text, model, confidence, has_source_code, created_at
                 FROM analysis
                 WHERE (?1 = '' OR model = ?1)
                   AND (?2 = '' OR confidence = ?2)
                 ORDER BY created_at DESC
                 LIMIT ?3 OFFSET ?4",
            )
            .context("Failed to prepare list_analyses")?;
        let rows = stmt
            .query_map(
                params![model, confidence, limit, filter.offset],
                row_to_analysis,
            )
            .context("Failed to query analyses")?;
        let mut analyses = Vec::new();
        for row in rows {
            analyses.push(row.context("Failed to read analysis row")?);
        }
        Ok(analyses)
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let repo_json: Option<String> = row.get(3)?;
    // A repo_config blob that fails to parse is treated as absent rather
    // than poisoning every read of the project.
    let repo_config = repo_json.and_then(|json| serde_json::from_str(&json).ok());
    Ok(Project {
        id: row.get(0)?,
        project_key: row.get(1)?,
        name: row.get(2)?,
        repo_config,
        created_at: row.get(4)?,
    })
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    Ok(AnalysisRecord {
        id: row.get(0)?,
        error_event_id: row.get(1)?,
        analysis_text: row.get(2)?,
        model: row.get(3)?,
        confidence: row.get(4)?,
        has_source_code: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi, _)
            if ffi.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
