use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An ingested application error, immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: i64,
    pub project_id: i64,
    /// Event time reported by the client, RFC 3339.
    pub timestamp: String,
    pub status_code: Option<i64>,
    pub message: String,
    pub stack: Option<String>,
    pub method: String,
    pub path: String,
    pub created_at: String,
}

/// Code-hosting providers the snippet fetcher knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoProvider {
    #[default]
    Github,
    Gitlab,
}

impl RepoProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }
}

impl std::fmt::Display for RepoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            _ => Err(format!("Invalid repo provider: {}", s)),
        }
    }
}

/// Repository coordinate used to resolve stack frames to source files.
/// Stored as JSON on the project row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub provider: RepoProvider,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub project_key: String,
    pub name: String,
    /// Absent when the project has no repository configured; analysis then
    /// runs in stack-trace-only mode.
    pub repo_config: Option<RepoConfig>,
    pub created_at: String,
}

/// Lifecycle state of a queued analysis task.
///
/// `pending -> in_flight -> {removed | pending (retry) | dead}`. Succeeded
/// tasks are deleted rather than kept, so there is no stored terminal
/// success state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// Durable unit of queued analysis work, referencing one error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub channel: String,
    pub error_event_id: i64,
    pub state: TaskState,
    /// Delivery attempts started, incremented at claim time.
    pub attempts: i64,
    /// Unix seconds before which the task must not be delivered.
    pub next_eligible_at: i64,
    /// Unix seconds at which an in-flight claim expires and the task
    /// becomes redeliverable.
    pub lease_expires_at: Option<i64>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a completed analysis. At most one exists per error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub error_event_id: i64,
    pub analysis_text: String,
    pub model: String,
    pub confidence: Option<String>,
    pub has_source_code: bool,
    pub created_at: String,
}

/// A single parsed stack frame. Frame sequences are ordered
/// innermost-first: index 0 is the throw site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub symbol: Option<String>,
}

/// A bounded window of source text fetched around a stack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub file: String,
    /// 1-based line number of the first line in `text`.
    pub start_line: u32,
    /// The frame line this snippet was fetched for.
    pub frame_line: u32,
    pub text: String,
}

/// Output of the analysis engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub text: String,
    pub model: String,
    pub confidence: Option<String>,
}
