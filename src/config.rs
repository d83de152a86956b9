//! Configuration for the faultline pipeline.
//!
//! Reads `faultline.toml`, then applies `FAULTLINE_*` environment
//! overrides; CLI flags are applied last by the caller. All sections and
//! fields are optional and default to values matching the worker tuning
//! of the production deployment.
//!
//! # Configuration File Format
//!
//! ```toml
//! [database]
//! path = "faultline.db"
//!
//! [queue]
//! visibility_timeout_secs = 330
//! poll_interval_ms = 500
//! max_attempts = 3
//! backoff_base_secs = 2
//! backoff_cap_secs = 600
//!
//! [worker]
//! count = 2
//! soft_deadline_secs = 240
//! hard_deadline_secs = 300
//!
//! [engine]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! timeout_secs = 120
//!
//! [fetcher]
//! timeout_secs = 15
//! context_lines = 10
//! max_frames = 3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Channel name carried by every analysis task.
pub const ANALYSIS_CHANNEL: &str = "ai_analysis";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultlineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds an in-flight claim stays valid before the task becomes
    /// redeliverable. Must exceed the worker's hard deadline.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// Idle sleep between dequeue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delivery attempts before a task is buried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Voluntary abort budget for one attempt.
    #[serde(default = "default_soft_deadline")]
    pub soft_deadline_secs: u64,
    /// Forcible termination budget for one attempt.
    #[serde(default = "default_hard_deadline")]
    pub hard_deadline_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            soft_deadline_secs: default_soft_deadline(),
            hard_deadline_secs: default_hard_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    #[serde(default = "default_engine_model")]
    pub model: String,
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            model: default_engine_model(),
            timeout_secs: default_engine_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_fetcher_timeout")]
    pub timeout_secs: u64,
    /// Lines of context fetched on each side of a frame line.
    #[serde(default = "default_context_lines")]
    pub context_lines: u32,
    /// Innermost frames considered for snippet fetching.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,
    #[serde(default = "default_gitlab_api_base")]
    pub gitlab_api_base: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetcher_timeout(),
            context_lines: default_context_lines(),
            max_frames: default_max_frames(),
            github_api_base: default_github_api_base(),
            gitlab_api_base: default_gitlab_api_base(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("faultline.db")
}
fn default_visibility_timeout() -> u64 {
    330
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> i64 {
    3
}
fn default_backoff_base() -> u64 {
    2
}
fn default_backoff_cap() -> u64 {
    600
}
fn default_worker_count() -> usize {
    2
}
fn default_soft_deadline() -> u64 {
    240
}
fn default_hard_deadline() -> u64 {
    300
}
fn default_engine_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_engine_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_engine_timeout() -> u64 {
    120
}
fn default_fetcher_timeout() -> u64 {
    15
}
fn default_context_lines() -> u32 {
    10
}
fn default_max_frames() -> usize {
    3
}
fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_gitlab_api_base() -> String {
    "https://gitlab.com".to_string()
}

impl FaultlineConfig {
    /// Load configuration: file (if present) -> environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new("faultline.toml");
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `FAULTLINE_*` environment overrides on top of file values.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FAULTLINE_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FAULTLINE_WORKERS")
            && let Ok(n) = v.parse()
        {
            self.worker.count = n;
        }
        if let Ok(v) = std::env::var("FAULTLINE_MODEL") {
            self.engine.model = v;
        }
        if let Ok(v) = std::env::var("FAULTLINE_ENGINE_BASE_URL") {
            self.engine.base_url = v;
        }
    }
}
