//! Source repository fetcher.
//!
//! Resolves a stack frame (file path + line) against the project's
//! configured repository and returns a bounded window of source text
//! around that line. Stateless; every failure is scoped to the frame
//! being fetched and absorbed by the caller.

use anyhow::anyhow;
use async_trait::async_trait;

use crate::config::FetcherConfig;
use crate::errors::FetchError;
use crate::models::{RepoConfig, RepoProvider, Snippet};

/// Capability interface for snippet retrieval, so the pipeline can be
/// tested without a code-hosting API.
#[async_trait]
pub trait SnippetFetcher: Send + Sync {
    async fn fetch(&self, repo: &RepoConfig, file: &str, line: u32)
    -> Result<Snippet, FetchError>;
}

/// Production fetcher against the GitHub contents API and the GitLab
/// raw-file API.
pub struct HttpSnippetFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpSnippetFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn fetch_file(&self, repo: &RepoConfig, file: &str) -> Result<String, FetchError> {
        let request = match repo.provider {
            RepoProvider::Github => {
                let url = format!(
                    "{}/repos/{}/{}/contents/{}",
                    self.config.github_api_base, repo.owner, repo.repo, file
                );
                let mut req = self
                    .client
                    .get(&url)
                    .header("Accept", "application/vnd.github.raw+json")
                    .header("User-Agent", "faultline")
                    .query(&[("ref", repo.branch.as_str())]);
                if let Some(token) = &repo.access_token {
                    req = req.header("Authorization", format!("Bearer {}", token));
                }
                req
            }
            RepoProvider::Gitlab => {
                let url = format!(
                    "{}/api/v4/projects/{}%2F{}/repository/files/{}/raw",
                    self.config.gitlab_api_base,
                    repo.owner,
                    repo.repo,
                    encode_path(file)
                );
                let mut req = self
                    .client
                    .get(&url)
                    .query(&[("ref", repo.branch.as_str())]);
                if let Some(token) = &repo.access_token {
                    req = req.header("PRIVATE-TOKEN", token);
                }
                req
            }
        };

        let resp = request.send().await.map_err(|e| FetchError::Network {
            path: file.to_string(),
            source: anyhow!(e),
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                path: file.to_string(),
                reference: repo.branch.clone(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::AccessDenied {
                path: file.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                path: file.to_string(),
                source: anyhow!("unexpected status {}", status),
            });
        }

        resp.text().await.map_err(|e| FetchError::Network {
            path: file.to_string(),
            source: anyhow!(e),
        })
    }
}

#[async_trait]
impl SnippetFetcher for HttpSnippetFetcher {
    async fn fetch(
        &self,
        repo: &RepoConfig,
        file: &str,
        line: u32,
    ) -> Result<Snippet, FetchError> {
        let content = self.fetch_file(repo, file).await?;
        Ok(window(file, &content, line, self.config.context_lines))
    }
}

/// Cut a window of `context` lines on each side of `line` (1-based) out of
/// `content`. A line past the end of the file yields the file's tail
/// rather than an error; line numbers from minified or stale traces are
/// best-effort.
pub fn window(file: &str, content: &str, line: u32, context: u32) -> Snippet {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len() as u32;
    let anchor = line.clamp(1, total.max(1));
    let start = anchor.saturating_sub(context).max(1);
    let end = anchor.saturating_add(context).min(total.max(1));
    let text = if lines.is_empty() {
        String::new()
    } else {
        lines[(start - 1) as usize..end as usize].join("\n")
    };
    Snippet {
        file: file.to_string(),
        start_line: start,
        frame_line: line,
        text,
    }
}

/// Percent-encode a repository file path for the GitLab files API, which
/// takes the path as a single URL segment.
fn encode_path(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}
