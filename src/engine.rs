//! Analysis engine invocation.
//!
//! The engine is a capability interface with one production
//! implementation (`OpenAiEngine`, any OpenAI-compatible chat-completions
//! endpoint) so the pipeline workflow is testable without a live model.
//! The engine is treated as an opaque, possibly slow, possibly-failing
//! remote dependency; every failure is transient from the workflow's
//! point of view.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::models::{Analysis, Snippet, StackFrame};

const SYSTEM_PROMPT: &str = "You are a senior engineer performing root-cause analysis of a \
production error. Use the stack trace and any source snippets to explain the most likely \
cause and a concrete fix. Start your reply with a line of the form `Confidence: high`, \
`Confidence: medium`, or `Confidence: low`, then the analysis.";

/// Everything the engine gets to see for one error event.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub message: String,
    pub method: String,
    pub path: String,
    pub status_code: Option<i64>,
    pub frames: Vec<StackFrame>,
    pub snippets: Vec<Snippet>,
}

/// Capability interface for the language-model call.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, EngineError>;
}

/// Assemble the user prompt from the error context. Sections for frames
/// and snippets are omitted entirely when empty, so a stack-trace-only or
/// message-only analysis degrades to a shorter prompt rather than empty
/// boilerplate.
pub fn build_prompt(request: &AnalysisRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "An error occurred handling `{} {}`",
        request.method, request.path
    ));
    if let Some(status) = request.status_code {
        prompt.push_str(&format!(" (status {})", status));
    }
    prompt.push_str(&format!(".\n\nError message:\n{}\n", request.message));

    if !request.frames.is_empty() {
        prompt.push_str("\nStack trace (innermost first):\n");
        for frame in &request.frames {
            match &frame.symbol {
                Some(symbol) => prompt.push_str(&format!(
                    "- {} at {}:{}\n",
                    symbol, frame.file, frame.line
                )),
                None => prompt.push_str(&format!("- {}:{}\n", frame.file, frame.line)),
            }
        }
    }

    for snippet in &request.snippets {
        prompt.push_str(&format!(
            "\nSource of {} around line {} (window starts at line {}):\n```\n{}\n```\n",
            snippet.file, snippet.frame_line, snippet.start_line, snippet.text
        ));
    }
    prompt
}

/// Split a leading `Confidence: <word>` line off the model reply. Returns
/// the confidence (lowercased) and the remaining analysis text; a reply
/// without the line passes through untouched.
pub fn split_confidence(reply: &str) -> (Option<String>, String) {
    let trimmed = reply.trim_start();
    let Some(rest) = trimmed.strip_prefix("Confidence:") else {
        return (None, reply.trim().to_string());
    };
    let (level, body) = match rest.split_once('\n') {
        Some((level, body)) => (level, body),
        None => (rest, ""),
    };
    let level = level.trim().to_lowercase();
    if level.is_empty() {
        return (None, reply.trim().to_string());
    }
    (Some(level), body.trim().to_string())
}

// ── OpenAI-compatible wire types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Production engine against an OpenAI-compatible chat-completions API.
pub struct OpenAiEngine {
    client: reqwest::Client,
    config: EngineConfig,
    api_key: String,
}

impl OpenAiEngine {
    /// Reads the API key from `OPENAI_API_KEY`.
    pub fn from_env(config: EngineConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }
}

#[async_trait]
impl AnalysisEngine for OpenAiEngine {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, EngineError> {
        let prompt = build_prompt(request);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.2,
            max_tokens: 1024,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Request(anyhow!(e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Request(anyhow!(e)))?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(EngineError::EmptyCompletion)?;

        let (confidence, text) = split_confidence(&reply);
        Ok(Analysis {
            text,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            confidence,
        })
    }
}
