//! Stack trace interpretation.
//!
//! `parse_stack_trace` is total: any input (empty, truncated, or not a
//! stack trace at all) yields a (possibly empty) frame sequence and never
//! fails. Lines that match no known form are skipped.
//!
//! Frame ordering convention: **innermost-first**: index 0 is the throw
//! site. V8-style traces already arrive in that order; Python-style
//! tracebacks list the outermost call first and are reversed at parse
//! time so callers can uniformly take the first N frames as "closest to
//! the throw site".

use std::sync::OnceLock;

use regex::Regex;

use crate::models::StackFrame;

/// V8 / Node.js: `    at fn (src/a.js:10:5)` or `    at src/a.js:10:5`.
fn v8_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*at\s+(?:(?P<sym>.+?)\s+\()?(?P<file>[^()\s]+?):(?P<line>\d+)(?::(?P<col>\d+))?\)?\s*$")
            .expect("v8 frame regex is valid")
    })
}

/// Firefox / Safari: `fn@src/a.js:10:5`.
fn at_sign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?P<sym>[^@\s]*)@(?P<file>[^@\s]+?):(?P<line>\d+)(?::(?P<col>\d+))?\s*$")
            .expect("at-sign frame regex is valid")
    })
}

/// Python: `  File "app/views.py", line 12, in handler`.
fn python_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*File\s+"(?P<file>[^"]+)",\s+line\s+(?P<line>\d+)(?:,\s+in\s+(?P<sym>\S+))?"#)
            .expect("python frame regex is valid")
    })
}

/// Parse a raw stack trace into innermost-first frames. Never fails.
pub fn parse_stack_trace(raw: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut python_frames = Vec::new();

    for line in raw.lines() {
        if let Some(caps) = v8_re().captures(line).or_else(|| at_sign_re().captures(line)) {
            if let Some(frame) = frame_from_captures(&caps) {
                frames.push(frame);
            }
        } else if let Some(caps) = python_re().captures(line)
            && let Some(frame) = frame_from_captures(&caps)
        {
            python_frames.push(frame);
        }
    }

    // Python tracebacks run outermost-first; flip them to the crate-wide
    // innermost-first convention.
    python_frames.reverse();
    frames.extend(python_frames);
    frames
}

fn frame_from_captures(caps: &regex::Captures<'_>) -> Option<StackFrame> {
    let line = caps.name("line")?.as_str().parse().ok()?;
    let column = caps
        .name("col")
        .and_then(|c| c.as_str().parse().ok());
    let symbol = caps
        .name("sym")
        .map(|s| s.as_str().trim().to_string())
        .filter(|s| !s.is_empty() && s != "<anonymous>");
    Some(StackFrame {
        file: caps.name("file")?.as_str().to_string(),
        line,
        column,
        symbol,
    })
}

/// Map a frame's file reference to a repository-relative path, or `None`
/// when the frame cannot live in the project repository (URLs, installed
/// dependencies, native frames).
pub fn repo_relative_path(file: &str) -> Option<String> {
    let mut path = file.trim();
    if path.is_empty() || path.starts_with("http://") || path.starts_with("https://") {
        return None;
    }
    if path == "<anonymous>" || path.starts_with("node:") || path.starts_with('[') {
        return None;
    }
    // Bundler prefixes.
    path = path.strip_prefix("webpack:///").unwrap_or(path);
    path = path.strip_prefix("webpack://").unwrap_or(path);
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped;
    }
    path = path.trim_start_matches('/');
    if path.is_empty() || path.contains("node_modules/") {
        return None;
    }
    Some(path.to_string())
}
