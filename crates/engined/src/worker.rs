//! Worker Adapter (Section 4.4): invokes an external worker process,
//! concatenates its output according to its declared framing, extracts the
//! single `BEGIN_JSON`/`END_JSON` block, and validates it against the
//! calling phase's schema.
//!
//! Generalizes the shape of the existing single-CLI runner (spawn, pipe
//! stdin, capture stdout/stderr, enforce a wall-clock cap) into a
//! configuration-driven, multi-worker, multi-output-mode adapter.

use engine_core::config::WorkerConfig;
use engine_core::types::{WorkerErrorKind, WorkerOutput};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

const BEGIN_MARKER: &str = "BEGIN_JSON";
const END_MARKER: &str = "END_JSON";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("io error spawning worker {bin}: {source}")]
    Spawn {
        bin: String,
        source: std::io::Error,
    },
    #[error("io error communicating with worker: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker call exceeded its time cap")]
    TimedOut,
    #[error("worker process failed: {0:?}")]
    ProcessFailed(WorkerErrorKind),
    #[error("no BEGIN_JSON/END_JSON block found in worker output")]
    NoJsonBlock,
    #[error("worker output failed schema validation after retry: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Outcome of a single worker invocation, before phase-specific schema
/// parsing: the concatenated text body plus the extracted JSON block, if
/// any.
#[derive(Debug, Clone)]
pub struct WorkerCallResult {
    pub text_body: String,
    pub json_block: Option<String>,
    pub duration_ms: u64,
    pub retried: bool,
}

/// Invoke a worker with `prompt` on stdin in `repo_path`, retrying the
/// whole call exactly once (with an addendum instructing stricter output)
/// if the first attempt's output either has no extractable JSON block or
/// extracts a block that fails `validate`, the caller's phase schema
/// check (Section 4.4 "Validate the extracted JSON against the
/// phase-specific schema. On failure, retry exactly once"). Returns the
/// final `WorkerCallResult` regardless of whether a valid block was
/// ultimately produced; a second failure is the caller's to classify as a
/// parse failure, with `text_body` as the captured body.
pub async fn invoke(
    config: &WorkerConfig,
    prompt: &str,
    repo_path: &Path,
    call_cap: Duration,
    validate: impl Fn(&str) -> bool,
) -> Result<WorkerCallResult> {
    let start = Instant::now();
    let first = call_once(config, prompt, repo_path, call_cap).await?;
    if first.json_block.as_deref().is_some_and(&validate) {
        return Ok(WorkerCallResult {
            duration_ms: start.elapsed().as_millis() as u64,
            retried: false,
            ..first
        });
    }

    warn!(bin = %config.bin.display(), "worker output had no valid JSON block, retrying with stricter prompt");
    let stricter_prompt = format!(
        "{prompt}\n\nYour previous response did not contain a valid {BEGIN_MARKER}...{END_MARKER} \
block matching the required schema. Respond again, and make sure your final output \
contains exactly one such block."
    );
    let second = call_once(config, &stricter_prompt, repo_path, call_cap).await?;
    Ok(WorkerCallResult {
        duration_ms: start.elapsed().as_millis() as u64,
        retried: true,
        ..second
    })
}

async fn call_once(
    config: &WorkerConfig,
    prompt: &str,
    repo_path: &Path,
    call_cap: Duration,
) -> Result<WorkerCallResult> {
    let call_start = Instant::now();
    let mut cmd = Command::new(&config.bin);
    cmd.args(&config.args)
        .current_dir(repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
        bin: config.bin.display().to_string(),
        source,
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let text_body = tokio::select! {
        body = read_output(&mut child, config.output) => body?,
        () = tokio::time::sleep(call_cap) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(WorkerError::TimedOut);
        }
    };

    let _ = child.wait().await;

    debug!(
        bin = %config.bin.display(),
        duration_ms = call_start.elapsed().as_millis() as u64,
        body_len = text_body.len(),
        "worker call completed"
    );

    let json_block = extract_json_block(&text_body);
    Ok(WorkerCallResult {
        text_body,
        json_block,
        duration_ms: call_start.elapsed().as_millis() as u64,
        retried: false,
    })
}

async fn read_output(child: &mut tokio::process::Child, output: WorkerOutput) -> Result<String> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let body = match output {
        WorkerOutput::Text | WorkerOutput::Json => {
            let mut buf = Vec::new();
            if let Some(h) = stdout.as_mut() {
                h.read_to_end(&mut buf).await?;
            }
            String::from_utf8_lossy(&buf).into_owned()
        }
        WorkerOutput::Jsonl => {
            let mut text = String::new();
            if let Some(h) = stdout.take() {
                let mut lines = BufReader::new(h).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some(segment) = assistant_text_segment(&line) {
                        text.push_str(&segment);
                    }
                }
            }
            text
        }
    };

    if body.trim().is_empty() {
        let mut err_buf = Vec::new();
        if let Some(h) = stderr.as_mut() {
            h.read_to_end(&mut err_buf).await?;
        }
        let stderr_text = String::from_utf8_lossy(&err_buf);
        if let Some(kind) = classify_stderr(&stderr_text) {
            return Err(WorkerError::ProcessFailed(kind));
        }
    }

    Ok(body)
}

/// Extract the text segment from a single JSONL line emitted by a worker
/// streaming assistant messages, one JSON object per line. A line that
/// isn't an assistant-text event or doesn't parse is silently skipped.
fn assistant_text_segment(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("text")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .or_else(|| {
            value
                .get("content")
                .and_then(|c| c.as_str())
                .map(str::to_string)
        })
}

/// Extract the single `BEGIN_JSON`/`END_JSON`-delimited block from a text
/// body. Whitespace outside the block is ignored; only the first
/// well-formed block is honored.
fn extract_json_block(body: &str) -> Option<String> {
    let start = body.find(BEGIN_MARKER)? + BEGIN_MARKER.len();
    let end = body[start..].find(END_MARKER)? + start;
    let block = body[start..end].trim();
    if block.is_empty() {
        None
    } else {
        Some(block.to_string())
    }
}

fn classify_stderr(stderr: &str) -> Option<WorkerErrorKind> {
    let lower = stderr.to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("unauthorized") || lower.contains("auth") || lower.contains("forbidden") {
        Some(WorkerErrorKind::Auth)
    } else if lower.contains("rate limit") || lower.contains("429") {
        Some(WorkerErrorKind::RateLimit)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Some(WorkerErrorKind::Timeout)
    } else if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
        Some(WorkerErrorKind::Network)
    } else {
        Some(WorkerErrorKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_block_strips_surrounding_text() {
        let body = "preamble\nBEGIN_JSON\n{\"a\":1}\nEND_JSON\ntrailer";
        assert_eq!(extract_json_block(body), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn extract_json_block_returns_none_without_markers() {
        assert_eq!(extract_json_block("no markers here"), None);
    }

    #[test]
    fn assistant_text_segment_reads_text_field() {
        let line = r#"{"type":"assistant","text":"hello"}"#;
        assert_eq!(assistant_text_segment(line), Some("hello".to_string()));
    }

    #[test]
    fn classify_stderr_detects_rate_limit() {
        assert_eq!(
            classify_stderr("Error: rate limit exceeded, 429"),
            Some(WorkerErrorKind::RateLimit)
        );
    }

    #[tokio::test]
    async fn invoke_extracts_json_from_worker_stdout() {
        let config = WorkerConfig {
            bin: "sh".into(),
            args: vec![
                "-c".into(),
                "printf 'before BEGIN_JSON {\"status\":\"complete\"} END_JSON after'".into(),
            ],
            output: WorkerOutput::Text,
        };
        let result = invoke(&config, "prompt text", Path::new("."), Duration::from_secs(5), |_| true)
            .await
            .unwrap();
        assert_eq!(
            result.json_block.as_deref(),
            Some("{\"status\":\"complete\"}")
        );
        assert!(!result.retried);
    }

    #[tokio::test]
    async fn invoke_retries_once_when_no_json_block_present() {
        let config = WorkerConfig {
            bin: "sh".into(),
            args: vec!["-c".into(), "printf 'no markers at all'".into()],
            output: WorkerOutput::Text,
        };
        let result = invoke(&config, "prompt text", Path::new("."), Duration::from_secs(5), |_| true)
            .await
            .unwrap();
        assert!(result.retried);
        assert!(result.json_block.is_none());
    }

    #[tokio::test]
    async fn invoke_retries_once_when_block_fails_phase_validation() {
        let config = WorkerConfig {
            bin: "sh".into(),
            args: vec![
                "-c".into(),
                "printf 'BEGIN_JSON {\"oops\":true} END_JSON'".into(),
            ],
            output: WorkerOutput::Text,
        };
        let result = invoke(&config, "prompt text", Path::new("."), Duration::from_secs(5), |json| {
            json.contains("status")
        })
        .await
        .unwrap();
        assert!(result.retried);
        assert_eq!(result.json_block.as_deref(), Some("{\"oops\":true}"));
    }
}
