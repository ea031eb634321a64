//! Verification Engine (Section 4.3): runs the tier commands selected by
//! `engine_core::verify_policy` directly against argv (no intermediate
//! shell), enforcing a time budget per milestone and capturing combined
//! output for the run's artifacts.

use engine_core::types::Tier;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to parse command {cmd:?}: {source}")]
    Tokenize {
        cmd: String,
        source: shell_words::ParseError,
    },
    #[error("command {0:?} has no program to execute")]
    EmptyCommand(String),
    #[error("io error spawning {cmd}: {source}")]
    Spawn { cmd: String, source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, VerifyError>;

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub cmd: String,
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct TierOutcome {
    pub tier: Tier,
    pub passed: bool,
    pub time_budget_exhausted: bool,
    pub duration_ms: u64,
    pub commands: Vec<CommandOutcome>,
}

/// Run every command in a tier in order, stopping at the first non-zero
/// exit (Section 4.3 "first non-zero exit stops the tier"). `time_budget`
/// bounds the whole tier's wall-clock, not any single command; a command
/// that would start after the budget is exhausted is never launched and
/// the tier is marked `time_budget_exhausted`.
pub async fn run_tier(
    tier: Tier,
    commands: &[String],
    cwd: &Path,
    time_budget: Duration,
    max_output_bytes: usize,
) -> Result<TierOutcome> {
    let tier_start = Instant::now();
    let mut outcomes = Vec::with_capacity(commands.len());
    let mut passed = true;
    let mut time_budget_exhausted = false;

    for cmd in commands {
        let elapsed = tier_start.elapsed();
        if elapsed >= time_budget {
            time_budget_exhausted = true;
            passed = false;
            break;
        }
        let remaining = time_budget - elapsed;
        let outcome = run_command(cmd, cwd, remaining, max_output_bytes).await?;
        let command_passed = outcome.passed;
        outcomes.push(outcome);
        if !command_passed {
            passed = false;
            break;
        }
    }

    Ok(TierOutcome {
        tier,
        passed,
        time_budget_exhausted,
        duration_ms: tier_start.elapsed().as_millis() as u64,
        commands: outcomes,
    })
}

async fn run_command(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<CommandOutcome> {
    let argv = shell_words::split(cmd).map_err(|source| VerifyError::Tokenize {
        cmd: cmd.to_string(),
        source,
    })?;
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| VerifyError::EmptyCommand(cmd.to_string()))?;

    debug!(cmd, "running verification command");
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| VerifyError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            (status.ok().and_then(|s| s.code()), false)
        }
        () = tokio::time::sleep(timeout) => {
            if let Err(e) = child.kill().await {
                warn!(cmd, error = %e, "failed to kill verification command after timeout");
            }
            let _ = child.wait().await;
            (None, true)
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(h) = stdout_handle.as_mut() {
        let _ = h.read_to_end(&mut stdout).await;
    }
    if let Some(h) = stderr_handle.as_mut() {
        let _ = h.read_to_end(&mut stderr).await;
    }

    let mut combined = stdout;
    if !stderr.is_empty() {
        combined.extend_from_slice(b"\n--- stderr ---\n");
        combined.extend_from_slice(&stderr);
    }
    let truncated = combined.len() > max_output_bytes;
    if truncated {
        let skip = combined.len() - max_output_bytes;
        combined.drain(0..skip);
    }
    let mut output = String::from_utf8_lossy(&combined).into_owned();
    if truncated {
        output = format!("...[truncated]...\n{output}");
    }

    let passed = !timed_out && exit_code == Some(0);
    if !passed {
        warn!(cmd, exit_code = ?exit_code, timed_out, "verification command failed");
    }

    Ok(CommandOutcome {
        cmd: cmd.to_string(),
        exit_code,
        passed,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tier_stops_at_first_failure() {
        let commands = vec![
            "true".to_string(),
            "false".to_string(),
            "true".to_string(),
        ];
        let outcome = run_tier(Tier::Tier0, &commands, Path::new("."), Duration::from_secs(5), 4096)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.commands.len(), 2);
    }

    #[tokio::test]
    async fn tier_marks_budget_exhausted_before_launching_next() {
        let commands = vec!["sleep 1".to_string(), "true".to_string()];
        let outcome = run_tier(
            Tier::Tier0,
            &commands,
            Path::new("."),
            Duration::from_millis(50),
            4096,
        )
        .await
        .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.commands[0].timed_out || outcome.time_budget_exhausted);
    }

    #[tokio::test]
    async fn output_is_truncated_to_max_bytes() {
        let commands = vec!["printf 'abcdefghij'".to_string()];
        let outcome = run_tier(Tier::Tier0, &commands, Path::new("."), Duration::from_secs(5), 4)
            .await
            .unwrap();
        assert!(outcome.commands[0].output.contains("truncated"));
    }
}
