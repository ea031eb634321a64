//! Checkpoint / Submit (Section 4.10): commits a milestone's verified
//! changes with a metadata sidecar, and submits checkpoint commits onto an
//! integration branch via cherry-pick with fail-fast validation and
//! guaranteed cleanup.

use crate::git;
use crate::store::Store;
use chrono::{DateTime, Utc};
use engine_core::config::WorkflowConfig;
use engine_core::event::{EventPayload, RunSubmittedPayload, SubmitConflictPayload};
use engine_core::sidecar::CheckpointSidecar;
use engine_core::state::RunState;
use std::path::Path;
use thiserror::Error;
use tracing::info;

const CHECKPOINT_MESSAGE_PREFIX: &str = "checkpoint:";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error("no checkpoint commit recorded for this run")]
    NoCheckpoint,
    #[error("run is not terminal")]
    NotTerminal,
    #[error("working tree is not clean")]
    DirtyTree,
    #[error("target branch {0} does not exist")]
    TargetBranchMissing(String),
    #[error("verification evidence required but absent")]
    VerificationMissing,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Commit the current worktree state as a checkpoint, deriving the commit
/// message from the milestone goal and writing the sidecar keyed by the
/// resulting SHA (Section 4.1, 4.10).
pub fn checkpoint(
    worktree: &Path,
    store: &Store,
    state: &RunState,
    sidecar: CheckpointSidecar,
) -> Result<String> {
    let milestone_goal = state
        .current_milestone()
        .map(|m| m.goal.as_str())
        .unwrap_or("(no milestone)");
    let message = format!(
        "{CHECKPOINT_MESSAGE_PREFIX} milestone {} — {}",
        state.milestone_index, milestone_goal
    );
    git::stage_all(worktree)?;
    let sha = git::commit(worktree, &message)?;
    store.write_checkpoint_sidecar(&sha, &sidecar)?;
    info!(sha = %sha, milestone_index = state.milestone_index, "checkpoint committed");
    Ok(sha)
}

/// One fail-fast validation step from Section 4.10's submit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    NoCheckpointSha,
    NotTerminal,
    DirtyTree,
    TargetBranchMissing(String),
    VerificationMissing,
}

/// Run submit validation in the specified order, stopping at the first
/// failure (Section 4.10 "fail-fast, single actionable error").
pub fn validate(worktree: &Path, state: &RunState, workflow: &WorkflowConfig, sidecar_present: bool) -> Option<ValidationFailure> {
    if state.checkpoint_commit_sha.is_none() {
        return Some(ValidationFailure::NoCheckpointSha);
    }
    if !state.is_stopped() {
        return Some(ValidationFailure::NotTerminal);
    }
    if workflow.require_clean_tree {
        match git::is_clean(worktree) {
            Ok(true) => {}
            _ => return Some(ValidationFailure::DirtyTree),
        }
    }
    match git::branch_exists(worktree, &workflow.integration_branch) {
        Ok(true) => {}
        _ => return Some(ValidationFailure::TargetBranchMissing(workflow.integration_branch.clone())),
    }
    if workflow.require_verification && !sidecar_present {
        return Some(ValidationFailure::VerificationMissing);
    }
    None
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Submitted { target_branch: String, commit_sha: String, pushed: bool },
    Conflict { target_branch: String, commit_sha: String, conflicted_files: Vec<String> },
}

/// Execute the submit operation: checkout the target branch, cherry-pick
/// the checkpoint commit, and restore the starting branch no matter the
/// outcome (Section 4.10 "guaranteed cleanup block"). Appends a
/// `submit_conflict` or `run_submitted` event once the outcome is known,
/// before the cleanup checkout runs.
///
/// `dry_run` performs validation only and never mutates branch or file
/// state, and appends no event.
pub fn submit(
    worktree: &Path,
    store: &Store,
    state: &RunState,
    workflow: &WorkflowConfig,
    sidecar_present: bool,
    push: bool,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<SubmitOutcome> {
    if let Some(failure) = validate(worktree, state, workflow, sidecar_present) {
        return Err(match failure {
            ValidationFailure::NoCheckpointSha => CheckpointError::NoCheckpoint,
            ValidationFailure::NotTerminal => CheckpointError::NotTerminal,
            ValidationFailure::DirtyTree => CheckpointError::DirtyTree,
            ValidationFailure::TargetBranchMissing(b) => CheckpointError::TargetBranchMissing(b),
            ValidationFailure::VerificationMissing => CheckpointError::VerificationMissing,
        });
    }

    let commit_sha = state
        .checkpoint_commit_sha
        .clone()
        .ok_or(CheckpointError::NoCheckpoint)?;
    let target_branch = workflow.integration_branch.clone();

    if dry_run {
        return Ok(SubmitOutcome::Submitted {
            target_branch,
            commit_sha,
            pushed: false,
        });
    }

    let starting_branch = git::current_branch(worktree)?;
    let result = run_submit(worktree, &target_branch, &commit_sha, push);

    if let Ok(outcome) = &result {
        let payload = match outcome {
            SubmitOutcome::Conflict { target_branch, commit_sha, conflicted_files } => {
                EventPayload::SubmitConflict(SubmitConflictPayload {
                    target_branch: target_branch.clone(),
                    commit_sha: commit_sha.clone(),
                    conflicted_files: conflicted_files.clone(),
                })
            }
            SubmitOutcome::Submitted { target_branch, commit_sha, pushed } => {
                EventPayload::RunSubmitted(RunSubmittedPayload {
                    target_branch: target_branch.clone(),
                    commit_sha: commit_sha.clone(),
                    pushed: *pushed,
                })
            }
        };
        let event_type = payload.event_type();
        store.append_event(event_type.as_str(), "submit", payload, now)?;
    }

    // Guaranteed cleanup: always attempt to restore the starting branch,
    // regardless of how the submit attempt concluded.
    let _ = git::checkout(worktree, &starting_branch);

    result
}

fn run_submit(worktree: &Path, target_branch: &str, commit_sha: &str, push: bool) -> Result<SubmitOutcome> {
    git::checkout(worktree, target_branch)?;
    match git::cherry_pick(worktree, commit_sha)? {
        git::CherryPickOutcome::Conflict(conflicted_files) => Ok(SubmitOutcome::Conflict {
            target_branch: target_branch.to_string(),
            commit_sha: commit_sha.to_string(),
            conflicted_files,
        }),
        git::CherryPickOutcome::Applied => {
            let pushed = if push {
                git::push(worktree, target_branch).is_ok()
            } else {
                false
            };
            Ok(SubmitOutcome::Submitted {
                target_branch: target_branch.to_string(),
                commit_sha: commit_sha.to_string(),
                pushed,
            })
        }
    }
}

pub fn checkpoint_commit_timestamp() -> chrono::DateTime<chrono::Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::scope::ScopeLock;
    use engine_core::sidecar::VerificationEvidence;
    use engine_core::types::{RunId, Tier};
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "tester"],
        ] {
            StdCommand::new("git").args(&args).current_dir(root).output().unwrap();
        }
        std::fs::write(root.join("a.txt"), "hello").unwrap();
        StdCommand::new("git").args(["add", "-A"]).current_dir(root).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(root)
            .output()
            .unwrap();
        dir
    }

    fn sample_state(checkpoint_sha: Option<String>, stopped: bool) -> RunState {
        let mut state = RunState::init(
            RunId::from_string("20260101000000"),
            ScopeLock {
                allowlist: vec![],
                denylist: vec![],
                lockfiles: vec![],
                env_allowlist: vec![],
            },
            Utc::now(),
        );
        state.checkpoint_commit_sha = checkpoint_sha;
        if stopped {
            state.stop(engine_core::types::StopReason::Complete, Utc::now());
        }
        state
    }

    #[test]
    fn validate_requires_checkpoint_sha_first() {
        let dir = init_repo();
        let state = sample_state(None, true);
        let workflow = WorkflowConfig::default();
        assert_eq!(
            validate(dir.path(), &state, &workflow, true),
            Some(ValidationFailure::NoCheckpointSha)
        );
    }

    #[test]
    fn validate_requires_terminal_state() {
        let dir = init_repo();
        let state = sample_state(Some("deadbeef".to_string()), false);
        let workflow = WorkflowConfig::default();
        assert_eq!(
            validate(dir.path(), &state, &workflow, true),
            Some(ValidationFailure::NotTerminal)
        );
    }

    #[test]
    fn submit_conflict_restores_starting_branch_and_leaves_clean_tree() {
        let dir = init_repo();
        let root = dir.path();
        let base = git::head_sha(root).unwrap();
        let trunk = git::current_branch(root).unwrap();

        git::create_branch(root, "run-branch", &base).unwrap();
        git::checkout(root, "run-branch").unwrap();
        std::fs::write(root.join("a.txt"), "run-change").unwrap();
        git::stage_all(root).unwrap();
        let checkpoint_sha = git::commit(root, "checkpoint: milestone 0 — do thing").unwrap();

        git::checkout(root, &trunk).unwrap();
        std::fs::write(root.join("a.txt"), "main-change").unwrap();
        git::stage_all(root).unwrap();
        git::commit(root, "conflicting main change").unwrap();
        git::checkout(root, "run-branch").unwrap();

        let mut state = sample_state(Some(checkpoint_sha.clone()), true);
        state.milestone_index = 0;
        let mut workflow = WorkflowConfig::default();
        workflow.integration_branch = trunk.clone();

        let run_id = RunId::from_string("20260101000002");
        let store = Store::init(&run_id, root.parent().unwrap()).unwrap();
        let outcome = submit(root, &store, &state, &workflow, true, false, false, Utc::now()).unwrap();
        match outcome {
            SubmitOutcome::Conflict { conflicted_files, .. } => {
                assert_eq!(conflicted_files, vec!["a.txt".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(git::is_clean(root).unwrap());
        assert_eq!(git::current_branch(root).unwrap(), "run-branch");

        let timeline = store.read_timeline().unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event_type == engine_core::event::EventType::SubmitConflict));
    }

    #[test]
    fn checkpoint_writes_sidecar_keyed_by_commit_sha() {
        let dir = init_repo();
        let root = dir.path();
        let run_id = RunId::from_string("20260101000001");
        let store = Store::init(&run_id, root.parent().unwrap()).unwrap();
        std::fs::write(root.join("a.txt"), "changed").unwrap();

        let state = sample_state(None, false);
        let sidecar = CheckpointSidecar {
            run_id: run_id.to_string(),
            milestone_index: 0,
            milestone_goal: "do thing".to_string(),
            verification_evidence: vec![VerificationEvidence {
                tier: Tier::Tier0,
                commands: vec!["true".to_string()],
                exit_codes: vec![0],
            }],
            base_sha: git::head_sha(root).unwrap(),
            timestamp: Utc::now(),
        };
        let sha = checkpoint(root, &store, &state, sidecar).unwrap();
        let read_back = store.read_checkpoint_sidecar(&sha).unwrap();
        assert!(read_back.is_some());
    }
}
