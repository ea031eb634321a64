//! Preflight (Section 2 "Data flow: CLI -> preflight (guards, config
//! snapshot, fingerprint) -> store init -> supervisor loop"): the checks
//! and setup that happen once, before a run's first tick.

use crate::git;
use crate::store::{Store, StoreError};
use crate::worktree::{self, Worktree, WorktreeError};
use chrono::{DateTime, Utc};
use engine_core::event::{EventPayload, WorktreeCreatedPayload};
use engine_core::fingerprint::{EnvFingerprint, FingerprintDrift, WorkerBinaryVersion};
use engine_core::state::RunState;
use engine_core::types::RunId;
use engine_core::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("repository worktree is dirty; commit or stash before starting a run")]
    DirtyRepo,
    #[error("no run found for {0}")]
    RunNotFound(String),
    #[error("no fingerprint recorded for {0}; cannot check for drift")]
    MissingFingerprint(String),
    #[error(
        "environment drift detected since this run started: {0:?}; rerun with --force to override"
    )]
    FingerprintDrift(FingerprintDrift),
    #[error("worktree branch mismatch: expected run branch, found {0}; rerun with --force")]
    WorktreeBranchMismatch(String),
}

pub type Result<T> = std::result::Result<T, PreflightError>;

/// Query `<bin> --version` for drift detection (Section 3 EnvFingerprint
/// "worker binary versions"). Workers that don't support the flag, or
/// aren't installed yet, contribute an "unknown" placeholder rather than
/// failing preflight outright.
fn worker_binary_version(bin: &Path) -> String {
    Command::new(bin)
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn capture_fingerprint(config: &Config, worktree_path: &Path, now: DateTime<Utc>) -> EnvFingerprint {
    let lockfile_hash = ["Cargo.lock", "package-lock.json", "poetry.lock", "go.sum"]
        .iter()
        .map(|name| worktree_path.join(name))
        .find(|p| p.exists())
        .and_then(|p| EnvFingerprint::hash_lockfile(&p).ok());

    let worker_binary_versions = config
        .workers
        .iter()
        .map(|(name, worker)| WorkerBinaryVersion {
            worker: name.clone(),
            version: worker_binary_version(&worker.bin),
        })
        .collect();

    EnvFingerprint {
        runtime_version: Command::new("rustc")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        lockfile_hash,
        worker_binary_versions,
        captured_at: now,
    }
}

/// Everything a fresh run needs before its first tick: a worktree, a run
/// store with config/fingerprint snapshots written, and an INIT-phase
/// `RunState` persisted as PLAN.
pub struct PreflightOutcome {
    pub store: Store,
    pub state: RunState,
    pub worktree: Worktree,
}

/// Set up a brand-new run (Section 4.8 INIT phase, implemented here rather
/// than as a supervisor phase handler since it runs once, outside the tick
/// loop, and needs the repository root rather than a worktree).
pub fn new_run(config: &Config, repo_root: &Path, run_id: RunId, now: DateTime<Utc>) -> Result<PreflightOutcome> {
    if config.workflow.require_clean_tree && !git::is_clean(repo_root)? {
        return Err(PreflightError::DirtyRepo);
    }

    let base_sha = git::head_sha(repo_root)?;
    let worktree = worktree::create(repo_root, run_id.as_ref(), &base_sha)?;

    let store = Store::init(&run_id, &config.runs_root)?;
    store.write_config_snapshot(config)?;
    let fingerprint = capture_fingerprint(config, &worktree.path, now);
    store.write_fingerprint(&fingerprint)?;

    store.append_event(
        "worktree_created",
        "preflight",
        EventPayload::WorktreeCreated(WorktreeCreatedPayload {
            path: worktree.path.display().to_string(),
            branch: worktree.branch.clone(),
            base_sha,
        }),
        now,
    )?;

    let state = RunState::init(run_id, config.scope.clone(), now);
    store.write_state(&state)?;

    Ok(PreflightOutcome { store, state, worktree })
}

/// Reattach to an existing run (resume path). Re-captures the environment
/// fingerprint and compares it against the one recorded at INIT; drift
/// blocks resume unless `force` is set (Section 3 EnvFingerprint).
pub fn resume(
    config: &Config,
    repo_root: &Path,
    run_id: RunId,
    force: bool,
    now: DateTime<Utc>,
) -> Result<PreflightOutcome> {
    let store = Store::open(&run_id, &config.runs_root)?;
    let state = store
        .read_state()?
        .ok_or_else(|| PreflightError::RunNotFound(run_id.to_string()))?;

    let baseline = store
        .read_fingerprint()?
        .ok_or_else(|| PreflightError::MissingFingerprint(run_id.to_string()))?;

    let base_sha = state
        .last_checkpoint_commit_sha
        .clone()
        .unwrap_or(git::head_sha(repo_root)?);
    let outcome = worktree::recreate(repo_root, run_id.as_ref(), &base_sha, force)?;
    if let Some(actual_branch) = outcome.branch_mismatch {
        return Err(PreflightError::WorktreeBranchMismatch(actual_branch));
    }
    let worktree = outcome.worktree;

    let current = capture_fingerprint(config, &worktree.path, now);
    let drift = current.diff(&baseline);
    if drift.has_drift() && !force {
        return Err(PreflightError::FingerprintDrift(drift));
    }
    store.write_fingerprint(&current)?;

    Ok(PreflightOutcome { store, state, worktree })
}
