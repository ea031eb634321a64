//! Drives a single run from preflight through every tick to STOPPED
//! (Section 2 "Data flow"). Shared by the `engined` binary and by
//! `enginectl`'s in-process programmatic caller so neither reimplements
//! the tick loop.

use crate::preflight::{self, PreflightError};
use crate::store::{Store, StoreError};
use crate::supervisor::{self, SupervisorError, TickContext};
use crate::worktree::Worktree;
use chrono::Utc;
use engine_core::config::Config;
use engine_core::state::RunState;
use engine_core::types::RunId;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Final state of a driven run, plus the handles needed to submit it.
pub struct DriveOutcome {
    pub state: RunState,
    pub store: Store,
    pub worktree: Worktree,
}

/// Preflight a brand-new run, then tick it to completion (Section 4.8).
pub async fn drive_new(
    config: &Config,
    repo_root: &Path,
    task_description: &str,
    cancel: Option<&CancellationToken>,
) -> Result<DriveOutcome> {
    let run_id = RunId::generate();
    let outcome = preflight::new_run(config, repo_root, run_id, Utc::now())?;
    info!(run_id = %outcome.state.run_id, "run created");
    run_loop(config, outcome.store, outcome.state, outcome.worktree, task_description, cancel).await
}

/// Reattach to an existing run and tick it to completion.
pub async fn drive_resume(
    config: &Config,
    repo_root: &Path,
    run_id: RunId,
    force: bool,
    task_description: &str,
    cancel: Option<&CancellationToken>,
) -> Result<DriveOutcome> {
    let outcome = preflight::resume(config, repo_root, run_id, force, Utc::now())?;
    info!(run_id = %outcome.state.run_id, "run resumed");
    run_loop(config, outcome.store, outcome.state, outcome.worktree, task_description, cancel).await
}

/// Tick a run to completion. Checked for cancellation once per tick, at
/// the same outermost loop boundary the watchdog evaluates at (Section
/// 4.9): a cancelled run persists its last state and returns without
/// setting `stop_reason`, so a later resume picks up where it left off.
async fn run_loop(
    config: &Config,
    store: Store,
    mut state: RunState,
    worktree: Worktree,
    task_description: &str,
    cancel: Option<&CancellationToken>,
) -> Result<DriveOutcome> {
    while !state.is_stopped() {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            info!(run_id = %state.run_id, "cancellation requested, persisting and exiting");
            store.write_state(&state)?;
            break;
        }
        let ctx = TickContext {
            store: &store,
            config,
            worktree: &worktree.path,
            task_description,
            now: Utc::now(),
        };
        state = supervisor::tick(&ctx, state).await?;
    }
    Ok(DriveOutcome { state, store, worktree })
}
