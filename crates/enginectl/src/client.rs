//! In-process caller into the supervisor engine runtime.
//!
//! No HTTP daemon exists in this design (Section 2.1): a run is driven to
//! completion within the calling process, so this client is a thin wrapper
//! around `engined::driver` rather than a network client. It exists so
//! integration tests and this crate's binary have one call surface instead
//! of reimplementing preflight + tick-loop plumbing.

use engine_core::types::RunId;
use engine_core::Config;
use engined::driver::{self, DriveOutcome, DriverError};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub type ClientError = DriverError;
pub type Result<T> = std::result::Result<T, ClientError>;

/// Start a fresh run and drive it to STOPPED.
pub async fn create_run(config: &Config, repo_root: &Path, task_description: &str) -> Result<DriveOutcome> {
    driver::drive_new(config, repo_root, task_description, None).await
}

/// Start a fresh run, cooperatively cancellable via `cancel`.
pub async fn create_run_cancellable(
    config: &Config,
    repo_root: &Path,
    task_description: &str,
    cancel: &CancellationToken,
) -> Result<DriveOutcome> {
    driver::drive_new(config, repo_root, task_description, Some(cancel)).await
}

/// Reattach to an existing run by id and drive it to STOPPED.
pub async fn resume_run(
    config: &Config,
    repo_root: &Path,
    run_id: RunId,
    force: bool,
    task_description: &str,
) -> Result<DriveOutcome> {
    driver::drive_resume(config, repo_root, run_id, force, task_description, None).await
}
