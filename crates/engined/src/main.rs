//! engined - supervised execution runtime.
//!
//! Minimal plumbing entry point: load config, preflight a run (fresh or
//! resumed), and drive it to STOPPED. The operator-facing CLI surface is
//! out of scope; this binary exists to exercise the supervisor loop and
//! to give integration tests and `enginectl` a process to drive.

use clap::Parser;
use engine_core::types::RunId;
use engine_core::Config;
use engined::checkpoint;
use engined::driver;
use eyre::{Context, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engined")]
#[command(about = "Supervised execution runtime for unattended coding tasks")]
#[command(version)]
struct Args {
    /// Repository root containing the source checkout
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Config file path (key=value format); defaults are used if absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the task description fed to the planner worker
    #[arg(long)]
    task: Option<PathBuf>,

    /// Resume an existing run instead of starting a new one
    #[arg(long)]
    resume: Option<String>,

    /// Override environment-fingerprint and worktree-branch mismatches on resume
    #[arg(long)]
    force: bool,

    /// After the run stops, attempt to submit its checkpoint onto the
    /// configured integration branch
    #[arg(long)]
    submit: bool,

    /// Push the integration branch after a successful submit
    #[arg(long)]
    push: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let repo_root = args.repo.canonicalize().context("resolving repo root")?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context("loading config file")?,
        None => Config::default(),
    };
    config.resolve_paths(&repo_root);

    let task_description = match &args.task {
        Some(path) => std::fs::read_to_string(path).context("reading task description")?,
        None => String::new(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, requesting cancellation");
            ctrl_c_token.cancel();
        }
    });

    let outcome = match &args.resume {
        Some(run_id) => {
            driver::drive_resume(
                &config,
                &repo_root,
                RunId::from_string(run_id.clone()),
                args.force,
                &task_description,
                Some(&cancel),
            )
            .await
        }
        None => {
            driver::drive_new(&config, &repo_root, &task_description, Some(&cancel)).await
        }
    };

    let outcome = match outcome {
        Ok(o) => o,
        Err(err) => {
            error!(error = %err, "run driver failed");
            return Err(err.into());
        }
    };

    let exit_code = outcome
        .state
        .stop_reason
        .map(|r| r.family().exit_code())
        .unwrap_or(0);

    if args.submit {
        if let Some(sidecar_sha) = &outcome.state.checkpoint_commit_sha {
            let sidecar_present = outcome
                .store
                .read_checkpoint_sidecar(sidecar_sha)
                .ok()
                .flatten()
                .is_some();
            match checkpoint::submit(
                &outcome.worktree.path,
                &outcome.store,
                &outcome.state,
                &config.workflow,
                sidecar_present,
                args.push,
                false,
                chrono::Utc::now(),
            ) {
                Ok(result) => tracing::info!(?result, "submit completed"),
                Err(err) => error!(error = %err, "submit failed"),
            }
        }
    }

    std::process::exit(exit_code);
}
