//! enginectl - minimal programmatic caller for the supervisor engine.
//!
//! The operator-facing CLI surface is out of scope for this runtime; this
//! binary is retained as plumbing so integration tests and local
//! experimentation have a process that drives a run end to end without
//! reimplementing `engined`'s own entry point.

mod client;
mod render;

use clap::Parser;
use engine_core::types::RunId;
use engine_core::Config;
use eyre::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "enginectl")]
#[command(about = "Drive a supervised execution run from the command line")]
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

    /// Allow IMPLEMENT to touch lockfile paths instead of treating them as immutable
    #[arg(long)]
    allow_deps: bool,
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
    config.allow_deps_flag = config.allow_deps_flag || args.allow_deps;

    let task_description = match &args.task {
        Some(path) => std::fs::read_to_string(path).context("reading task description")?,
        None => String::new(),
    };

    let outcome = match &args.resume {
        Some(run_id) => {
            client::resume_run(
                &config,
                &repo_root,
                RunId::from_string(run_id.clone()),
                args.force,
                &task_description,
            )
            .await
        }
        None => client::create_run(&config, &repo_root, &task_description).await,
    };

    let outcome = outcome.context("run driver failed")?;
    render::print_run_stopped(&outcome.state);

    let exit_code = outcome
        .state
        .stop_reason
        .map(|r| r.family().exit_code())
        .unwrap_or(0);
    std::process::exit(exit_code);
}
