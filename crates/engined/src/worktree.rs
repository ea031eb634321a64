//! Worktree Manager (Section 4.5): maintains isolated filesystem checkouts
//! per run, outside the run-store tree so they never collide with a scope
//! lock's denylist patterns.

use crate::git;
use engine_core::prompt::sanitize_branch_name;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree setup left a dirty tree at {0}")]
    DirtyAfterSetup(PathBuf),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A created worktree's location and branch.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Symlinked dependency directory names to carry into a fresh worktree if
/// present in the source checkout (vendored/cached dependency trees that
/// are expensive to refetch per run).
const DEPENDENCY_DIRS: &[&str] = &["node_modules", "target", "vendor", ".venv"];

fn worktree_base_dir(repo_root: &Path, run_id: &str) -> PathBuf {
    // Sibling of the source checkout, never under it, so the run store's
    // denylist can never accidentally match worktree contents.
    repo_root
        .parent()
        .unwrap_or(repo_root)
        .join(format!(".{}-worktrees", repo_name(repo_root)))
        .join(run_id)
}

fn repo_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Create a fresh worktree for `run_id` branched from `base_sha`, symlink
/// dependency directories from `repo_root` if present, and inject ignore
/// patterns for them so they never show up as untracked changes (Section
/// 4.5 `create`).
pub fn create(repo_root: &Path, run_id: &str, base_sha: &str) -> Result<Worktree> {
    let branch = sanitize_branch_name(&format!("run/{run_id}"));
    let path = worktree_base_dir(repo_root, run_id);

    if !git::branch_exists(repo_root, &branch)? {
        git::create_branch(repo_root, &branch, base_sha)?;
    }
    git::create_worktree(repo_root, &path, &branch)?;

    let mut linked = Vec::new();
    for dep_dir in DEPENDENCY_DIRS {
        let source = repo_root.join(dep_dir);
        if source.exists() {
            let target = path.join(dep_dir);
            symlink(&source, &target)?;
            linked.push(format!("{dep_dir}/"));
        }
    }
    if !linked.is_empty() {
        git::add_excludes(&path, &linked)?;
    }

    if !git::is_clean(&path)? {
        return Err(WorktreeError::DirtyAfterSetup(path));
    }

    info!(run_id, branch = %branch, path = %path.display(), "worktree created");
    Ok(Worktree { path, branch })
}

#[cfg(unix)]
fn symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, target)
}

/// Outcome of `recreate`: whether an existing worktree's branch differed
/// from the one requested.
#[derive(Debug, Clone)]
pub struct RecreateOutcome {
    pub worktree: Worktree,
    pub branch_mismatch: Option<String>,
}

/// Idempotently ensure a worktree exists for `run_id` (Section 4.5
/// `recreate`). If one already exists at the expected path, reuse it and
/// report a branch mismatch rather than silently recreating unless
/// `force` is set.
pub fn recreate(repo_root: &Path, run_id: &str, base_sha: &str, force: bool) -> Result<RecreateOutcome> {
    let expected_branch = sanitize_branch_name(&format!("run/{run_id}"));
    let path = worktree_base_dir(repo_root, run_id);

    if path.exists() {
        let existing = git::list_worktrees(repo_root)?
            .into_iter()
            .find(|(p, _)| Path::new(p) == path);
        if let Some((_, actual_branch)) = existing {
            if actual_branch == expected_branch {
                return Ok(RecreateOutcome {
                    worktree: Worktree {
                        path,
                        branch: actual_branch,
                    },
                    branch_mismatch: None,
                });
            }
            if !force {
                return Ok(RecreateOutcome {
                    worktree: Worktree {
                        path,
                        branch: actual_branch.clone(),
                    },
                    branch_mismatch: Some(actual_branch),
                });
            }
            remove(repo_root, &path)?;
        }
    }

    let worktree = create(repo_root, run_id, base_sha)?;
    Ok(RecreateOutcome {
        worktree,
        branch_mismatch: None,
    })
}

/// Remove a worktree, reclaiming disk without touching the run store.
pub fn remove(repo_root: &Path, path: &Path) -> Result<()> {
    git::remove_worktree(repo_root, path, true)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub removed: Vec<PathBuf>,
    pub retained: Vec<PathBuf>,
}

/// Reclaim worktrees older than `older_than_days` (Section 4.5 `gc`).
/// `dry_run` reports what would be removed without touching anything.
pub fn gc(repo_root: &Path, older_than_days: u64, dry_run: bool) -> Result<GcReport> {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(older_than_days * 86_400))
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

    let mut report = GcReport::default();
    for (path_str, _branch) in git::list_worktrees(repo_root)? {
        let path = PathBuf::from(&path_str);
        if path == repo_root {
            continue;
        }
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        let stale = modified.is_some_and(|m| m < cutoff);
        if stale {
            if dry_run {
                report.removed.push(path);
            } else {
                match remove(repo_root, &path) {
                    Ok(()) => report.removed.push(path),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "worktree gc failed to remove");
                        report.retained.push(path);
                    }
                }
            }
        } else {
            report.retained.push(path);
        }
    }
    Ok(report)
}
