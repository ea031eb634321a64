//! Git shell-out primitives shared by the worktree manager and the
//! checkpoint/submit module.
//!
//! Every operation shells out to the `git` binary directly (no `sh -c`
//! wrapper) and returns a typed error on a non-zero exit. Higher-level
//! modules compose these into the worktree and checkpoint contracts from
//! the run specification.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {stderr}",
            args.join(" ")
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// `git rev-parse HEAD` in `cwd`.
pub fn head_sha(cwd: &Path) -> Result<String> {
    run(cwd, &["rev-parse", "HEAD"])
}

/// `git rev-parse --abbrev-ref HEAD` in `cwd`.
pub fn current_branch(cwd: &Path) -> Result<String> {
    run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn branch_exists(cwd: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(cwd)
        .output()?;
    Ok(output.status.success())
}

pub fn create_branch(cwd: &Path, branch: &str, base_sha: &str) -> Result<()> {
    run(cwd, &["branch", branch, base_sha])?;
    Ok(())
}

/// Whether `cwd`'s working tree has no uncommitted changes.
pub fn is_clean(cwd: &Path) -> Result<bool> {
    let status = run(cwd, &["status", "--porcelain"])?;
    Ok(status.is_empty())
}

/// List changed paths against the index/working tree as repo-root-relative
/// paths, including both sides of a rename (Section 4.2).
pub fn changed_paths(cwd: &Path) -> Result<Vec<String>> {
    let status = run(cwd, &["status", "--porcelain"])?;
    let mut paths = Vec::new();
    for line in status.lines() {
        if line.len() < 4 {
            continue;
        }
        let rest = &line[3..];
        if let Some((from, to)) = rest.split_once(" -> ") {
            paths.push(from.trim().to_string());
            paths.push(to.trim().to_string());
        } else {
            paths.push(rest.trim().to_string());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Renamed paths detected in the working tree, as `(from, to)` pairs
/// (Section 4.2 "renames count as touching both old and new paths").
pub fn renamed_paths(cwd: &Path) -> Result<Vec<(String, String)>> {
    let status = run(cwd, &["status", "--porcelain"])?;
    let mut renames = Vec::new();
    for line in status.lines() {
        if line.len() < 4 || !line.starts_with('R') {
            continue;
        }
        let rest = &line[3..];
        if let Some((from, to)) = rest.split_once(" -> ") {
            renames.push((from.trim().to_string(), to.trim().to_string()));
        }
    }
    Ok(renames)
}

/// Query whether the repository's own ignore mechanism considers `path`
/// ignored (Section 4.2 `partition`). `Err` means the query itself failed
/// (distinct from "not ignored"); callers must treat that as fail-safe
/// strict per the scope guard contract.
pub fn is_ignored(cwd: &Path, path: &str) -> std::result::Result<bool, ()> {
    let output = Command::new("git")
        .args(["check-ignore", "-q", path])
        .current_dir(cwd)
        .output()
        .map_err(|_| ())?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(()),
    }
}

pub fn create_worktree(repo_root: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    run(
        repo_root,
        &[
            "worktree",
            "add",
            worktree_path.to_string_lossy().as_ref(),
            branch,
        ],
    )?;
    Ok(())
}

pub fn remove_worktree(repo_root: &Path, worktree_path: &Path, force: bool) -> Result<()> {
    let path = worktree_path.to_string_lossy().to_string();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path);
    run(repo_root, &args)?;
    Ok(())
}

/// `(worktree_path, branch)` pairs from `git worktree list --porcelain`.
pub fn list_worktrees(repo_root: &Path) -> Result<Vec<(String, String)>> {
    let porcelain = run(repo_root, &["worktree", "list", "--porcelain"])?;
    let mut out = Vec::new();
    let mut cur_path: Option<String> = None;
    let mut cur_branch: Option<String> = None;
    for line in porcelain.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(branch)) = (cur_path.take(), cur_branch.take()) {
                out.push((path, branch));
            }
            cur_path = Some(p.to_string());
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            cur_branch = Some(b.to_string());
        } else if line.is_empty() {
            if let (Some(path), Some(branch)) = (cur_path.take(), cur_branch.take()) {
                out.push((path, branch));
            }
        }
    }
    if let (Some(path), Some(branch)) = (cur_path, cur_branch) {
        out.push((path, branch));
    }
    Ok(out)
}

/// Append patterns to the repository's local (non-tracked) exclude file
/// (`.git/info/exclude`), additive and idempotent (Section 4.5).
pub fn add_excludes(repo_root: &Path, patterns: &[String]) -> Result<()> {
    let git_dir = run(repo_root, &["rev-parse", "--git-dir"])?;
    let exclude_path = repo_root.join(git_dir).join("info").join("exclude");
    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    let mut existing_lines: std::collections::HashSet<&str> = existing.lines().collect();
    let mut to_add = Vec::new();
    for pattern in patterns {
        if !existing_lines.contains(pattern.as_str()) {
            to_add.push(pattern.clone());
            existing_lines.insert(pattern.as_str());
        }
    }
    if to_add.is_empty() {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for pattern in &to_add {
        content.push_str(pattern);
        content.push('\n');
    }
    std::fs::write(&exclude_path, content)?;
    Ok(())
}

pub fn stage_all(cwd: &Path) -> Result<()> {
    run(cwd, &["add", "-A"])?;
    Ok(())
}

pub fn commit(cwd: &Path, message: &str) -> Result<String> {
    run(cwd, &["commit", "-m", message, "--allow-empty"])?;
    head_sha(cwd)
}

pub fn checkout(cwd: &Path, branch: &str) -> Result<()> {
    run(cwd, &["checkout", branch])?;
    Ok(())
}

/// Cherry-pick `commit_sha` onto the currently checked-out branch. On
/// conflict, aborts the cherry-pick and returns the sorted list of
/// conflicted files (Section 4.10).
pub fn cherry_pick(cwd: &Path, commit_sha: &str) -> Result<CherryPickOutcome> {
    let output = Command::new("git")
        .args(["cherry-pick", commit_sha])
        .current_dir(cwd)
        .output()?;
    if output.status.success() {
        return Ok(CherryPickOutcome::Applied);
    }
    let conflicted = conflicted_files(cwd)?;
    let _ = Command::new("git")
        .args(["cherry-pick", "--abort"])
        .current_dir(cwd)
        .output();
    Ok(CherryPickOutcome::Conflict(conflicted))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    Applied,
    Conflict(Vec<String>),
}

fn conflicted_files(cwd: &Path) -> Result<Vec<String>> {
    let out = run(cwd, &["diff", "--name-only", "--diff-filter=U"])?;
    let mut files: Vec<String> = out.lines().map(str::to_string).collect();
    files.sort();
    Ok(files)
}

pub fn push(cwd: &Path, branch: &str) -> Result<()> {
    run(cwd, &["push", "origin", branch])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn is_clean_detects_dirty_tree() {
        let dir = init_repo();
        assert!(is_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        assert!(!is_clean(dir.path()).unwrap());
    }

    #[test]
    fn changed_paths_reports_new_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let changed = changed_paths(dir.path()).unwrap();
        assert_eq!(changed, vec!["b.txt".to_string()]);
    }

    #[test]
    fn add_excludes_is_additive_and_idempotent() {
        let dir = init_repo();
        add_excludes(dir.path(), &["vendor/".to_string()]).unwrap();
        add_excludes(dir.path(), &["vendor/".to_string()]).unwrap();
        let content =
            std::fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert_eq!(content.matches("vendor/").count(), 1);
    }

    #[test]
    fn commit_and_cherry_pick_conflict_leaves_tree_clean() {
        let dir = init_repo();
        let root = dir.path();
        let base = head_sha(root).unwrap();
        let trunk = current_branch(root).unwrap();
        create_branch(root, "feature", &base).unwrap();
        checkout(root, "feature").unwrap();
        std::fs::write(root.join("a.txt"), "feature-change").unwrap();
        stage_all(root).unwrap();
        let sha = commit(root, "change a").unwrap();

        checkout(root, &trunk).unwrap();
        std::fs::write(root.join("a.txt"), "master-change").unwrap();
        stage_all(root).unwrap();
        commit(root, "conflicting change").unwrap();

        let outcome = cherry_pick(root, &sha).unwrap();
        assert!(matches!(outcome, CherryPickOutcome::Conflict(_)));
        assert!(is_clean(root).unwrap());
        assert_eq!(current_branch(root).unwrap(), trunk);
    }
}
