//! Scope Guard wiring (Section 4.2): adapts `engine_core::scope`'s pure
//! matching logic to the live repository by sourcing changed paths and
//! ignore-query results from git.

use crate::git;
use engine_core::scope::{self, OwnershipViolation, ScopeLock, Violation};
use std::path::Path;

/// Compute changed paths (with renames expanded) and partition them into
/// semantic vs environmental, against a worktree's current git state
/// (Section 4.2 `partition`).
pub fn partition_changed(
    worktree: &Path,
    env_allowlist: &[String],
) -> git::Result<(Vec<String>, Vec<String>)> {
    let mut paths = git::changed_paths(worktree)?;
    let renames = git::renamed_paths(worktree)?;
    paths = scope::expand_renames(&paths, &renames);
    let (semantic, environmental) =
        scope::partition(&paths, env_allowlist, |p| git::is_ignored(worktree, p));
    Ok((semantic, environmental))
}

/// Full guard check: partition, then validate the semantic set against
/// the frozen scope lock (Section 4.2 `check`).
pub fn check_worktree(
    worktree: &Path,
    scope_lock: &ScopeLock,
    allow_deps_flag: bool,
) -> git::Result<std::result::Result<Vec<String>, Violation>> {
    let (semantic, _environmental) = partition_changed(worktree, &scope_lock.env_allowlist)?;
    Ok(match scope::check(&semantic, scope_lock, allow_deps_flag) {
        Ok(()) => Ok(semantic),
        Err(v) => Err(v),
    })
}

/// Ownership check layered on top of a scope check (Section 4.11).
pub fn check_ownership(
    semantic_paths: &[String],
    owned_patterns: &[String],
) -> std::result::Result<(), OwnershipViolation> {
    scope::check_ownership(semantic_paths, owned_patterns)
}

/// Validate a milestone's `files_expected` against allow/deny lists
/// without touching the filesystem (Section 4.8 PLAN handler).
pub fn check_patterns(patterns: &[String], scope_lock: &ScopeLock) -> std::result::Result<(), Violation> {
    scope::check(patterns, scope_lock, true)
}
