//! Scope Guard (Section 4.2): decide whether a set of changed paths conform
//! to the frozen scope lock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The frozen allowlist/denylist/lockfile/env_allowlist set captured at
/// INIT (Section 3 RunState, GLOSSARY "Scope lock"). Never mutated after
/// capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeLock {
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub lockfiles: Vec<String>,
    pub env_allowlist: Vec<String>,
}

/// A reason a path set failed scope checking (Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    DirtyWorktree,
    ScopeViolation,
    LockfileRestricted,
}

impl ViolationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirtyWorktree => "dirty_worktree",
            Self::ScopeViolation => "scope_violation",
            Self::LockfileRestricted => "lockfile_restricted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub reasons: Vec<ViolationReason>,
    pub files_by_reason: BTreeMap<ViolationReason, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipViolation {
    pub violating_files: Vec<String>,
}

/// Match a single glob pattern against a path.
///
/// Standard shell glob with `**` for arbitrary depth. A directory pattern
/// (ending in `/`) matches as `prefix/**`. The `glob` crate's default match
/// options treat `*` as crossing path separators, which already gives the
/// arbitrary-depth behavior this needs without special-casing `**`.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = if let Some(prefix) = pattern.strip_suffix('/') {
        format!("{prefix}/**")
    } else {
        pattern.to_string()
    };
    glob::Pattern::new(&pattern).is_ok_and(|p| p.matches(path))
}

fn matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, path))
}

/// Normalize a changed-path set so that a rename `a -> b` is treated as
/// touching both `a` and `b` (Section 4.2, 8 boundary behavior).
///
/// `renames` is a list of `(from, to)` pairs; `other_paths` are
/// non-renamed changed paths.
pub fn expand_renames(other_paths: &[String], renames: &[(String, String)]) -> Vec<String> {
    let mut out: Vec<String> = other_paths.to_vec();
    for (from, to) in renames {
        out.push(from.clone());
        out.push(to.clone());
    }
    out.sort();
    out.dedup();
    out
}

/// Partition changed paths into semantic vs environmental (Section 4.2).
///
/// `is_ignored` queries the repository's ignore mechanism for a single
/// path. `Ok(true)` means the repository itself considers the path
/// ignored; `Ok(false)` means it does not; `Err(_)` means the query
/// failed, in which case this function is fail-safe strict: the path is
/// treated as semantic (never silently dropped as noise).
pub fn partition<F>(
    changed_paths: &[String],
    env_allowlist: &[String],
    is_ignored: F,
) -> (Vec<String>, Vec<String>)
where
    F: Fn(&str) -> Result<bool, ()>,
{
    let mut semantic = Vec::new();
    let mut environmental = Vec::new();
    for path in changed_paths {
        let env_match = matches_any(env_allowlist, path);
        let ignored = is_ignored(path).unwrap_or(false);
        if env_match || ignored {
            environmental.push(path.clone());
        } else {
            semantic.push(path.clone());
        }
    }
    (semantic, environmental)
}

/// Check semantic paths against the scope lock (Section 4.2).
///
/// Allowlist semantics: if non-empty, every semantic path must match at
/// least one allowlist pattern ("Empty allowlist: only denylist enforced",
/// Section 8). Denylist: no semantic path may match any denylist pattern.
/// Lockfiles: paths in the lockfile set are immutable unless
/// `allow_deps_flag` is set.
pub fn check(
    semantic_paths: &[String],
    scope_lock: &ScopeLock,
    allow_deps_flag: bool,
) -> Result<(), Violation> {
    let mut files_by_reason: BTreeMap<ViolationReason, Vec<String>> = BTreeMap::new();

    for path in semantic_paths {
        let allowlist_ok =
            scope_lock.allowlist.is_empty() || matches_any(&scope_lock.allowlist, path);
        let denylist_hit = matches_any(&scope_lock.denylist, path);
        if !allowlist_ok || denylist_hit {
            files_by_reason
                .entry(ViolationReason::ScopeViolation)
                .or_default()
                .push(path.clone());
        }

        if !allow_deps_flag && matches_any(&scope_lock.lockfiles, path) {
            files_by_reason
                .entry(ViolationReason::LockfileRestricted)
                .or_default()
                .push(path.clone());
        }
    }

    if files_by_reason.is_empty() {
        return Ok(());
    }

    let mut reasons: Vec<ViolationReason> = files_by_reason.keys().copied().collect();
    reasons.sort_by_key(|r| r.as_str());
    Err(Violation {
        reasons,
        files_by_reason,
    })
}

/// Check semantic paths against per-track ownership claims (Section 4.2,
/// 4.11). Only enforced when `owned_patterns` is non-empty.
pub fn check_ownership(
    semantic_paths: &[String],
    owned_patterns: &[String],
) -> Result<(), OwnershipViolation> {
    if owned_patterns.is_empty() {
        return Ok(());
    }
    let violating: Vec<String> = semantic_paths
        .iter()
        .filter(|p| !matches_any(owned_patterns, p))
        .cloned()
        .collect();
    if violating.is_empty() {
        Ok(())
    } else {
        Err(OwnershipViolation {
            violating_files: violating,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(allow: &[&str], deny: &[&str], locks: &[&str]) -> ScopeLock {
        ScopeLock {
            allowlist: allow.iter().map(|s| s.to_string()).collect(),
            denylist: deny.iter().map(|s| s.to_string()).collect(),
            lockfiles: locks.iter().map(|s| s.to_string()).collect(),
            env_allowlist: Vec::new(),
        }
    }

    #[test]
    fn empty_allowlist_only_enforces_denylist() {
        let l = lock(&[], &["config/**"], &[]);
        assert!(check(&["src/a.rs".to_string()], &l, false).is_ok());
        assert!(check(&["config/secrets".to_string()], &l, false).is_err());
    }

    #[test]
    fn non_empty_allowlist_requires_match() {
        let l = lock(&["src/**"], &[], &[]);
        assert!(check(&["src/a.rs".to_string()], &l, false).is_ok());
        let err = check(&["config/secrets".to_string()], &l, false).unwrap_err();
        assert!(err.reasons.contains(&ViolationReason::ScopeViolation));
    }

    #[test]
    fn lockfiles_restricted_unless_allow_deps() {
        let l = lock(&["**"], &[], &["Cargo.lock"]);
        let err = check(&["Cargo.lock".to_string()], &l, false).unwrap_err();
        assert!(err.reasons.contains(&ViolationReason::LockfileRestricted));
        assert!(check(&["Cargo.lock".to_string()], &l, true).is_ok());
    }

    #[test]
    fn directory_pattern_matches_prefix_arbitrary_depth() {
        assert!(pattern_matches("src/", "src/deep/nested/file.rs"));
        assert!(pattern_matches("src/**", "src/deep/nested/file.rs"));
        assert!(!pattern_matches("src/", "other/file.rs"));
    }

    #[test]
    fn rename_touches_both_paths() {
        let expanded = expand_renames(
            &["untouched.rs".to_string()],
            &[("old/path.rs".to_string(), "new/path.rs".to_string())],
        );
        assert!(expanded.contains(&"old/path.rs".to_string()));
        assert!(expanded.contains(&"new/path.rs".to_string()));
        assert!(expanded.contains(&"untouched.rs".to_string()));
    }

    #[test]
    fn partition_fails_safe_strict_on_ignore_query_error() {
        let (semantic, environmental) =
            partition(&["a.rs".to_string()], &[], |_| Err(()));
        assert_eq!(semantic, vec!["a.rs".to_string()]);
        assert!(environmental.is_empty());
    }

    #[test]
    fn partition_separates_env_allowlist_and_ignored_paths() {
        let (semantic, environmental) = partition(
            &["a.rs".to_string(), "target/debug/out".to_string(), "b.log".to_string()],
            &["*.log".to_string()],
            |p| Ok(p.starts_with("target/")),
        );
        assert_eq!(semantic, vec!["a.rs".to_string()]);
        assert_eq!(
            environmental,
            vec!["target/debug/out".to_string(), "b.log".to_string()]
        );
    }

    #[test]
    fn ownership_only_enforced_when_patterns_present() {
        assert!(check_ownership(&["x".to_string()], &[]).is_ok());
        let err = check_ownership(&["src/b/x".to_string()], &["src/a/**".to_string()]).unwrap_err();
        assert_eq!(err.violating_files, vec!["src/b/x".to_string()]);
    }
}
