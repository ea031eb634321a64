//! Orchestrator data model (Section 3, 4.11): tracks, ownership claims,
//! and the pure claim-normalization/intersection logic the scheduler
//! builds on.

use crate::types::{OrchestrationPolicy, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStep {
    pub task_file: String,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub owns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub steps: Vec<TrackStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Done,
    Stopped,
}

/// `OrchestrationState` (Section 3): tracks, active_runs (track -> run_id),
/// ownership_claims (pattern -> run_id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub tracks: Vec<Track>,
    pub active_runs: BTreeMap<String, RunId>,
    pub ownership_claims: BTreeMap<String, RunId>,
    pub step_states: BTreeMap<String, StepState>,
}

/// Normalize an ownership pattern to a canonical form (Section 8: idempotent,
/// `normalize(normalize(p)) == normalize(p)`).
///
/// Collapses repeated separators, strips a leading `./`, and strips a
/// trailing `/` in favor of an explicit `/**` suffix so directory patterns
/// and their expanded glob form compare equal.
pub fn normalize_claim(pattern: &str) -> String {
    let mut p = pattern.trim();
    while let Some(stripped) = p.strip_prefix("./") {
        p = stripped;
    }
    let collapsed: String = {
        let mut out = String::with_capacity(p.len());
        let mut prev_slash = false;
        for c in p.chars() {
            if c == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            out.push(c);
        }
        out
    };
    if let Some(prefix) = collapsed.strip_suffix('/') {
        format!("{prefix}/**")
    } else {
        collapsed
    }
}

/// Conservative glob-intersection check: two claims conflict if any pair
/// of patterns overlap. A pattern "overlaps" another if one is a prefix of
/// the other once `**`/`*` wildcards are stripped to their literal prefix,
/// which is the conservative approximation the specification calls for
/// (no attempt at exact glob-language intersection).
pub fn claims_conflict(a: &[String], b: &[String]) -> bool {
    a.iter().any(|pa| {
        let pa_norm = normalize_claim(pa);
        let pa_prefix = literal_prefix(&pa_norm);
        b.iter().any(|pb| {
            let pb_norm = normalize_claim(pb);
            let pb_prefix = literal_prefix(&pb_norm);
            pa_prefix.starts_with(&pb_prefix) || pb_prefix.starts_with(&pa_prefix)
        })
    })
}

fn literal_prefix(pattern: &str) -> String {
    pattern
        .split(['*', '?', '['])
        .next()
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for p in ["src/a/", "./src/b/**", "src//c/d", "./src/e/"] {
            let once = normalize_claim(p);
            let twice = normalize_claim(&once);
            assert_eq!(once, twice, "pattern {p}");
        }
    }

    #[test]
    fn overlapping_claims_conflict() {
        assert!(claims_conflict(
            &["src/a/**".to_string()],
            &["src/a/x/**".to_string()]
        ));
    }

    #[test]
    fn disjoint_claims_do_not_conflict() {
        assert!(!claims_conflict(
            &["src/a/**".to_string()],
            &["src/b/**".to_string()]
        ));
    }

    #[test]
    fn directory_pattern_normalizes_to_double_star_suffix() {
        assert_eq!(normalize_claim("src/a/"), "src/a/**");
    }
}
