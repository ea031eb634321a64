//! Phase output schemas and validation (Section 4.4).
//!
//! Each phase worker emits a JSON object matching one of these shapes.
//! Deserialization failure or a structurally present-but-invalid payload
//! both surface as a [`SchemaError`] so the worker adapter can decide
//! whether to retry with a stricter prompt.

use crate::milestone::Milestone;
use crate::types::{ImplementStatus, ReviewDecision};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("schema violation: {0}")]
    Violation(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Planner output: `{ milestones: [...] }`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerOutput {
    pub milestones: Vec<Milestone>,
}

impl PlannerOutput {
    pub fn parse(json: &str) -> Result<Self> {
        let out: Self = serde_json::from_str(json)?;
        if out.milestones.is_empty() {
            return Err(SchemaError::Violation(
                "milestones must be non-empty".to_string(),
            ));
        }
        Ok(out)
    }
}

/// Evidence accepted in lieu of file changes (Section 4.8 IMPLEMENT).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoChangesEvidence {
    #[serde(default)]
    pub files_checked: Vec<String>,
    #[serde(default)]
    pub grep_output: Option<String>,
    #[serde(default)]
    pub commands_run: Vec<CommandRun>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRun {
    pub command: String,
    pub exit_code: i32,
}

const MAX_GREP_OUTPUT_BYTES: usize = 8 * 1024;

impl NoChangesEvidence {
    /// Whether at least one accepted evidence form is present (Section 4.8).
    pub fn is_sufficient(&self, allowlist_matches: impl Fn(&str) -> bool) -> bool {
        let files_ok = !self.files_checked.is_empty()
            && self.files_checked.iter().all(|f| allowlist_matches(f));
        let grep_ok = self
            .grep_output
            .as_ref()
            .is_some_and(|g| !g.is_empty() && g.len() <= MAX_GREP_OUTPUT_BYTES);
        let commands_ok = self.commands_run.iter().any(|c| c.exit_code == 0);
        files_ok || grep_ok || commands_ok
    }
}

/// Implementer output (Section 4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct ImplementerOutput {
    pub status: ImplementStatus,
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub no_changes_evidence: Option<NoChangesEvidence>,
}

impl ImplementerOutput {
    pub fn parse(json: &str) -> Result<Self> {
        let out: Self = serde_json::from_str(json)?;
        Ok(out)
    }
}

/// A single machine-readable check in a reviewer's `request_changes` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCheck {
    #[serde(rename = "type")]
    pub check_type: String,
    pub command: String,
    pub requirement: String,
    pub current: String,
}

/// Reviewer output (Section 4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewerOutput {
    pub decision: ReviewDecision,
    pub feedback: String,
    #[serde(default)]
    pub checks: Vec<ReviewCheck>,
    /// Stable hash of the machine-readable payload; used for loop detection.
    /// The worker is expected to compute this, but an empty value is
    /// accepted and recomputed locally from `checks` if present.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl ReviewerOutput {
    pub fn parse(json: &str) -> Result<Self> {
        let out: Self = serde_json::from_str(json)?;
        Ok(out)
    }

    /// Compute the stable review fingerprint used for request_changes loop
    /// detection (Section 4.7, GLOSSARY "Fingerprint (review)").
    ///
    /// Hashes the machine-readable `checks` payload only, per the worker's
    /// own reported fingerprint if present, else a local recomputation. When
    /// `checks` is empty the fingerprint is not stable across trivial
    /// rewording (Section 9 open question); callers should treat an absent
    /// machine-readable payload conservatively (never collapse two reviews
    /// into a detected loop based on feedback text alone).
    pub fn stable_fingerprint(&self) -> Option<String> {
        if let Some(fp) = &self.fingerprint {
            if !fp.is_empty() {
                return Some(fp.clone());
            }
        }
        if self.checks.is_empty() {
            return None;
        }
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_string(&self.checks).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Some(format!("{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_output_requires_milestones() {
        let err = PlannerOutput::parse(r#"{"milestones":[]}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Violation(_)));
    }

    #[test]
    fn planner_output_parses_milestone_list() {
        let out = PlannerOutput::parse(
            r#"{"milestones":[{"goal":"g","files_expected":["src/**"],"done_checks":["c"],"risk_level":"low"}]}"#,
        )
        .unwrap();
        assert_eq!(out.milestones.len(), 1);
        assert_eq!(out.milestones[0].goal, "g");
    }

    #[test]
    fn implementer_output_parses_blocked_with_evidence() {
        let out = ImplementerOutput::parse(
            r#"{"status":"blocked","summary":"no-op","no_changes_evidence":{"commands_run":[{"command":"grep -r foo","exit_code":0}]}}"#,
        )
        .unwrap();
        assert_eq!(out.status, ImplementStatus::Blocked);
        assert!(out
            .no_changes_evidence
            .unwrap()
            .is_sufficient(|_| true));
    }

    #[test]
    fn no_changes_evidence_requires_one_accepted_form() {
        let ev = NoChangesEvidence::default();
        assert!(!ev.is_sufficient(|_| true));

        let ev = NoChangesEvidence {
            grep_output: Some("x".repeat(9000)),
            ..Default::default()
        };
        assert!(!ev.is_sufficient(|_| true));

        let ev = NoChangesEvidence {
            files_checked: vec!["src/lib.rs".to_string()],
            ..Default::default()
        };
        assert!(ev.is_sufficient(|f| f == "src/lib.rs"));
        assert!(!ev.is_sufficient(|_| false));
    }

    #[test]
    fn reviewer_fingerprint_is_stable_across_identical_checks() {
        let a = ReviewerOutput::parse(
            r#"{"decision":"request_changes","feedback":"a","checks":[{"type":"cmd","command":"x","requirement":"y","current":"z"}]}"#,
        )
        .unwrap();
        let b = ReviewerOutput::parse(
            r#"{"decision":"request_changes","feedback":"different wording entirely","checks":[{"type":"cmd","command":"x","requirement":"y","current":"z"}]}"#,
        )
        .unwrap();
        assert_eq!(a.stable_fingerprint(), b.stable_fingerprint());
    }

    #[test]
    fn reviewer_fingerprint_absent_without_checks() {
        let out = ReviewerOutput::parse(
            r#"{"decision":"request_changes","feedback":"please fix"}"#,
        )
        .unwrap();
        assert!(out.stable_fingerprint().is_none());
    }
}
