//! Checkpoint sidecar (Section 3, 4.1, 4.10). The authoritative metadata
//! for a checkpoint commit; git commit messages are advisory only.

use crate::types::Tier;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvidence {
    pub tier: Tier,
    pub commands: Vec<String>,
    pub exit_codes: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSidecar {
    pub run_id: String,
    pub milestone_index: usize,
    pub milestone_goal: String,
    pub verification_evidence: Vec<VerificationEvidence>,
    pub base_sha: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Consumed-only interface (Section 3): external tooling contributes
/// these; the core never produces them. Modeled as deserialize-only so
/// downstream audit tooling (out of scope) can read a run store this
/// codebase wrote without this codebase depending on that tooling.
#[derive(Debug, Clone, Deserialize)]
pub struct InterventionReceipt {
    pub base_sha: String,
    pub head_sha: String,
    pub run_id: String,
    pub reason: String,
    pub note: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trips_through_json() {
        let sidecar = CheckpointSidecar {
            run_id: "20260101000000".to_string(),
            milestone_index: 0,
            milestone_goal: "do nothing".to_string(),
            verification_evidence: vec![VerificationEvidence {
                tier: Tier::Tier0,
                commands: vec!["echo ok".to_string()],
                exit_codes: vec![0],
            }],
            base_sha: "deadbeef".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&sidecar).unwrap();
        let decoded: CheckpointSidecar = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.run_id, sidecar.run_id);
        assert_eq!(decoded.verification_evidence.len(), 1);
    }

    #[test]
    fn intervention_receipt_deserializes_from_external_json() {
        let json = r#"{"base_sha":"a","head_sha":"b","run_id":"r","reason":"manual_fix","note":"n"}"#;
        let receipt: InterventionReceipt = serde_json::from_str(json).unwrap();
        assert_eq!(receipt.reason, "manual_fix");
    }
}
