//! Event log types (Section 3, 4.1, 6).
//!
//! An event is `(seq, timestamp, type, source, payload)`, appended once to
//! the run's `timeline.jsonl` and never edited or deleted. `seq` is
//! strictly increasing per run (Section 8, property 1).

use crate::types::{StopReason, Tier, WorkerErrorKind, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kind discriminant. Matches the `type` field stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunInit,
    PhaseTransition,
    PlanCompleted,
    ImplementCompleted,
    Verification,
    ReviewDecision,
    Checkpoint,
    Stop,
    WorktreeCreated,
    WorktreeRemoved,
    SubmitConflict,
    RunSubmitted,
    WorkerCall,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunInit => "run_init",
            Self::PhaseTransition => "phase_transition",
            Self::PlanCompleted => "plan_completed",
            Self::ImplementCompleted => "implement_completed",
            Self::Verification => "verification",
            Self::ReviewDecision => "review_decision",
            Self::Checkpoint => "checkpoint",
            Self::Stop => "stop",
            Self::WorktreeCreated => "worktree_created",
            Self::WorktreeRemoved => "worktree_removed",
            Self::SubmitConflict => "submit_conflict",
            Self::RunSubmitted => "run_submitted",
            Self::WorkerCall => "worker_call",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInitPayload {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransitionPayload {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCompletedPayload {
    pub milestone_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementCompletedPayload {
    pub milestone_index: usize,
    pub status: String,
    pub changed_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub milestone_index: usize,
    pub tier: Tier,
    pub ok: bool,
    pub failed_command: Option<String>,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecisionPayload {
    pub milestone_index: usize,
    pub decision: String,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub milestone_index: usize,
    pub commit_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPayload {
    pub reason: StopReason,
    pub family: String,
    pub phase: String,
    pub milestone_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeCreatedPayload {
    pub path: String,
    pub branch: String,
    pub base_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRemovedPayload {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConflictPayload {
    pub target_branch: String,
    pub commit_sha: String,
    pub conflicted_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSubmittedPayload {
    pub target_branch: String,
    pub commit_sha: String,
    pub pushed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCallPayload {
    pub worker: String,
    pub role: WorkerRole,
    pub duration_ms: u64,
    pub outcome: String,
    pub error_kind: Option<WorkerErrorKind>,
    pub retried: bool,
}

/// Union of all payload shapes. Untagged: the discriminant lives in
/// `Event::event_type`, not duplicated into the payload JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunInit(RunInitPayload),
    PhaseTransition(PhaseTransitionPayload),
    PlanCompleted(PlanCompletedPayload),
    ImplementCompleted(ImplementCompletedPayload),
    Verification(VerificationPayload),
    ReviewDecision(ReviewDecisionPayload),
    Checkpoint(CheckpointPayload),
    Stop(StopPayload),
    WorktreeCreated(WorktreeCreatedPayload),
    WorktreeRemoved(WorktreeRemovedPayload),
    SubmitConflict(SubmitConflictPayload),
    RunSubmitted(RunSubmittedPayload),
    WorkerCall(WorkerCallPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunInit(_) => EventType::RunInit,
            Self::PhaseTransition(_) => EventType::PhaseTransition,
            Self::PlanCompleted(_) => EventType::PlanCompleted,
            Self::ImplementCompleted(_) => EventType::ImplementCompleted,
            Self::Verification(_) => EventType::Verification,
            Self::ReviewDecision(_) => EventType::ReviewDecision,
            Self::Checkpoint(_) => EventType::Checkpoint,
            Self::Stop(_) => EventType::Stop,
            Self::WorktreeCreated(_) => EventType::WorktreeCreated,
            Self::WorktreeRemoved(_) => EventType::WorktreeRemoved,
            Self::SubmitConflict(_) => EventType::SubmitConflict,
            Self::RunSubmitted(_) => EventType::RunSubmitted,
            Self::WorkerCall(_) => EventType::WorkerCall,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A single appended timeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub payload: EventPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_payload_variant() {
        let payload = EventPayload::Checkpoint(CheckpointPayload {
            milestone_index: 2,
            commit_sha: "abc123".to_string(),
        });
        assert_eq!(payload.event_type(), EventType::Checkpoint);
        assert_eq!(payload.event_type().as_str(), "checkpoint");
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event {
            seq: 1,
            timestamp: Utc::now(),
            event_type: EventType::Stop,
            source: "supervisor".to_string(),
            payload: EventPayload::Stop(StopPayload {
                reason: StopReason::Complete,
                family: "success".to_string(),
                phase: "STOPPED".to_string(),
                milestone_index: Some(0),
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.seq, 1);
        assert_eq!(decoded.event_type, EventType::Stop);
    }

    #[test]
    fn submit_conflict_payload_serializes_sorted_files() {
        let payload = SubmitConflictPayload {
            target_branch: "main".to_string(),
            commit_sha: "deadbeef".to_string(),
            conflicted_files: vec!["b.rs".to_string(), "a.rs".to_string()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["conflicted_files"][0], "b.rs");
    }
}
