//! RunState: the mutable record carried across every supervisor tick
//! (Section 3).

use crate::milestone::Milestone;
use crate::scope::ScopeLock;
use crate::sidecar::VerificationEvidence;
use crate::types::{Phase, RunId, StopReason, WorkerErrorKind};
use crate::verify_policy::TierSelection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

/// Per-run counters for worker invocations. Monotonically non-decreasing
/// across the life of a run (Section 3 RunState invariants).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub plan_calls: u32,
    pub implement_calls: u32,
    pub review_calls: u32,
    pub parse_retries: u32,
}

#[derive(Debug, Error)]
pub enum StateInvariantError {
    #[error("run_id changed after INIT: {before} -> {after}")]
    RunIdChanged { before: String, after: String },
    #[error("milestone_index {index} out of range for {count} milestones in phase {phase}")]
    MilestoneIndexOutOfRange {
        index: usize,
        count: usize,
        phase: &'static str,
    },
    #[error("milestone_retries {0} exceeds maximum of 3")]
    MilestoneRetriesExceeded(u32),
    #[error("stop_reason set but phase is not STOPPED (phase={0})")]
    StopReasonWithoutStoppedPhase(&'static str),
    #[error("phase is STOPPED but stop_reason is not set")]
    StoppedPhaseWithoutStopReason,
    #[error("worker_stats counter decreased: {field} {before} -> {after}")]
    CounterDecreased {
        field: &'static str,
        before: u32,
        after: u32,
    },
    #[error("updated_at went backwards: {before} -> {after}")]
    TimeWentBackwards {
        before: DateTime<Utc>,
        after: DateTime<Utc>,
    },
}

/// Mutable per-run state (Section 3). Every mutation is produced by a
/// phase handler and persisted by the run store as a whole-file replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: RunId,
    pub phase: Phase,
    pub milestones: Vec<Milestone>,
    pub milestone_index: usize,
    pub milestone_retries: u32,
    pub scope_lock: ScopeLock,
    pub tier_reasons: Vec<TierSelection>,
    pub worker_stats: WorkerStats,
    pub stop_reason: Option<StopReason>,
    pub checkpoint_commit_sha: Option<String>,
    pub last_checkpoint_commit_sha: Option<String>,
    pub last_progress_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tick_count: u32,
    pub last_review_fingerprint: Option<String>,
    pub consecutive_review_loops: u32,

    /// Fix instructions carried into the next IMPLEMENT call: either a
    /// VERIFY failure summary or REVIEW `request_changes`/`reject`
    /// feedback (Section 4.8 IMPLEMENT "optional fix instructions").
    /// Cleared once consumed by the IMPLEMENT handler.
    pub pending_fix_instructions: Option<String>,

    /// Changed files reported by the most recent IMPLEMENT call, carried
    /// into VERIFY/REVIEW prompts and the CHECKPOINT sidecar.
    pub last_changed_files: Vec<String>,

    /// Verification evidence accumulated across tiers for the current
    /// milestone, reset at MILESTONE_START; written into the checkpoint
    /// sidecar on CHECKPOINT (Section 3 CheckpointSidecar).
    pub milestone_verification_evidence: Vec<VerificationEvidence>,

    /// Error kind of the most recent worker-process failure, if any,
    /// carried for a terminal diagnosis (Section 4.9 DiagnosisContext).
    pub last_worker_error_kind: Option<WorkerErrorKind>,

    /// Raw body of the most recent worker call that failed to parse,
    /// truncated by the caller before display.
    pub last_parse_error_body: Option<String>,

    /// The verification command that most recently failed, kept for a
    /// terminal diagnosis even after milestone-scoped state resets.
    pub last_verification_failed_command: Option<String>,
}

impl RunState {
    /// Construct the initial state for a freshly created run (INIT phase
    /// handler, Section 4.8).
    pub fn init(run_id: RunId, scope_lock: ScopeLock, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            phase: Phase::Plan,
            milestones: Vec::new(),
            milestone_index: 0,
            milestone_retries: 0,
            scope_lock,
            tier_reasons: Vec::new(),
            worker_stats: WorkerStats::default(),
            stop_reason: None,
            checkpoint_commit_sha: None,
            last_checkpoint_commit_sha: None,
            last_progress_at: now,
            created_at: now,
            updated_at: now,
            tick_count: 0,
            last_review_fingerprint: None,
            consecutive_review_loops: 0,
            pending_fix_instructions: None,
            last_changed_files: Vec::new(),
            milestone_verification_evidence: Vec::new(),
            last_worker_error_kind: None,
            last_parse_error_body: None,
            last_verification_failed_command: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.phase, Phase::Stopped)
    }

    pub fn current_milestone(&self) -> Option<&Milestone> {
        self.milestones.get(self.milestone_index)
    }

    pub fn is_last_milestone(&self) -> bool {
        !self.milestones.is_empty() && self.milestone_index + 1 == self.milestones.len()
    }

    /// Transition to STOPPED with a classified reason.
    pub fn stop(&mut self, reason: StopReason, now: DateTime<Utc>) {
        self.phase = Phase::Stopped;
        self.stop_reason = Some(reason);
        self.updated_at = now;
    }

    /// Reset the milestone-scoped counters and accumulators (Section 3
    /// SPEC_FULL "MILESTONE_START ... milestone-scoped counters reset at
    /// a single well-defined point").
    pub fn reset_milestone_scope(&mut self) {
        self.milestone_retries = 0;
        self.tier_reasons.clear();
        self.milestone_verification_evidence.clear();
        self.consecutive_review_loops = 0;
        self.last_review_fingerprint = None;
        self.pending_fix_instructions = None;
    }

    /// Validate the tick-boundary invariants from Section 3 against a
    /// previous snapshot. Called by the supervisor loop after every phase
    /// handler invocation, before persisting.
    pub fn check_invariants(&self, previous: &Self) -> Result<(), StateInvariantError> {
        if self.run_id != previous.run_id {
            return Err(StateInvariantError::RunIdChanged {
                before: previous.run_id.to_string(),
                after: self.run_id.to_string(),
            });
        }

        if self.phase.requires_milestone_index() && self.milestone_index >= self.milestones.len()
        {
            return Err(StateInvariantError::MilestoneIndexOutOfRange {
                index: self.milestone_index,
                count: self.milestones.len(),
                phase: self.phase.as_str(),
            });
        }

        if self.milestone_retries > 3 {
            return Err(StateInvariantError::MilestoneRetriesExceeded(
                self.milestone_retries,
            ));
        }

        if self.stop_reason.is_some() && !self.is_stopped() {
            return Err(StateInvariantError::StopReasonWithoutStoppedPhase(
                self.phase.as_str(),
            ));
        }
        if self.is_stopped() && self.stop_reason.is_none() {
            return Err(StateInvariantError::StoppedPhaseWithoutStopReason);
        }

        macro_rules! check_non_decreasing {
            ($field:ident) => {
                if self.worker_stats.$field < previous.worker_stats.$field {
                    return Err(StateInvariantError::CounterDecreased {
                        field: stringify!($field),
                        before: previous.worker_stats.$field,
                        after: self.worker_stats.$field,
                    });
                }
            };
        }
        check_non_decreasing!(plan_calls);
        check_non_decreasing!(implement_calls);
        check_non_decreasing!(review_calls);
        check_non_decreasing!(parse_retries);

        if self.updated_at < previous.updated_at {
            return Err(StateInvariantError::TimeWentBackwards {
                before: previous.updated_at,
                after: self.updated_at,
            });
        }

        Ok(())
    }
}
