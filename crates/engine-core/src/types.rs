//! Core types for the supervisor engine.
//!
//! These types match the data model defined in Section 3 of the run
//! specification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run identifier: a UTC timestamp of the form `YYYYMMDDHHMMSS`.
///
/// Unlike step/event identifiers, run ids are human-sortable directory
/// names, not UUIDs: the run directory is named after this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new run id from the current UTC time.
    pub fn generate() -> Self {
        Self::from_time(Utc::now())
    }

    pub fn from_time(ts: DateTime<Utc>) -> Self {
        Self(ts.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fixed phase enumeration (Section 3, 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Plan,
    MilestoneStart,
    Implement,
    Verify,
    Review,
    Checkpoint,
    Finalize,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Plan => "PLAN",
            Self::MilestoneStart => "MILESTONE_START",
            Self::Implement => "IMPLEMENT",
            Self::Verify => "VERIFY",
            Self::Review => "REVIEW",
            Self::Checkpoint => "CHECKPOINT",
            Self::Finalize => "FINALIZE",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether `milestone_index` is required to be in range for this phase.
    pub fn requires_milestone_index(self) -> bool {
        !matches!(self, Self::Init | Self::Plan | Self::Stopped | Self::Finalize)
    }
}

/// Milestone risk level, set by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Verification tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tier0,
    Tier1,
    Tier2,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier0 => "tier0",
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
        }
    }
}

/// Worker process output framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerOutput {
    Text,
    Json,
    Jsonl,
}

/// Which worker role a phase is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Plan,
    Implement,
    Review,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Review => "review",
        }
    }
}

/// Reviewer decision (Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    Reject,
}

/// Implementer status (Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplementStatus {
    Complete,
    Blocked,
}

/// Classified worker process error taxonomy (Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    Auth,
    Network,
    RateLimit,
    Timeout,
    Unknown,
}

impl WorkerErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// Stop reason family (Section 4.7, 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopFamily {
    Success,
    Parse,
    Policy,
    Logic,
    Infrastructure,
    Budget,
}

impl StopFamily {
    /// Exit code table (Section 6).
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Budget => 2,
            Self::Policy => 3,
            Self::Logic => 4,
            Self::Infrastructure => 5,
            Self::Parse => 6,
        }
    }
}

/// Canonical stop taxonomy (Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    PlanParseFailed,
    ImplementParseFailed,
    ReviewParseFailed,
    PlanScopeViolation,
    GuardViolation,
    OwnershipViolation,
    MilestoneMissing,
    ImplementBlocked,
    VerificationFailedMaxRetries,
    ReviewLoopDetected,
    StalledTimeout,
    WorkerCallTimeout,
    TimeBudgetExceeded,
    MaxTicksReached,
    StoreIoError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::PlanParseFailed => "plan_parse_failed",
            Self::ImplementParseFailed => "implement_parse_failed",
            Self::ReviewParseFailed => "review_parse_failed",
            Self::PlanScopeViolation => "plan_scope_violation",
            Self::GuardViolation => "guard_violation",
            Self::OwnershipViolation => "ownership_violation",
            Self::MilestoneMissing => "milestone_missing",
            Self::ImplementBlocked => "implement_blocked",
            Self::VerificationFailedMaxRetries => "verification_failed_max_retries",
            Self::ReviewLoopDetected => "review_loop_detected",
            Self::StalledTimeout => "stalled_timeout",
            Self::WorkerCallTimeout => "worker_call_timeout",
            Self::TimeBudgetExceeded => "time_budget_exceeded",
            Self::MaxTicksReached => "max_ticks_reached",
            Self::StoreIoError => "store_io_error",
        }
    }

    pub fn family(self) -> StopFamily {
        match self {
            Self::Complete => StopFamily::Success,
            Self::PlanParseFailed | Self::ImplementParseFailed | Self::ReviewParseFailed => {
                StopFamily::Parse
            }
            Self::PlanScopeViolation
            | Self::GuardViolation
            | Self::OwnershipViolation
            | Self::MilestoneMissing => StopFamily::Policy,
            Self::ImplementBlocked
            | Self::VerificationFailedMaxRetries
            | Self::ReviewLoopDetected => StopFamily::Logic,
            Self::StalledTimeout | Self::WorkerCallTimeout | Self::StoreIoError => {
                StopFamily::Infrastructure
            }
            Self::TimeBudgetExceeded | Self::MaxTicksReached => StopFamily::Budget,
        }
    }

    /// Whether auto-resume is suggested for this stop reason by default.
    pub fn suggests_auto_resume(self) -> bool {
        matches!(
            self,
            Self::StalledTimeout | Self::WorkerCallTimeout | Self::TimeBudgetExceeded
        )
    }
}

/// Queue admission policy for the orchestrator (Section 4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPolicy {
    Serialize,
    Force,
    Fail,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self::Serialize
    }
}

/// Queue ordering policy (retained from the existing scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    Fifo,
    NewestFirst,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Fifo
    }
}

/// `receipts.capture_cmd_output` modes (Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Full,
    Truncated,
    MetadataOnly,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_formats_as_compact_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2026-07-28T09:03:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(RunId::from_time(ts).0, "20260728090305");
    }

    #[test]
    fn stop_reason_family_and_exit_code_are_table_driven() {
        assert_eq!(StopReason::Complete.family(), StopFamily::Success);
        assert_eq!(StopReason::Complete.family().exit_code(), 0);
        assert_eq!(
            StopReason::VerificationFailedMaxRetries.family(),
            StopFamily::Logic
        );
        assert_eq!(
            StopReason::VerificationFailedMaxRetries.family().exit_code(),
            4
        );
        assert_eq!(StopReason::PlanParseFailed.family(), StopFamily::Parse);
        assert_eq!(StopReason::PlanParseFailed.family().exit_code(), 6);
        assert_eq!(StopReason::MaxTicksReached.family(), StopFamily::Budget);
        assert_eq!(StopReason::MaxTicksReached.family().exit_code(), 2);
    }

    #[test]
    fn phase_requires_milestone_index_matches_spec_exceptions() {
        assert!(!Phase::Init.requires_milestone_index());
        assert!(!Phase::Plan.requires_milestone_index());
        assert!(!Phase::Stopped.requires_milestone_index());
        assert!(!Phase::Finalize.requires_milestone_index());
        assert!(Phase::Implement.requires_milestone_index());
        assert!(Phase::Verify.requires_milestone_index());
        assert!(Phase::MilestoneStart.requires_milestone_index());
    }
}
