pub mod config;
pub mod diagnosis;
pub mod event;
pub mod fingerprint;
pub mod milestone;
pub mod orchestration;
pub mod prompt;
pub mod schema;
pub mod scope;
pub mod sidecar;
pub mod state;
pub mod types;
pub mod verify_policy;

pub use config::{Config, ConfigError, WorkerConfig};
pub use diagnosis::{diagnose, DiagnosisContext, DiagnosisReport};
pub use event::{Event, EventPayload, EventType};
pub use fingerprint::{EnvFingerprint, FingerprintDrift};
pub use milestone::Milestone;
pub use orchestration::{OrchestrationState, Track, TrackStep};
pub use schema::{ImplementerOutput, PlannerOutput, ReviewerOutput};
pub use scope::{ScopeLock, Violation};
pub use sidecar::{CheckpointSidecar, InterventionReceipt};
pub use state::{RunState, StateInvariantError};
pub use types::{
    CaptureMode, ImplementStatus, OrchestrationPolicy, Phase, QueuePolicy, ReviewDecision,
    RiskLevel, RunId, StopFamily, StopReason, Tier, WorkerErrorKind, WorkerOutput, WorkerRole,
};
