//! engined - supervisor engine runtime.
//!
//! Library components driving one run's phase state machine to
//! completion, plus the orchestrator that schedules many runs across
//! tracks.

pub mod checkpoint;
pub mod driver;
pub mod git;
pub mod guard;
pub mod preflight;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod verify;
pub mod watchdog;
pub mod worker;
pub mod worktree;

/// Application-level errors with context and backtraces, for binary entry
/// points only; library functions return their own typed error enums.
pub type AppResult<T> = eyre::Result<T>;
