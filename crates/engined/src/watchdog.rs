//! Watchdog (Section 4.9): pure budget and stall checks evaluated once per
//! tick, at the outermost loop boundary only — never from inside a phase
//! handler. A handler that is mid-flight when a budget is exceeded is
//! allowed to finish; the watchdog only ever stops a run between ticks.

use chrono::{DateTime, Utc};
use engine_core::state::RunState;
use engine_core::types::StopReason;

/// One watchdog finding. At most one fires per tick; callers check in a
/// fixed priority order (stall, then tick budget, then wall-clock budget)
/// and act on the first hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    Stalled,
    MaxTicksReached,
    TimeBudgetExceeded,
}

impl WatchdogSignal {
    pub fn stop_reason(self) -> StopReason {
        match self {
            Self::Stalled => StopReason::StalledTimeout,
            Self::MaxTicksReached => StopReason::MaxTicksReached,
            Self::TimeBudgetExceeded => StopReason::TimeBudgetExceeded,
        }
    }
}

/// No progress recorded (`last_progress_at`) within `stall_threshold_minutes`
/// (Section 4.9 "stall detection").
pub fn check_stall(state: &RunState, stall_threshold_minutes: u32, now: DateTime<Utc>) -> bool {
    let elapsed = now.signed_duration_since(state.last_progress_at);
    elapsed.num_minutes() >= i64::from(stall_threshold_minutes)
}

/// `tick_count` at or beyond `max_ticks` (Section 5 resource caps).
pub fn check_tick_budget(state: &RunState, max_ticks: u32) -> bool {
    state.tick_count >= max_ticks
}

/// Wall-clock since `created_at` at or beyond `max_run_wall_minutes`
/// (Section 5 resource caps).
pub fn check_wall_budget(state: &RunState, max_run_wall_minutes: u32, now: DateTime<Utc>) -> bool {
    let elapsed = now.signed_duration_since(state.created_at);
    elapsed.num_minutes() >= i64::from(max_run_wall_minutes)
}

/// Evaluate every watchdog check in priority order, returning the first
/// signal that fires. Called once per tick, before the phase handler runs.
pub fn evaluate(
    state: &RunState,
    stall_threshold_minutes: u32,
    max_ticks: u32,
    max_run_wall_minutes: u32,
    now: DateTime<Utc>,
) -> Option<WatchdogSignal> {
    if check_stall(state, stall_threshold_minutes, now) {
        return Some(WatchdogSignal::Stalled);
    }
    if check_tick_budget(state, max_ticks) {
        return Some(WatchdogSignal::MaxTicksReached);
    }
    if check_wall_budget(state, max_run_wall_minutes, now) {
        return Some(WatchdogSignal::TimeBudgetExceeded);
    }
    None
}
