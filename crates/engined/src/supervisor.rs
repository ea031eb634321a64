//! Supervisor Loop (Section 4.7, 4.8): the phase state machine that drives
//! one run one tick at a time. Every tick checks termination, then the
//! watchdog, then dispatches exactly one phase handler, then persists.
//!
//! Handlers are written to be safely restartable: each reads whatever it
//! needs from `RunState` and the worktree rather than from in-memory state
//! left over from a previous tick, so a process restart mid-run can resume
//! from the last persisted `state.json` with no special-cased recovery path.

use crate::checkpoint;
use crate::git;
use crate::guard;
use crate::store::Store;
use crate::verify;
use crate::watchdog::{self, WatchdogSignal};
use crate::worker::{self, WorkerCallResult};
use chrono::{DateTime, Utc};
use engine_core::config::Config;
use engine_core::event::{
    CheckpointPayload, EventPayload, EventType, ImplementCompletedPayload, PhaseTransitionPayload,
    PlanCompletedPayload, ReviewDecisionPayload, StopPayload, VerificationPayload, WorkerCallPayload,
};
use engine_core::diagnosis::{diagnose, DiagnosisContext};
use engine_core::prompt::{implement_prompt, plan_prompt, review_prompt};
use engine_core::schema::{ImplementerOutput, PlannerOutput, ReviewerOutput, SchemaError};
use engine_core::sidecar::{CheckpointSidecar, VerificationEvidence};
use engine_core::state::RunState;
use engine_core::types::{
    ImplementStatus, Phase, ReviewDecision, StopFamily, StopReason, Tier, WorkerErrorKind, WorkerRole,
};
use engine_core::verify_policy::select_tiers;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Verify(#[from] verify::VerifyError),
    #[error(transparent)]
    Checkpoint(#[from] checkpoint::CheckpointError),
    #[error("no worker configured for phase role {0:?}")]
    MissingWorkerConfig(WorkerRole),
    #[error("state invariant violated: {0}")]
    Invariant(#[from] engine_core::state::StateInvariantError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Everything a tick needs that doesn't live in `RunState` itself.
pub struct TickContext<'a> {
    pub store: &'a Store,
    pub config: &'a Config,
    pub worktree: &'a Path,
    pub task_description: &'a str,
    pub now: DateTime<Utc>,
}

/// Drive exactly one tick: watchdog check, then one phase handler, then
/// persist. Idempotent on an already-stopped run.
pub async fn tick(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    if state.is_stopped() {
        return Ok(state);
    }

    let previous = state.clone();
    state.tick_count += 1;
    state.updated_at = ctx.now;

    if let Some(signal) = watchdog::evaluate(
        &state,
        ctx.config.stall_threshold_minutes,
        ctx.config.max_ticks,
        ctx.config.max_run_wall_minutes,
        ctx.now,
    ) {
        let state = apply_stop(ctx, state, signal.stop_reason())?;
        ctx.store.write_state(&state)?;
        return Ok(state);
    }

    let phase_before = state.phase;
    let mut state = match phase_before {
        Phase::Plan => handle_plan(ctx, state).await?,
        Phase::MilestoneStart => handle_milestone_start(ctx, state)?,
        Phase::Implement => handle_implement(ctx, state).await?,
        Phase::Verify => handle_verify(ctx, state).await?,
        Phase::Review => handle_review(ctx, state).await?,
        Phase::Checkpoint => handle_checkpoint(ctx, state)?,
        Phase::Finalize => handle_finalize(ctx, state)?,
        Phase::Init | Phase::Stopped => state,
    };

    state.check_invariants(&previous)?;

    if state.phase != phase_before {
        ctx.store.append_event(
            EventType::PhaseTransition.as_str(),
            "supervisor",
            EventPayload::PhaseTransition(PhaseTransitionPayload {
                from: phase_before.as_str().to_string(),
                to: state.phase.as_str().to_string(),
            }),
            ctx.now,
        )?;
    }

    ctx.store.write_state(&state)?;
    Ok(state)
}

fn family_str(family: StopFamily) -> &'static str {
    match family {
        StopFamily::Success => "success",
        StopFamily::Parse => "parse",
        StopFamily::Policy => "policy",
        StopFamily::Logic => "logic",
        StopFamily::Infrastructure => "infrastructure",
        StopFamily::Budget => "budget",
    }
}

fn apply_stop(ctx: &TickContext<'_>, mut state: RunState, reason: StopReason) -> Result<RunState> {
    let phase_before = state.phase.as_str().to_string();
    let milestone_index = if state.milestones.is_empty() {
        None
    } else {
        Some(state.milestone_index)
    };
    state.stop(reason, ctx.now);
    ctx.store.append_event(
        EventType::Stop.as_str(),
        "supervisor",
        EventPayload::Stop(StopPayload {
            reason,
            family: family_str(reason.family()).to_string(),
            phase: phase_before,
            milestone_index,
        }),
        ctx.now,
    )?;
    info!(reason = reason.as_str(), "run stopped");

    let configured_cwd = ctx.config.verification.cwd.clone().map(|p| p.display().to_string());
    let diagnosis_ctx = DiagnosisContext {
        last_worker_error_kind: state.last_worker_error_kind,
        verification_cwd_configured: configured_cwd,
        verification_cwd_actual: Some(ctx.worktree.display().to_string()),
        worktree_is_dirty: git::is_clean(ctx.worktree).map(|clean| !clean).unwrap_or(false),
        last_verification_failed_command: state.last_verification_failed_command.clone(),
        last_parse_error_body: state.last_parse_error_body.clone(),
    };
    let report = diagnose(&state, &diagnosis_ctx);
    if let Ok(json) = serde_json::to_string_pretty(&report) {
        let _ = ctx.store.write_memo("stop.json", &json);
    }
    let _ = ctx.store.write_memo("stop.md", &render_stop_memo(reason, &report));

    Ok(state)
}

fn render_stop_memo(reason: StopReason, report: &engine_core::diagnosis::DiagnosisReport) -> String {
    let mut out = format!("# Run stopped: {}\n\nFamily: {}\n", reason.as_str(), family_str(report.stop_reason_family));
    if report.matched_rules.is_empty() {
        out.push_str("\nNo diagnosis rules matched.\n");
        return out;
    }
    out.push_str("\n## Matched rules\n");
    for rule in &report.matched_rules {
        out.push_str(&format!("\n- **{}** (confidence {:.2}): {}\n", rule.rule_id, rule.confidence, rule.description));
        for ev in &rule.evidence {
            out.push_str(&format!("  - {ev}\n"));
        }
    }
    out.push_str("\n## Next actions\n");
    for action in &report.next_actions {
        match &action.command {
            Some(cmd) => out.push_str(&format!("- {} (`{}`)\n", action.description, cmd)),
            None => out.push_str(&format!("- {}\n", action.description)),
        }
    }
    out
}

/// Invoke the worker bound to `role`, logging a `worker_call` event either
/// way. Returns `Ok(Err((reason, error_kind)))` rather than bubbling a
/// `SupervisorError` when the failure should end the run rather than abort
/// the process; `error_kind` is carried into `RunState` for diagnosis.
async fn call_phase_worker(
    ctx: &TickContext<'_>,
    role: WorkerRole,
    prompt: &str,
    parse_failed: StopReason,
    validate: impl Fn(&str) -> bool,
) -> Result<std::result::Result<WorkerCallResult, (StopReason, Option<WorkerErrorKind>)>> {
    let Some(worker_config) = ctx.config.worker_for(role) else {
        return Err(SupervisorError::MissingWorkerConfig(role));
    };
    let call_cap = Duration::from_secs(u64::from(ctx.config.resilience.max_worker_call_minutes) * 60);
    match worker::invoke(worker_config, prompt, ctx.worktree, call_cap, validate).await {
        Ok(result) => {
            ctx.store.append_event(
                EventType::WorkerCall.as_str(),
                "supervisor",
                EventPayload::WorkerCall(WorkerCallPayload {
                    worker: worker_config.bin.display().to_string(),
                    role,
                    duration_ms: result.duration_ms,
                    outcome: "ok".to_string(),
                    error_kind: None,
                    retried: result.retried,
                }),
                ctx.now,
            )?;
            Ok(Ok(result))
        }
        Err(err) => {
            let (stop_reason, error_kind) = match &err {
                worker::WorkerError::TimedOut => (StopReason::WorkerCallTimeout, None),
                worker::WorkerError::ProcessFailed(kind) => (parse_failed, Some(*kind)),
                _ => (parse_failed, None),
            };
            warn!(role = role.as_str(), error = %err, "worker call failed");
            ctx.store.append_event(
                EventType::WorkerCall.as_str(),
                "supervisor",
                EventPayload::WorkerCall(WorkerCallPayload {
                    worker: worker_config.bin.display().to_string(),
                    role,
                    duration_ms: 0,
                    outcome: "error".to_string(),
                    error_kind,
                    retried: false,
                }),
                ctx.now,
            )?;
            Ok(Err((stop_reason, error_kind)))
        }
    }
}

async fn handle_plan(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    let prompt = plan_prompt(ctx.task_description, &state.scope_lock.allowlist);
    let call = call_phase_worker(
        ctx,
        WorkerRole::Plan,
        &prompt,
        StopReason::PlanParseFailed,
        |json| PlannerOutput::parse(json).is_ok(),
    )
    .await?;
    state.worker_stats.plan_calls += 1;

    let result = match call {
        Ok(r) => r,
        Err((reason, kind)) => {
            state.last_worker_error_kind = kind;
            return apply_stop(ctx, state, reason);
        }
    };
    if result.retried {
        state.worker_stats.parse_retries += 1;
    }
    ctx.store.write_plan(&result.text_body)?;

    let Some(json) = result.json_block else {
        state.last_parse_error_body = Some(result.text_body.clone());
        return apply_stop(ctx, state, StopReason::PlanParseFailed);
    };
    let planner_output = match PlannerOutput::parse(&json) {
        Ok(out) => out,
        Err(SchemaError::InvalidJson(_) | SchemaError::Violation(_)) => {
            state.last_parse_error_body = Some(result.text_body.clone());
            return apply_stop(ctx, state, StopReason::PlanParseFailed);
        }
    };

    for milestone in &planner_output.milestones {
        if guard::check_patterns(&milestone.files_expected, &state.scope_lock).is_err() {
            return apply_stop(ctx, state, StopReason::PlanScopeViolation);
        }
    }

    let milestone_count = planner_output.milestones.len();
    state.milestones = planner_output.milestones;
    state.milestone_index = 0;
    state.last_progress_at = ctx.now;
    state.phase = Phase::MilestoneStart;

    ctx.store.append_event(
        EventType::PlanCompleted.as_str(),
        "supervisor",
        EventPayload::PlanCompleted(PlanCompletedPayload { milestone_count }),
        ctx.now,
    )?;
    Ok(state)
}

/// Bookkeeping-only phase: reset milestone-scoped counters at a single
/// well-defined point before the next IMPLEMENT call (Section 3).
fn handle_milestone_start(_ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    if state.milestone_index >= state.milestones.len() {
        state.phase = Phase::Finalize;
        return Ok(state);
    }
    state.reset_milestone_scope();
    state.phase = Phase::Implement;
    Ok(state)
}

async fn handle_implement(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    let Some(milestone) = state.current_milestone().cloned() else {
        return apply_stop(ctx, state, StopReason::MilestoneMissing);
    };

    let prompt = implement_prompt(&milestone, state.pending_fix_instructions.as_deref());
    let call = call_phase_worker(
        ctx,
        WorkerRole::Implement,
        &prompt,
        StopReason::ImplementParseFailed,
        |json| ImplementerOutput::parse(json).is_ok(),
    )
    .await?;
    state.worker_stats.implement_calls += 1;

    let result = match call {
        Ok(r) => r,
        Err((reason, kind)) => {
            state.last_worker_error_kind = kind;
            return apply_stop(ctx, state, reason);
        }
    };
    if result.retried {
        state.worker_stats.parse_retries += 1;
    }

    let Some(json) = result.json_block else {
        state.last_parse_error_body = Some(result.text_body.clone());
        return apply_stop(ctx, state, StopReason::ImplementParseFailed);
    };
    let out = match ImplementerOutput::parse(&json) {
        Ok(out) => out,
        Err(_) => {
            state.last_parse_error_body = Some(result.text_body.clone());
            return apply_stop(ctx, state, StopReason::ImplementParseFailed);
        }
    };

    if out.status == ImplementStatus::Blocked {
        let scope_lock = state.scope_lock.clone();
        let sufficient = out
            .no_changes_evidence
            .as_ref()
            .is_some_and(|ev| ev.is_sufficient(|f| engine_core::scope::check(&[f.to_string()], &scope_lock, true).is_ok()));
        if !sufficient {
            return apply_stop(ctx, state, StopReason::ImplementBlocked);
        }
    }

    let changed_files = match guard::check_worktree(
        ctx.worktree,
        &state.scope_lock,
        ctx.config.allow_deps_flag,
    )? {
        Ok(files) => files,
        Err(_violation) => return apply_stop(ctx, state, StopReason::GuardViolation),
    };

    state.last_changed_files = changed_files.clone();
    state.pending_fix_instructions = None;
    state.last_progress_at = ctx.now;
    state.phase = Phase::Verify;

    ctx.store.append_event(
        EventType::ImplementCompleted.as_str(),
        "supervisor",
        EventPayload::ImplementCompleted(ImplementCompletedPayload {
            milestone_index: state.milestone_index,
            status: match out.status {
                ImplementStatus::Complete => "complete".to_string(),
                ImplementStatus::Blocked => "blocked".to_string(),
            },
            changed_files,
        }),
        ctx.now,
    )?;
    Ok(state)
}

fn tier_commands<'a>(config: &'a Config, tier: Tier) -> &'a [String] {
    match tier {
        Tier::Tier0 => &config.verification.tier0,
        Tier::Tier1 => &config.verification.tier1,
        Tier::Tier2 => &config.verification.tier2,
    }
}

fn first_failure_summary(outcome: &verify::TierOutcome) -> String {
    if outcome.time_budget_exhausted {
        return format!(
            "verification tier {} ran out of its time budget before completing",
            outcome.tier.as_str()
        );
    }
    match outcome.commands.iter().find(|c| !c.passed) {
        Some(c) => format!(
            "verification tier {} command `{}` failed (exit {:?}):\n{}",
            outcome.tier.as_str(),
            c.cmd,
            c.exit_code,
            c.output
        ),
        None => format!("verification tier {} failed", outcome.tier.as_str()),
    }
}

async fn handle_verify(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    let Some(milestone) = state.current_milestone().cloned() else {
        return apply_stop(ctx, state, StopReason::MilestoneMissing);
    };

    let selections = select_tiers(
        &milestone,
        &state.last_changed_files,
        &ctx.config.verification.risk_triggers,
        state.is_last_milestone(),
    );
    state.tier_reasons = selections.clone();

    let cwd = ctx
        .config
        .verification
        .cwd
        .clone()
        .unwrap_or_else(|| ctx.worktree.to_path_buf());
    let time_budget = Duration::from_secs(u64::from(ctx.config.verification.max_verify_time_per_milestone));
    let max_output_bytes = ctx.config.receipts.max_output_bytes;

    for selection in &selections {
        if !selection.selected {
            continue;
        }
        let commands = tier_commands(ctx.config, selection.tier);
        let outcome = verify::run_tier(selection.tier, commands, &cwd, time_budget, max_output_bytes).await?;

        let log_name = format!("tests_{}.log", selection.tier.as_str());
        let combined_log = outcome
            .commands
            .iter()
            .map(|c| format!("$ {}\nexit: {:?}\n{}\n", c.cmd, c.exit_code, c.output))
            .collect::<Vec<_>>()
            .join("\n");
        ctx.store.write_artifact(&log_name, combined_log.as_bytes())?;

        ctx.store.append_event(
            EventType::Verification.as_str(),
            "supervisor",
            EventPayload::Verification(VerificationPayload {
                milestone_index: state.milestone_index,
                tier: selection.tier,
                ok: outcome.passed,
                failed_command: outcome.commands.iter().find(|c| !c.passed).map(|c| c.cmd.clone()),
                duration_s: outcome.duration_ms as f64 / 1000.0,
            }),
            ctx.now,
        )?;

        if !outcome.passed {
            state.pending_fix_instructions = Some(first_failure_summary(&outcome));
            state.last_verification_failed_command =
                outcome.commands.iter().find(|c| !c.passed).map(|c| c.cmd.clone());
            state.milestone_retries += 1;
            if state.milestone_retries >= ctx.config.max_milestone_retries {
                return apply_stop(ctx, state, StopReason::VerificationFailedMaxRetries);
            }
            state.phase = Phase::Implement;
            return Ok(state);
        }

        state.milestone_verification_evidence.push(VerificationEvidence {
            tier: selection.tier,
            commands: outcome.commands.iter().map(|c| c.cmd.clone()).collect(),
            exit_codes: outcome.commands.iter().map(|c| c.exit_code.unwrap_or(-1)).collect(),
        });
    }

    state.last_progress_at = ctx.now;
    state.phase = Phase::Review;
    Ok(state)
}

fn format_review_feedback(out: &ReviewerOutput) -> String {
    if out.checks.is_empty() {
        return out.feedback.clone();
    }
    let mut msg = out.feedback.clone();
    msg.push_str("\n\nOutstanding checks:\n");
    for check in &out.checks {
        msg.push_str(&format!(
            "- [{}] {} (requires: {}, currently: {})\n",
            check.check_type, check.command, check.requirement, check.current
        ));
    }
    msg
}

async fn handle_review(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    let Some(milestone) = state.current_milestone().cloned() else {
        return apply_stop(ctx, state, StopReason::MilestoneMissing);
    };

    let prompt = review_prompt(&milestone, &state.last_changed_files);
    let call = call_phase_worker(
        ctx,
        WorkerRole::Review,
        &prompt,
        StopReason::ReviewParseFailed,
        |json| ReviewerOutput::parse(json).is_ok(),
    )
    .await?;
    state.worker_stats.review_calls += 1;

    let result = match call {
        Ok(r) => r,
        Err((reason, kind)) => {
            state.last_worker_error_kind = kind;
            return apply_stop(ctx, state, reason);
        }
    };
    if result.retried {
        state.worker_stats.parse_retries += 1;
    }

    let Some(json) = result.json_block else {
        state.last_parse_error_body = Some(result.text_body.clone());
        return apply_stop(ctx, state, StopReason::ReviewParseFailed);
    };
    let out = match ReviewerOutput::parse(&json) {
        Ok(out) => out,
        Err(_) => {
            state.last_parse_error_body = Some(result.text_body.clone());
            return apply_stop(ctx, state, StopReason::ReviewParseFailed);
        }
    };

    let fingerprint = out.stable_fingerprint();
    ctx.store.append_event(
        EventType::ReviewDecision.as_str(),
        "supervisor",
        EventPayload::ReviewDecision(ReviewDecisionPayload {
            milestone_index: state.milestone_index,
            decision: match out.decision {
                ReviewDecision::Approve => "approve".to_string(),
                ReviewDecision::RequestChanges => "request_changes".to_string(),
                ReviewDecision::Reject => "reject".to_string(),
            },
            fingerprint: fingerprint.clone(),
        }),
        ctx.now,
    )?;

    match out.decision {
        ReviewDecision::Approve => {
            state.consecutive_review_loops = 0;
            state.last_review_fingerprint = None;
            state.last_progress_at = ctx.now;
            state.phase = Phase::Checkpoint;
            Ok(state)
        }
        ReviewDecision::RequestChanges | ReviewDecision::Reject => {
            let repeated = fingerprint.is_some() && fingerprint == state.last_review_fingerprint;
            state.consecutive_review_loops = if repeated {
                state.consecutive_review_loops + 1
            } else {
                1
            };
            state.last_review_fingerprint = fingerprint;
            if state.consecutive_review_loops >= ctx.config.resilience.max_review_rounds {
                return apply_stop(ctx, state, StopReason::ReviewLoopDetected);
            }
            state.pending_fix_instructions = Some(format_review_feedback(&out));
            state.phase = Phase::Implement;
            Ok(state)
        }
    }
}

fn handle_checkpoint(ctx: &TickContext<'_>, mut state: RunState) -> Result<RunState> {
    let Some(milestone) = state.current_milestone().cloned() else {
        return apply_stop(ctx, state, StopReason::MilestoneMissing);
    };

    let base_sha = git::head_sha(ctx.worktree)?;
    let sidecar = CheckpointSidecar {
        run_id: state.run_id.to_string(),
        milestone_index: state.milestone_index,
        milestone_goal: milestone.goal.clone(),
        verification_evidence: state.milestone_verification_evidence.clone(),
        base_sha,
        timestamp: ctx.now,
    };
    let sha = checkpoint::checkpoint(ctx.worktree, ctx.store, &state, sidecar)?;

    ctx.store.append_event(
        EventType::Checkpoint.as_str(),
        "supervisor",
        EventPayload::Checkpoint(CheckpointPayload {
            milestone_index: state.milestone_index,
            commit_sha: sha.clone(),
        }),
        ctx.now,
    )?;

    state.checkpoint_commit_sha = Some(sha.clone());
    state.last_checkpoint_commit_sha = Some(sha);
    state.milestone_index += 1;
    state.last_progress_at = ctx.now;
    state.phase = if state.milestone_index >= state.milestones.len() {
        Phase::Finalize
    } else {
        Phase::MilestoneStart
    };
    Ok(state)
}

fn handle_finalize(ctx: &TickContext<'_>, state: RunState) -> Result<RunState> {
    ctx.store.write_summary(&render_summary(&state))?;
    apply_stop(ctx, state, StopReason::Complete)
}

fn render_summary(state: &RunState) -> String {
    let mut out = format!(
        "# Run {} summary\n\n{} of {} milestones completed.\n",
        state.run_id,
        state.milestone_index,
        state.milestones.len()
    );
    if let Some(sha) = &state.checkpoint_commit_sha {
        out.push_str(&format!("\nLast checkpoint: {sha}\n"));
    }
    out.push_str(&format!(
        "\nWorker calls: plan={}, implement={}, review={}, parse_retries={}\n",
        state.worker_stats.plan_calls,
        state.worker_stats.implement_calls,
        state.worker_stats.review_calls,
        state.worker_stats.parse_retries,
    ));
    out.push_str(&format!("Ticks used: {}\n", state.tick_count));
    out
}
