//! Diagnosis (Section 4.9): rule-based classifier over a terminated run's
//! state and recent timeline events, producing a structured stop diagnosis
//! with suggested next actions.

use crate::state::RunState;
use crate::types::{StopFamily, StopReason, WorkerErrorKind};
use serde::{Deserialize, Serialize};

/// Additional evidence the caller gathers (from the store, the worktree,
/// or the last worker call) that a pure function over `RunState` alone
/// cannot derive.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisContext {
    pub last_worker_error_kind: Option<WorkerErrorKind>,
    pub verification_cwd_configured: Option<String>,
    pub verification_cwd_actual: Option<String>,
    pub worktree_is_dirty: bool,
    pub last_verification_failed_command: Option<String>,
    pub last_parse_error_body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedRule {
    pub rule_id: &'static str,
    pub description: String,
    pub evidence: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextAction {
    pub description: String,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub stop_reason_family: StopFamily,
    pub matched_rules: Vec<MatchedRule>,
    pub next_actions: Vec<NextAction>,
}

type Rule = fn(&RunState, StopReason, &DiagnosisContext) -> Option<(MatchedRule, Vec<NextAction>)>;

const RULES: &[Rule] = &[
    rule_auth_expired,
    rule_verification_cwd_mismatch,
    rule_scope_violation,
    rule_lockfile_restricted,
    rule_verification_failure,
    rule_worker_parse_failure,
    rule_stall,
    rule_tick_exhaustion,
    rule_time_exhaustion,
    rule_dirty_tree_guard,
];

/// Classify a terminated run. Runs every rule; a run can match more than
/// one. At least ten rules are evaluated (Section 4.9).
pub fn diagnose(state: &RunState, ctx: &DiagnosisContext) -> DiagnosisReport {
    let Some(reason) = state.stop_reason else {
        return DiagnosisReport {
            stop_reason_family: StopFamily::Success,
            matched_rules: Vec::new(),
            next_actions: Vec::new(),
        };
    };

    let mut matched_rules = Vec::new();
    let mut next_actions = Vec::new();
    for rule in RULES {
        if let Some((matched, actions)) = rule(state, reason, ctx) {
            matched_rules.push(matched);
            next_actions.extend(actions);
        }
    }

    DiagnosisReport {
        stop_reason_family: reason.family(),
        matched_rules,
        next_actions,
    }
}

fn rule_auth_expired(
    _state: &RunState,
    _reason: StopReason,
    ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if ctx.last_worker_error_kind != Some(WorkerErrorKind::Auth) {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "auth_expired",
            description: "the last worker call failed with an auth error".to_string(),
            evidence: vec!["last_worker_error_kind = auth".to_string()],
            confidence: 0.9,
        },
        vec![NextAction {
            description: "re-authenticate the worker CLI and resume".to_string(),
            command: None,
        }],
    ))
}

fn rule_verification_cwd_mismatch(
    _state: &RunState,
    reason: StopReason,
    ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::VerificationFailedMaxRetries {
        return None;
    }
    let (Some(configured), Some(actual)) = (
        &ctx.verification_cwd_configured,
        &ctx.verification_cwd_actual,
    ) else {
        return None;
    };
    if configured == actual {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "verification_cwd_mismatch",
            description: "verification ran in a different directory than configured".to_string(),
            evidence: vec![format!("configured={configured} actual={actual}")],
            confidence: 0.7,
        },
        vec![NextAction {
            description: "fix verification.cwd to match the worktree layout".to_string(),
            command: None,
        }],
    ))
}

fn rule_scope_violation(
    _state: &RunState,
    reason: StopReason,
    _ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if !matches!(
        reason,
        StopReason::PlanScopeViolation | StopReason::GuardViolation
    ) {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "scope_violation",
            description: "changed or proposed files fell outside the scope lock".to_string(),
            evidence: vec![format!("stop_reason = {}", reason.as_str())],
            confidence: 0.95,
        },
        vec![NextAction {
            description: "widen scope.allowlist or narrow the task before resuming".to_string(),
            command: None,
        }],
    ))
}

fn rule_lockfile_restricted(
    _state: &RunState,
    reason: StopReason,
    _ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::GuardViolation {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "lockfile_restricted",
            description: "a configured lockfile was modified without allow_deps".to_string(),
            evidence: vec!["guard_violation on a lockfile path".to_string()],
            confidence: 0.5,
        },
        vec![NextAction {
            description: "rerun with --allow-deps if the dependency change is intentional"
                .to_string(),
            command: None,
        }],
    ))
}

fn rule_verification_failure(
    state: &RunState,
    reason: StopReason,
    ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::VerificationFailedMaxRetries {
        return None;
    }
    let cmd = ctx
        .last_verification_failed_command
        .clone()
        .unwrap_or_else(|| "<unknown command>".to_string());
    Some((
        MatchedRule {
            rule_id: "verification_failure",
            description: "verification failed repeatedly for this milestone".to_string(),
            evidence: vec![
                format!("milestone_retries = {}", state.milestone_retries),
                format!("last failing command: {cmd}"),
            ],
            confidence: 0.9,
        },
        vec![NextAction {
            description: "inspect the failure log and fix the command manually".to_string(),
            command: Some(cmd),
        }],
    ))
}

fn rule_worker_parse_failure(
    _state: &RunState,
    reason: StopReason,
    ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if !matches!(
        reason,
        StopReason::PlanParseFailed
            | StopReason::ImplementParseFailed
            | StopReason::ReviewParseFailed
    ) {
        return None;
    }
    let mut evidence = vec![format!("stop_reason = {}", reason.as_str())];
    if let Some(body) = &ctx.last_parse_error_body {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= 200)
            .last()
            .unwrap_or(0);
        evidence.push(format!("captured body (truncated): {}", &body[..cut]));
    }
    Some((
        MatchedRule {
            rule_id: "worker_parse_failure",
            description: "the worker did not emit a valid BEGIN_JSON/END_JSON block".to_string(),
            evidence,
            confidence: 0.85,
        },
        vec![NextAction {
            description: "inspect the raw worker output artifact for this phase".to_string(),
            command: None,
        }],
    ))
}

fn rule_stall(
    _state: &RunState,
    reason: StopReason,
    _ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::StalledTimeout {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "stall",
            description: "no progress was recorded within the stall threshold".to_string(),
            evidence: vec!["stop_reason = stalled_timeout".to_string()],
            confidence: 0.8,
        },
        vec![NextAction {
            description: "resume the run; if it stalls again inspect the worker process"
                .to_string(),
            command: None,
        }],
    ))
}

fn rule_tick_exhaustion(
    state: &RunState,
    reason: StopReason,
    _ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::MaxTicksReached {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "tick_exhaustion",
            description: "the run exhausted its configured tick budget".to_string(),
            evidence: vec![format!("tick_count = {}", state.tick_count)],
            confidence: 0.9,
        },
        vec![NextAction {
            description: "raise the tick budget or split the task into smaller milestones"
                .to_string(),
            command: None,
        }],
    ))
}

fn rule_time_exhaustion(
    _state: &RunState,
    reason: StopReason,
    _ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if reason != StopReason::TimeBudgetExceeded {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "time_exhaustion",
            description: "the run exceeded its wall-time budget".to_string(),
            evidence: vec!["stop_reason = time_budget_exceeded".to_string()],
            confidence: 0.9,
        },
        vec![NextAction {
            description: "raise the per-run wall-time budget and resume".to_string(),
            command: None,
        }],
    ))
}

fn rule_dirty_tree_guard(
    _state: &RunState,
    _reason: StopReason,
    ctx: &DiagnosisContext,
) -> Option<(MatchedRule, Vec<NextAction>)> {
    if !ctx.worktree_is_dirty {
        return None;
    }
    Some((
        MatchedRule {
            rule_id: "dirty_tree_guard",
            description: "the worktree was left dirty outside of an expected checkpoint"
                .to_string(),
            evidence: vec!["worktree_is_dirty = true".to_string()],
            confidence: 0.6,
        },
        vec![NextAction {
            description: "run `git status` in the worktree and commit or discard stray changes"
                .to_string(),
            command: Some("git status".to_string()),
        }],
    ))
}
