//! Output rendering for the enginectl binary.
//!
//! Formats run state and diagnosis output for terminal display.

use engine_core::diagnosis::DiagnosisReport;
use engine_core::state::RunState;

/// Print confirmation after a run reaches a terminal state.
pub fn print_run_stopped(state: &RunState) {
    println!("Run:    {}", state.run_id);
    println!("  Phase:    {}", state.phase.as_str());
    if let Some(reason) = state.stop_reason {
        println!("  Stopped:  {}", reason.as_str());
    }
    println!(
        "  Milestone: {} of {}",
        state.milestone_index,
        state.milestones.len()
    );
    if let Some(sha) = &state.checkpoint_commit_sha {
        println!("  Checkpoint: {sha}");
    }
    println!("  Ticks:    {}", state.tick_count);
}

/// Print a diagnosis report produced for a stopped run.
pub fn print_diagnosis(report: &DiagnosisReport) {
    println!("Stop family: {:?}", report.stop_reason_family);
    if report.matched_rules.is_empty() {
        println!("No diagnosis rules matched.");
        return;
    }
    println!();
    println!("Matched rules:");
    for rule in &report.matched_rules {
        println!("  - {} (confidence {:.2}): {}", rule.rule_id, rule.confidence, rule.description);
        for ev in &rule.evidence {
            println!("      {ev}");
        }
    }
    println!();
    println!("Next actions:");
    for action in &report.next_actions {
        match &action.command {
            Some(cmd) => println!("  - {} (`{}`)", action.description, cmd),
            None => println!("  - {}", action.description),
        }
    }
}

/// Print a submit outcome summary.
pub fn print_submit_outcome(outcome: &engined::checkpoint::SubmitOutcome) {
    use engined::checkpoint::SubmitOutcome;
    match outcome {
        SubmitOutcome::Submitted { target_branch, commit_sha, pushed } => {
            println!("Submitted {commit_sha} onto {target_branch} (pushed: {pushed})");
        }
        SubmitOutcome::Conflict { target_branch, commit_sha, conflicted_files } => {
            println!("Conflict cherry-picking {commit_sha} onto {target_branch}:");
            for f in conflicted_files {
                println!("  {f}");
            }
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}
