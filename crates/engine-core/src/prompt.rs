//! Small string helpers shared by the worker adapter and worktree manager,
//! plus the phase prompt templates the supervisor loop hands to workers
//! (Section 4.4, 4.8).

use crate::milestone::Milestone;

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

const JSON_BLOCK_INSTRUCTIONS: &str = "Emit your final answer as a single JSON object delimited \
by the literal markers BEGIN_JSON and END_JSON on their own lines. Nothing outside that block is \
read; everything inside it must be valid JSON matching the schema below.";

/// Prompt for the PLAN phase: produce an ordered milestone list (Section
/// 4.4 planner schema).
pub fn plan_prompt(task_description: &str, allowlist: &[String]) -> String {
    format!(
        r#"You are a planning agent. Read the task below and break it into an ordered
sequence of milestones, each small enough to implement, verify, and review in
one pass.

Task:
{task_description}

Every milestone's files_expected patterns must fall within this scope allowlist:
{allowlist_display}

{instructions}

Schema:
{{"milestones": [{{"goal": string, "files_expected": [string], "done_checks": [string], "risk_level": "low"|"medium"|"high"}}]}}

BEGIN_JSON
...
END_JSON"#,
        allowlist_display = if allowlist.is_empty() {
            "(unrestricted)".to_string()
        } else {
            allowlist.join(", ")
        },
        instructions = JSON_BLOCK_INSTRUCTIONS,
    )
}

/// Prompt for the IMPLEMENT phase, optionally carrying fix instructions
/// from a prior VERIFY failure or REVIEW request_changes (Section 4.7
/// retry loops).
pub fn implement_prompt(milestone: &Milestone, fix_instructions: Option<&str>) -> String {
    let mut prompt = format!(
        r#"You are an implementation agent working on one milestone.

Goal:
{goal}

Expected files (patterns, not an exhaustive list):
{files}

Completion checks:
{checks}
"#,
        goal = milestone.goal,
        files = milestone.files_expected.join(", "),
        checks = milestone.done_checks.join("; "),
    );

    if let Some(notes) = fix_instructions {
        prompt.push_str(&format!(
            "\nThe previous attempt at this milestone did not pass. Address this before \
doing anything else:\n{notes}\n"
        ));
    }

    prompt.push_str(&format!(
        r#"
If you make no file changes, you must report status "blocked" and include
no_changes_evidence (files_checked, grep_output, or commands_run) explaining why no
change was needed or possible.

{instructions}

Schema:
{{"status": "complete"|"blocked", "summary": string, "changed_files": [string], "no_changes_evidence": {{...}}?}}

BEGIN_JSON
...
END_JSON"#,
        instructions = JSON_BLOCK_INSTRUCTIONS,
    ));
    prompt
}

/// Prompt for the REVIEW phase (Section 4.4 reviewer schema).
pub fn review_prompt(milestone: &Milestone, changed_files: &[String]) -> String {
    format!(
        r#"You are a senior reviewer. Judge whether the milestone below was completed
correctly by inspecting the changed files.

Milestone goal:
{goal}

Completion checks:
{checks}

Changed files:
{files}

Approve only if every completion check is satisfied. Otherwise request changes with a
machine-readable checks list the implementer can act on directly.

{instructions}

Schema:
{{"decision": "approve"|"request_changes"|"reject", "feedback": string, "checks": [{{"type": string, "command": string, "requirement": string, "current": string}}]?, "fingerprint": string?}}

BEGIN_JSON
...
END_JSON"#,
        goal = milestone.goal,
        checks = milestone.done_checks.join("; "),
        files = changed_files.join(", "),
        instructions = JSON_BLOCK_INSTRUCTIONS,
    )
}
