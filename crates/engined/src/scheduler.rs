//! Orchestrator (Section 4.11): schedules multiple tracks of runs with
//! file-ownership collision admission control.
//!
//! Grounded in the same concurrency shape as the supervisor's own worker
//! calls: a semaphore bounds how many tracks may have a run in flight at
//! once, and a claim lock serializes the find-launchable/reserve sequence
//! so two concurrent callers never admit conflicting claims.

use engine_core::orchestration::{claims_conflict, normalize_claim, OrchestrationState, StepState, Track};
use engine_core::types::{OrchestrationPolicy, RunId};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed orchestration_state.json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("track {0} not found")]
    TrackNotFound(String),
    #[error("step {0}/{1} not found")]
    StepNotFound(String, usize),
    #[error(
        "step {track}/{step} conflicts with an active ownership claim and the orchestration \
policy is \"fail\""
    )]
    ClaimConflict { track: String, step: usize },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

fn io_err(path: &Path, source: std::io::Error) -> SchedulerError {
    SchedulerError::Io { path: path.to_path_buf(), source }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    fs::write(&tmp_path, bytes).map_err(|e| io_err(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// What the caller should do next (Section 4.11 "main scheduling loop").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Launch this track's step; the caller is responsible for starting a
    /// supervisor run and reporting it back via [`Scheduler::reserve`].
    Launch { track: String, step: usize },
    /// Nothing is launchable right now but the orchestration is not done;
    /// the caller should wait for an active run to finish and retry.
    Wait,
    /// Every track is `Done` or terminally `Stopped`.
    Done,
    /// No track can make further progress (all remaining steps are
    /// permanently blocked by conflicting claims under policy `fail`, or no
    /// tracks have any pending steps left that aren't waiting on a
    /// dependency this scheduler cannot resolve).
    Blocked,
}

fn step_key(track: &str, step: usize) -> String {
    format!("{track}/{step}")
}

/// Orchestrates N tracks of sequential steps (Section 4.11). Owns the
/// in-memory `OrchestrationState` plus the concurrency primitives that
/// gate how many tracks may be actively running at once.
pub struct Scheduler {
    state: Mutex<OrchestrationState>,
    state_path: PathBuf,
    concurrency_semaphore: Arc<Semaphore>,
    active_runs: AtomicUsize,
    max_concurrent: usize,
    policy: OrchestrationPolicy,
    worktree_isolated: bool,
    claim_lock: Mutex<()>,
}

impl Scheduler {
    /// Start a fresh orchestration over `tracks`, persisting state under
    /// `orchestration_state.json` in `runs_root`.
    pub fn new(
        runs_root: &Path,
        tracks: Vec<Track>,
        max_concurrent: usize,
        policy: OrchestrationPolicy,
        worktree_isolated: bool,
    ) -> Self {
        let state = OrchestrationState {
            tracks,
            active_runs: BTreeMap::new(),
            ownership_claims: BTreeMap::new(),
            step_states: BTreeMap::new(),
        };
        Self {
            state: Mutex::new(state),
            state_path: runs_root.join("orchestration_state.json"),
            concurrency_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active_runs: AtomicUsize::new(0),
            max_concurrent,
            policy,
            worktree_isolated,
            claim_lock: Mutex::new(()),
        }
    }

    /// Reattach to a previously persisted orchestration (resume path).
    pub async fn open(
        runs_root: &Path,
        max_concurrent: usize,
        policy: OrchestrationPolicy,
        worktree_isolated: bool,
    ) -> Result<Self> {
        let state_path = runs_root.join("orchestration_state.json");
        let bytes = fs::read(&state_path).map_err(|e| io_err(&state_path, e))?;
        let state: OrchestrationState = serde_json::from_slice(&bytes)?;
        let active = state.active_runs.len().min(max_concurrent);
        Ok(Self {
            state: Mutex::new(state),
            state_path,
            concurrency_semaphore: Arc::new(Semaphore::new(max_concurrent.saturating_sub(active))),
            active_runs: AtomicUsize::new(active),
            max_concurrent,
            policy,
            worktree_isolated,
            claim_lock: Mutex::new(()),
        })
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    async fn persist(&self, state: &OrchestrationState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.state_path, &bytes)
    }

    /// Step 1-2 of the main scheduling loop (Section 4.11): find the next
    /// launchable step, applying admission control, or report the
    /// orchestration's overall status.
    pub async fn next_action(&self) -> Result<Action> {
        let _claim_guard = self.claim_lock.lock().await;
        let state = self.state.lock().await;

        let mut all_done = true;
        let mut any_blocked_by_conflict = false;

        for track in &state.tracks {
            let track_done = track.steps.iter().enumerate().all(|(i, _)| {
                matches!(
                    state.step_states.get(&step_key(&track.name, i)),
                    Some(StepState::Done) | Some(StepState::Stopped)
                )
            });
            if track_done {
                continue;
            }
            all_done = false;

            if state.active_runs.contains_key(&track.name) {
                // This track already has a run in flight; it cannot launch
                // another step until that one completes.
                continue;
            }

            let Some((step_index, step)) = track
                .steps
                .iter()
                .enumerate()
                .find(|(i, _)| state.step_states.get(&step_key(&track.name, *i)).is_none())
            else {
                continue;
            };

            if self.active_run_count() >= self.max_concurrent {
                continue;
            }

            if self.worktree_isolated {
                return Ok(Action::Launch { track: track.name.clone(), step: step_index });
            }

            let claim: Vec<String> = step.owns.iter().map(|p| normalize_claim(p)).collect();
            let active_claims: Vec<String> = state.ownership_claims.keys().cloned().collect();
            let conflicts = !claim.is_empty() && claims_conflict(&claim, &active_claims);

            if !conflicts {
                return Ok(Action::Launch { track: track.name.clone(), step: step_index });
            }

            match self.policy {
                OrchestrationPolicy::Force => {
                    return Ok(Action::Launch { track: track.name.clone(), step: step_index });
                }
                OrchestrationPolicy::Fail => {
                    return Err(SchedulerError::ClaimConflict {
                        track: track.name.clone(),
                        step: step_index,
                    });
                }
                OrchestrationPolicy::Serialize => {
                    any_blocked_by_conflict = true;
                }
            }
        }

        if all_done {
            return Ok(Action::Done);
        }
        if any_blocked_by_conflict || self.active_run_count() >= self.max_concurrent {
            if self.active_run_count() > 0 {
                return Ok(Action::Wait);
            }
            return Ok(Action::Blocked);
        }
        Ok(Action::Wait)
    }

    /// Reserve a step for launch: records the ownership claim, marks the
    /// step `Running`, acquires a concurrency permit, and persists the
    /// updated orchestration state (Section 4.11 step 3 "persist, continue").
    pub async fn reserve(&self, track: &str, step: usize, run_id: &RunId) -> Result<()> {
        let _claim_guard = self.claim_lock.lock().await;
        let _permit = self
            .concurrency_semaphore
            .clone()
            .try_acquire_owned()
            .ok();
        let mut state = self.state.lock().await;

        let track_ref = state
            .tracks
            .iter()
            .find(|t| t.name == track)
            .ok_or_else(|| SchedulerError::TrackNotFound(track.to_string()))?;
        let owns: Vec<String> = track_ref
            .steps
            .get(step)
            .ok_or_else(|| SchedulerError::StepNotFound(track.to_string(), step))?
            .owns
            .iter()
            .map(|p| normalize_claim(p))
            .collect();

        state.active_runs.insert(track.to_string(), run_id.clone());
        state.step_states.insert(step_key(track, step), StepState::Running);
        if !self.worktree_isolated {
            for pattern in owns {
                state.ownership_claims.insert(pattern, run_id.clone());
            }
        }
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        if let Some(permit) = _permit {
            std::mem::forget(permit);
        }

        self.persist(&state).await
    }

    /// Record that a track's in-flight run finished: release its
    /// ownership claims, mark the step `Done`/`Stopped`, release the
    /// concurrency permit, and persist (Section 4.11 step 3).
    pub async fn complete(&self, track: &str, step: usize, final_state: StepState) -> Result<()> {
        let _claim_guard = self.claim_lock.lock().await;
        let mut state = self.state.lock().await;

        state.active_runs.remove(track);
        state.step_states.insert(step_key(track, step), final_state);
        state.ownership_claims.retain(|_, owner| {
            state
                .active_runs
                .values()
                .any(|active_run| active_run == owner)
        });

        let prev = self.active_runs.fetch_sub(1, Ordering::SeqCst);
        if prev > 0 {
            self.concurrency_semaphore.add_permits(1);
        }

        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::orchestration::TrackStep;
    use tempfile::TempDir;

    fn track(name: &str, owns: &[&str]) -> Track {
        Track {
            name: name.to_string(),
            steps: vec![TrackStep {
                task_file: format!("{name}.md"),
                allowlist: vec![],
                owns: owns.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }

    #[tokio::test]
    async fn launches_first_pending_step() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/a/**"])],
            2,
            OrchestrationPolicy::Serialize,
            false,
        );
        let action = sched.next_action().await.unwrap();
        assert_eq!(action, Action::Launch { track: "a".to_string(), step: 0 });
    }

    #[tokio::test]
    async fn conflicting_claims_wait_under_serialize_policy() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/shared/**"]), track("b", &["src/shared/sub/**"])],
            2,
            OrchestrationPolicy::Serialize,
            false,
        );
        sched.reserve("a", 0, &RunId::from_string("20260101000000")).await.unwrap();
        let action = sched.next_action().await.unwrap();
        assert_eq!(action, Action::Wait);
    }

    #[tokio::test]
    async fn fail_policy_returns_conflict_error() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/shared/**"]), track("b", &["src/shared/sub/**"])],
            2,
            OrchestrationPolicy::Fail,
            false,
        );
        sched.reserve("a", 0, &RunId::from_string("20260101000000")).await.unwrap();
        let err = sched.next_action().await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClaimConflict { .. }));
    }

    #[tokio::test]
    async fn worktree_isolation_ignores_claim_conflicts() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/shared/**"]), track("b", &["src/shared/**"])],
            2,
            OrchestrationPolicy::Serialize,
            true,
        );
        sched.reserve("a", 0, &RunId::from_string("20260101000000")).await.unwrap();
        let action = sched.next_action().await.unwrap();
        assert_eq!(action, Action::Launch { track: "b".to_string(), step: 0 });
    }

    #[tokio::test]
    async fn completing_all_steps_reports_done() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/a/**"])],
            2,
            OrchestrationPolicy::Serialize,
            false,
        );
        sched.reserve("a", 0, &RunId::from_string("20260101000000")).await.unwrap();
        sched.complete("a", 0, StepState::Done).await.unwrap();
        let action = sched.next_action().await.unwrap();
        assert_eq!(action, Action::Done);
        assert_eq!(sched.active_run_count(), 0);
    }

    #[tokio::test]
    async fn persists_state_to_disk_across_reserve_and_complete() {
        let dir = TempDir::new().unwrap();
        let sched = Scheduler::new(
            dir.path(),
            vec![track("a", &["src/a/**"])],
            2,
            OrchestrationPolicy::Serialize,
            false,
        );
        sched.reserve("a", 0, &RunId::from_string("20260101000000")).await.unwrap();
        assert!(dir.path().join("orchestration_state.json").exists());

        let reopened = Scheduler::open(dir.path(), 2, OrchestrationPolicy::Serialize, false)
            .await
            .unwrap();
        assert_eq!(reopened.active_run_count(), 1);
    }
}
