//! Run Store (Section 4.1): durable, append-only persistence for one run.
//!
//! The store owns every byte under `<runs_root>/<run_id>/`. All mutations
//! funnel through this module: `state.json` is replaced whole-file via
//! temp-file+rename, the timeline is a strictly append-only JSON-lines
//! file, and the sequence counter is a small separate file so `append_event`
//! can read-increment-write it atomically relative to a crash.

use engine_core::event::{Event, EventPayload};
use engine_core::state::RunState;
use engine_core::types::RunId;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state not found for run {0}")]
    StateNotFound(String),
    #[error("malformed state.json: {0}")]
    MalformedState(#[from] serde_json::Error),
    #[error("path {0} escapes the run directory")]
    PathEscape(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` durably: write to a sibling temp file, `fsync`
/// it, then rename over the destination. A crash mid-write can only ever
/// leave the temp file around, never a half-written `path`.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    {
        let mut f = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        f.write_all(bytes).map_err(|e| io_err(&tmp_path, e))?;
        f.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Handle onto one run's on-disk directory tree (Section 6 "Run directory
/// layout").
#[derive(Debug, Clone)]
pub struct Store {
    run_dir: PathBuf,
}

impl Store {
    fn state_path(&self) -> PathBuf {
        self.run_dir.join("state.json")
    }

    fn timeline_path(&self) -> PathBuf {
        self.run_dir.join("timeline.jsonl")
    }

    fn seq_path(&self) -> PathBuf {
        self.run_dir.join("seq.txt")
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.run_dir.join("artifacts")
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.run_dir.join("handoffs")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.run_dir.join("checkpoints")
    }

    /// Create a fresh run directory tree and an empty timeline (Section
    /// 4.1 `init`).
    pub fn init(run_id: &RunId, runs_root: &Path) -> Result<Self> {
        let run_dir = runs_root.join(run_id.as_ref());
        for sub in ["artifacts", "handoffs", "checkpoints"] {
            let dir = run_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        let store = Self { run_dir };
        if !store.timeline_path().exists() {
            atomic_write(&store.timeline_path(), b"")?;
        }
        if !store.seq_path().exists() {
            atomic_write(&store.seq_path(), b"0")?;
        }
        Ok(store)
    }

    /// Attach to an existing run directory (resume path).
    pub fn open(run_id: &RunId, runs_root: &Path) -> Result<Self> {
        let run_dir = runs_root.join(run_id.as_ref());
        if !run_dir.join("state.json").exists() {
            return Err(StoreError::StateNotFound(run_id.to_string()));
        }
        Ok(Self { run_dir })
    }

    /// Replace `state.json` whole-file (Section 4.1 `write_state`).
    pub fn write_state(&self, state: &RunState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.state_path(), &bytes)
    }

    /// Read `state.json`, if present.
    pub fn read_state(&self) -> Result<Option<RunState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn read_seq(&self) -> Result<u64> {
        let path = self.seq_path();
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(content.trim().parse().unwrap_or(0))
    }

    /// Append one event to the timeline, assigning the next `seq` value.
    /// The counter file is only rewritten after the timeline append
    /// succeeds, so a write failure never consumes a sequence number
    /// (Section 4.1 `append_event`).
    pub fn append_event(
        &self,
        event_type: &str,
        source: &str,
        payload: EventPayload,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Event> {
        let seq = self.read_seq()? + 1;
        let event_type_parsed: engine_core::event::EventType = payload.event_type();
        debug_assert_eq!(event_type_parsed.as_str(), event_type);
        let event = Event {
            seq,
            timestamp: now,
            event_type: event_type_parsed,
            source: source.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let path = self.timeline_path();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        f.write_all(line.as_bytes()).map_err(|e| io_err(&path, e))?;
        f.sync_all().map_err(|e| io_err(&path, e))?;

        atomic_write(&self.seq_path(), seq.to_string().as_bytes())?;
        Ok(event)
    }

    /// Read the full timeline in append order.
    pub fn read_timeline(&self) -> Result<Vec<Event>> {
        let path = self.timeline_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StoreError::from))
            .collect()
    }

    fn guarded_path(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        use std::path::Component;
        if Path::new(name)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(StoreError::PathEscape(name.to_string()));
        }
        let joined = dir.join(name);
        let normalized: PathBuf = joined.components().collect();
        if !normalized.starts_with(&self.run_dir) {
            return Err(StoreError::PathEscape(name.to_string()));
        }
        Ok(joined)
    }

    pub fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.guarded_path(&self.artifacts_dir(), name)?;
        atomic_write(&path, bytes)?;
        Ok(path)
    }

    pub fn write_memo(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.guarded_path(&self.handoffs_dir(), name)?;
        atomic_write(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn write_plan(&self, text: &str) -> Result<()> {
        atomic_write(&self.run_dir.join("plan.md"), text.as_bytes())
    }

    pub fn write_summary(&self, text: &str) -> Result<()> {
        atomic_write(&self.run_dir.join("summary.md"), text.as_bytes())
    }

    pub fn write_config_snapshot(&self, config: &engine_core::Config) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.run_dir.join("config.snapshot.json"), &bytes)
    }

    pub fn write_fingerprint(&self, fp: &engine_core::EnvFingerprint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(fp)?;
        atomic_write(&self.run_dir.join("env.fingerprint.json"), &bytes)
    }

    pub fn read_fingerprint(&self) -> Result<Option<engine_core::EnvFingerprint>> {
        let path = self.run_dir.join("env.fingerprint.json");
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn write_checkpoint_sidecar(
        &self,
        commit_sha: &str,
        sidecar: &engine_core::CheckpointSidecar,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(sidecar)?;
        atomic_write(&self.checkpoints_dir().join(format!("{commit_sha}.json")), &bytes)
    }

    pub fn read_checkpoint_sidecar(
        &self,
        commit_sha: &str,
    ) -> Result<Option<engine_core::CheckpointSidecar>> {
        let path = self.checkpoints_dir().join(format!("{commit_sha}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::event::{PhaseTransitionPayload, RunInitPayload};
    use engine_core::scope::ScopeLock;
    use chrono::Utc;
    use tempfile::TempDir;

    fn new_store() -> (TempDir, Store, RunId) {
        let dir = TempDir::new().unwrap();
        let run_id = RunId::from_string("20260101000000");
        let store = Store::init(&run_id, dir.path()).unwrap();
        (dir, store, run_id)
    }

    #[test]
    fn init_creates_expected_subdirectories() {
        let (_dir, store, _id) = new_store();
        assert!(store.artifacts_dir().is_dir());
        assert!(store.handoffs_dir().is_dir());
        assert!(store.checkpoints_dir().is_dir());
        assert!(store.timeline_path().exists());
    }

    #[test]
    fn write_and_read_state_round_trips() {
        let (_dir, store, run_id) = new_store();
        let state = RunState::init(run_id, ScopeLock::default(), Utc::now());
        store.write_state(&state).unwrap();
        let read = store.read_state().unwrap().unwrap();
        assert_eq!(read.run_id, state.run_id);
        assert_eq!(read.phase, state.phase);
    }

    #[test]
    fn append_event_assigns_strictly_increasing_seq() {
        let (_dir, store, _id) = new_store();
        let e1 = store
            .append_event(
                "run_init",
                "supervisor",
                EventPayload::RunInit(RunInitPayload {
                    run_id: "x".to_string(),
                }),
                Utc::now(),
            )
            .unwrap();
        let e2 = store
            .append_event(
                "phase_transition",
                "supervisor",
                EventPayload::PhaseTransition(PhaseTransitionPayload {
                    from: "INIT".to_string(),
                    to: "PLAN".to_string(),
                }),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        let timeline = store.read_timeline().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].seq, 1);
        assert_eq!(timeline[1].seq, 2);
    }

    #[test]
    fn write_artifact_rejects_path_escape() {
        let (_dir, store, _id) = new_store();
        let err = store.write_artifact("../../etc/passwd", b"x").unwrap_err();
        assert!(matches!(err, StoreError::PathEscape(_)));
    }

    #[test]
    fn checkpoint_sidecar_round_trips_by_sha() {
        let (_dir, store, _id) = new_store();
        let sidecar = engine_core::CheckpointSidecar {
            run_id: "20260101000000".to_string(),
            milestone_index: 0,
            milestone_goal: "do nothing".to_string(),
            verification_evidence: vec![],
            base_sha: "deadbeef".to_string(),
            timestamp: Utc::now(),
        };
        store.write_checkpoint_sidecar("abc123", &sidecar).unwrap();
        let read = store.read_checkpoint_sidecar("abc123").unwrap().unwrap();
        assert_eq!(read.milestone_goal, "do nothing");
        assert!(store.read_checkpoint_sidecar("missing").unwrap().is_none());
    }
}
