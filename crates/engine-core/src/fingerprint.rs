//! Environment fingerprinting (Section 3, GLOSSARY "Fingerprint
//! (environment)"). Captured at INIT and re-captured on resume; drift
//! blocks resume unless forcibly overridden.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFingerprint {
    pub runtime_version: String,
    pub lockfile_hash: Option<String>,
    pub worker_binary_versions: Vec<WorkerBinaryVersion>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBinaryVersion {
    pub worker: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintDrift {
    pub runtime_version_changed: bool,
    pub lockfile_hash_changed: bool,
    pub worker_versions_changed: Vec<String>,
}

impl FingerprintDrift {
    pub fn has_drift(&self) -> bool {
        self.runtime_version_changed
            || self.lockfile_hash_changed
            || !self.worker_versions_changed.is_empty()
    }
}

impl EnvFingerprint {
    /// Hash a lockfile's contents for drift detection.
    pub fn hash_lockfile(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Compare this fingerprint (captured on resume) against the one
    /// captured at INIT.
    pub fn diff(&self, baseline: &Self) -> FingerprintDrift {
        let mut worker_versions_changed = Vec::new();
        for worker in &self.worker_binary_versions {
            if let Some(base) = baseline
                .worker_binary_versions
                .iter()
                .find(|w| w.worker == worker.worker)
            {
                if base.version != worker.version {
                    worker_versions_changed.push(worker.worker.clone());
                }
            } else {
                worker_versions_changed.push(worker.worker.clone());
            }
        }

        FingerprintDrift {
            runtime_version_changed: self.runtime_version != baseline.runtime_version,
            lockfile_hash_changed: self.lockfile_hash != baseline.lockfile_hash,
            worker_versions_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fp(runtime: &str, lock: Option<&str>, workers: &[(&str, &str)]) -> EnvFingerprint {
        EnvFingerprint {
            runtime_version: runtime.to_string(),
            lockfile_hash: lock.map(str::to_string),
            worker_binary_versions: workers
                .iter()
                .map(|(w, v)| WorkerBinaryVersion {
                    worker: w.to_string(),
                    version: v.to_string(),
                })
                .collect(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn identical_fingerprints_have_no_drift() {
        let a = fp("1.80.0", Some("hash1"), &[("claude", "1.0")]);
        let b = a.clone();
        assert!(!a.diff(&b).has_drift());
    }

    #[test]
    fn runtime_and_lockfile_drift_detected() {
        let base = fp("1.80.0", Some("hash1"), &[]);
        let resumed = fp("1.81.0", Some("hash2"), &[]);
        let drift = resumed.diff(&base);
        assert!(drift.runtime_version_changed);
        assert!(drift.lockfile_hash_changed);
        assert!(drift.has_drift());
    }

    #[test]
    fn worker_version_drift_detected() {
        let base = fp("1.80.0", None, &[("claude", "1.0")]);
        let resumed = fp("1.80.0", None, &[("claude", "1.1")]);
        let drift = resumed.diff(&base);
        assert_eq!(drift.worker_versions_changed, vec!["claude".to_string()]);
    }

    #[test]
    fn hash_lockfile_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cargo.lock");
        std::fs::write(&path, b"lockfile contents").unwrap();
        let h1 = EnvFingerprint::hash_lockfile(&path).unwrap();
        let h2 = EnvFingerprint::hash_lockfile(&path).unwrap();
        assert_eq!(h1, h2);
    }
}
