//! Milestone type, produced by the planner worker (Section 3, 4.4).

use crate::types::RiskLevel;
use serde::{Deserialize, Serialize};

/// A unit of work with a goal, expected files, and completion checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub goal: String,
    pub files_expected: Vec<String>,
    pub done_checks: Vec<String>,
    pub risk_level: RiskLevel,
}
