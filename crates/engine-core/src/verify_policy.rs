//! Verification Policy (Section 4.6): select which tiers run for a given
//! milestone and change set.

use crate::milestone::Milestone;
use crate::types::{RiskLevel, Tier};
use serde::{Deserialize, Serialize};

/// One recorded reason a tier was (or was not) selected, for
/// `state.tier_reasons` auditability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSelection {
    pub tier: Tier,
    pub selected: bool,
    pub reasons: Vec<String>,
}

fn pattern_matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pat| {
        glob::Pattern::new(pat).is_ok_and(|p| p.matches(path))
    })
}

/// Select verification tiers for a milestone.
///
/// - tier0 always runs.
/// - tier1 runs if changed files hit a risk trigger, milestone risk is
///   high, or this is the last milestone. Risk triggers configured for
///   tier2 are normalized to tier1 at selection time.
/// - tier2 runs only at run end (last milestone).
pub fn select_tiers(
    milestone: &Milestone,
    changed_files: &[String],
    risk_triggers: &[String],
    is_last_milestone: bool,
) -> Vec<TierSelection> {
    let mut tier0_reasons = vec!["tier0 always runs".to_string()];
    let tier0 = TierSelection {
        tier: Tier::Tier0,
        selected: true,
        reasons: std::mem::take(&mut tier0_reasons),
    };

    let risk_trigger_hit = changed_files
        .iter()
        .any(|f| pattern_matches_any(risk_triggers, f));

    let mut tier1_reasons = Vec::new();
    if risk_trigger_hit {
        tier1_reasons.push("changed files matched a risk trigger pattern".to_string());
    }
    if milestone.risk_level == RiskLevel::High {
        tier1_reasons.push("milestone risk_level is high".to_string());
    }
    if is_last_milestone {
        tier1_reasons.push("last milestone in the run".to_string());
    }
    let tier1_selected = !tier1_reasons.is_empty();
    let tier1 = TierSelection {
        tier: Tier::Tier1,
        selected: tier1_selected,
        reasons: tier1_reasons,
    };

    let mut tier2_reasons = Vec::new();
    if is_last_milestone {
        tier2_reasons.push("last milestone in the run".to_string());
    }
    let tier2_selected = is_last_milestone;
    let tier2 = TierSelection {
        tier: Tier::Tier2,
        selected: tier2_selected,
        reasons: tier2_reasons,
    };

    vec![tier0, tier1, tier2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milestone(risk: RiskLevel) -> Milestone {
        Milestone {
            goal: "g".to_string(),
            files_expected: vec![],
            done_checks: vec![],
            risk_level: risk,
        }
    }

    #[test]
    fn tier0_always_selected() {
        let sel = select_tiers(&milestone(RiskLevel::Low), &[], &[], false);
        assert!(sel[0].selected);
    }

    #[test]
    fn tier1_selected_on_risk_trigger_match() {
        let sel = select_tiers(
            &milestone(RiskLevel::Low),
            &["migrations/0001.sql".to_string()],
            &["migrations/**".to_string()],
            false,
        );
        assert!(sel[1].selected);
        assert!(!sel[2].selected);
    }

    #[test]
    fn tier1_selected_on_high_risk_milestone() {
        let sel = select_tiers(&milestone(RiskLevel::High), &[], &[], false);
        assert!(sel[1].selected);
    }

    #[test]
    fn tier1_and_tier2_selected_on_last_milestone() {
        let sel = select_tiers(&milestone(RiskLevel::Low), &[], &[], true);
        assert!(sel[1].selected);
        assert!(sel[2].selected);
    }

    #[test]
    fn tier2_never_selected_mid_run() {
        let sel = select_tiers(&milestone(RiskLevel::High), &[], &[], false);
        assert!(!sel[2].selected);
    }
}
