//! Spot node scheduling
//!
//! Spot nodes carry the `cloud.google.com/gke-spot=true:NoSchedule` taint.
//! A workload that opts in tolerates the taint and either requires spot
//! nodes or prefers them with a weight, always leaving a non-zero
//! preference for regular nodes so the scheduler has somewhere to go.

use keel_common::Environment;
use serde::{Deserialize, Serialize};

use crate::k8s::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PreferredSchedulingTerm, Toleration,
};

/// Taint and node label key of GKE spot nodes
pub const SPOT_LABEL: &str = "cloud.google.com/gke-spot";

const MAX_WEIGHT: u32 = 100;

/// Caller intent for spot scheduling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpotPolicy {
    /// Opt in to spot nodes
    pub enabled: bool,
    /// Preference strength (0-100) when not required
    pub weight: u32,
    /// Require spot nodes instead of preferring them
    pub required: bool,
}

impl Default for SpotPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: 50,
            required: false,
        }
    }
}

impl SpotPolicy {
    /// Enabled soft preference with the given weight
    pub fn preferred(weight: u32) -> Self {
        Self {
            enabled: true,
            weight,
            required: false,
        }
    }

    /// Enabled hard requirement
    pub fn required() -> Self {
        Self {
            enabled: true,
            required: true,
            ..Self::default()
        }
    }
}

/// Pod scheduling fields derived from a [`SpotPolicy`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpotScheduling {
    /// Tolerations to add
    pub tolerations: Vec<Toleration>,
    /// Affinity to set
    pub affinity: Option<Affinity>,
}

impl SpotScheduling {
    /// Whether the policy produced anything
    pub fn is_empty(&self) -> bool {
        self.tolerations.is_empty() && self.affinity.is_none()
    }
}

fn spot_term(operator: &str) -> NodeSelectorTerm {
    NodeSelectorTerm {
        match_expressions: vec![NodeSelectorRequirement {
            key: SPOT_LABEL.to_string(),
            operator: operator.to_string(),
            values: vec!["true".to_string()],
        }],
    }
}

/// Compute tolerations and affinity. Adhoc environments never use spot.
pub fn compute(policy: &SpotPolicy, environment: Environment) -> SpotScheduling {
    if !policy.enabled || environment == Environment::Adhoc {
        return SpotScheduling::default();
    }

    let toleration = Toleration {
        key: Some(SPOT_LABEL.to_string()),
        operator: Some("Equal".to_string()),
        value: Some("true".to_string()),
        effect: Some("NoSchedule".to_string()),
    };

    let node_affinity = if policy.required {
        NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![spot_term("In")],
            }),
            ..Default::default()
        }
    } else {
        let weight = policy.weight.min(MAX_WEIGHT);
        NodeAffinity {
            required_during_scheduling_ignored_during_execution: None,
            preferred_during_scheduling_ignored_during_execution: vec![
                PreferredSchedulingTerm {
                    weight: weight.max(1),
                    preference: spot_term("In"),
                },
                PreferredSchedulingTerm {
                    weight: (MAX_WEIGHT - weight).max(1),
                    preference: spot_term("NotIn"),
                },
            ],
        }
    };

    SpotScheduling {
        tolerations: vec![toleration],
        affinity: Some(Affinity {
            node_affinity: Some(node_affinity),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn weights(scheduling: &SpotScheduling) -> (u32, u32) {
        let prefs = &scheduling
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution;
        assert_eq!(prefs[0].preference.match_expressions[0].operator, "In");
        assert_eq!(prefs[1].preference.match_expressions[0].operator, "NotIn");
        (prefs[0].weight, prefs[1].weight)
    }

    // =========================================================================
    // Story: Weighted preference never drops a direction to zero
    // =========================================================================

    #[rstest]
    #[case::balanced(50, 50, 50)]
    #[case::all_in(100, 100, 1)]
    #[case::none(0, 1, 100)]
    #[case::mostly(80, 80, 20)]
    #[case::over_max(250, 100, 1)]
    fn preferred_weights(#[case] weight: u32, #[case] spot: u32, #[case] non_spot: u32) {
        let s = compute(&SpotPolicy::preferred(weight), Environment::Managed);
        assert_eq!(weights(&s), (spot, non_spot));
        assert_eq!(s.tolerations.len(), 1);
    }

    #[test]
    fn required_uses_hard_affinity() {
        let s = compute(&SpotPolicy::required(), Environment::Managed);
        let node = s.affinity.unwrap().node_affinity.unwrap();
        let required = node
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(required.node_selector_terms[0].match_expressions[0].operator, "In");
        assert!(node
            .preferred_during_scheduling_ignored_during_execution
            .is_empty());
        assert_eq!(s.tolerations[0].key.as_deref(), Some(SPOT_LABEL));
    }

    // =========================================================================
    // Story: Spot is off in adhoc environments and when disabled
    // =========================================================================

    #[rstest]
    #[case::adhoc_preferred(SpotPolicy::preferred(70), Environment::Adhoc)]
    #[case::adhoc_required(SpotPolicy::required(), Environment::Adhoc)]
    #[case::disabled(SpotPolicy::default(), Environment::Managed)]
    fn no_scheduling_changes(#[case] policy: SpotPolicy, #[case] env: Environment) {
        assert!(compute(&policy, env).is_empty());
    }
}
