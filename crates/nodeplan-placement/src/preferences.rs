//! Preference relaxation.
//!
//! Soft constraints are first treated as hard. When a pod cannot be placed,
//! one of them is dropped and placement is retried, until the pod fits or
//! nothing soft is left.

use crate::convert::PodCandidate;
use nodeplan_api::WhenUnsatisfiable;
use std::fmt;

/// What a single relaxation step removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relaxation {
    /// Moved on to the next ORed required node-affinity term.
    RequiredNodeAffinityTerm,
    PreferredPodAffinity,
    PreferredPodAntiAffinity,
    PreferredNodeAffinity,
    ScheduleAnywaySpread,
}

impl fmt::Display for Relaxation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relaxation::RequiredNodeAffinityTerm => "required node affinity term",
            Relaxation::PreferredPodAffinity => "preferred pod affinity",
            Relaxation::PreferredPodAntiAffinity => "preferred pod anti-affinity",
            Relaxation::PreferredNodeAffinity => "preferred node affinity",
            Relaxation::ScheduleAnywaySpread => "ScheduleAnyway topology spread",
        };
        f.write_str(s)
    }
}

impl PodCandidate {
    /// Drop one soft constraint. Returns `None` once only hard constraints
    /// remain.
    pub fn relax(&mut self) -> Option<Relaxation> {
        if self.required_terms.len() > 1 {
            self.required_terms.remove(0);
            return Some(Relaxation::RequiredNodeAffinityTerm);
        }
        // Lightest pod terms go first.
        if self.preferred_pod_affinity.pop().is_some() {
            return Some(Relaxation::PreferredPodAffinity);
        }
        if self.preferred_pod_anti_affinity.pop().is_some() {
            return Some(Relaxation::PreferredPodAntiAffinity);
        }
        // Only the heaviest node term is in force; dropping it tries the next.
        if !self.preferred_terms.is_empty() {
            self.preferred_terms.remove(0);
            return Some(Relaxation::PreferredNodeAffinity);
        }
        if let Some(i) = self
            .topology_spread
            .iter()
            .position(|c| c.when_unsatisfiable == WhenUnsatisfiable::ScheduleAnyway)
        {
            self.topology_spread.remove(i);
            return Some(Relaxation::ScheduleAnywaySpread);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplan_api::{
        NodeAffinity, NodeSelectorTerm, Pod, PodAffinity, PodAffinityTerm, PreferredSchedulingTerm,
        TopologySpreadConstraint, WeightedPodAffinityTerm,
    };
    use nodeplan_core::labels::{LABEL_HOSTNAME, LABEL_TOPOLOGY_ZONE};
    use nodeplan_core::{LabelSelector, NodeSelectorRequirement, Operator};

    fn zone_term(zone: &str) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: vec![NodeSelectorRequirement::new(LABEL_TOPOLOGY_ZONE, Operator::In, &[zone])],
        }
    }

    fn weighted(weight: i32, app: &str) -> WeightedPodAffinityTerm {
        WeightedPodAffinityTerm {
            weight,
            pod_affinity_term: PodAffinityTerm {
                label_selector: Some(LabelSelector::from_labels(&[("app", app)])),
                namespaces: vec![],
                topology_key: LABEL_HOSTNAME.into(),
            },
        }
    }

    #[test]
    fn relaxes_in_order_until_only_hard_constraints_remain() {
        let mut pod = Pod::new("default", "web-0");
        pod.affinity.node_affinity = Some(NodeAffinity {
            required: vec![zone_term("a"), zone_term("b")],
            preferred: vec![PreferredSchedulingTerm { weight: 10, preference: zone_term("b") }],
        });
        pod.affinity.pod_affinity = Some(PodAffinity {
            required: vec![],
            preferred: vec![weighted(100, "cache"), weighted(5, "db")],
        });
        pod.affinity.pod_anti_affinity = Some(PodAffinity {
            required: vec![],
            preferred: vec![weighted(1, "web")],
        });
        pod.topology_spread_constraints = vec![
            TopologySpreadConstraint {
                max_skew: 1,
                topology_key: LABEL_TOPOLOGY_ZONE.into(),
                when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
                label_selector: None,
                min_domains: None,
            },
            TopologySpreadConstraint {
                max_skew: 1,
                topology_key: LABEL_HOSTNAME.into(),
                when_unsatisfiable: WhenUnsatisfiable::ScheduleAnyway,
                label_selector: None,
                min_domains: None,
            },
        ];
        let mut candidate = PodCandidate::from_pod(&pod).unwrap();

        let mut steps = Vec::new();
        while let Some(step) = candidate.relax() {
            steps.push(step);
        }
        assert_eq!(
            steps,
            [
                Relaxation::RequiredNodeAffinityTerm,
                Relaxation::PreferredPodAffinity,
                Relaxation::PreferredPodAffinity,
                Relaxation::PreferredPodAntiAffinity,
                Relaxation::PreferredNodeAffinity,
                Relaxation::ScheduleAnywaySpread,
            ]
        );
        assert_eq!(candidate.required_terms.len(), 1);
        assert_eq!(candidate.topology_spread.len(), 1);
        assert_eq!(
            candidate.topology_spread[0].when_unsatisfiable,
            WhenUnsatisfiable::DoNotSchedule
        );
    }

    #[test]
    fn lightest_pod_affinity_term_goes_first() {
        let mut pod = Pod::new("default", "web-0");
        pod.affinity.pod_affinity = Some(PodAffinity {
            required: vec![],
            preferred: vec![weighted(5, "db"), weighted(100, "cache")],
        });
        let mut candidate = PodCandidate::from_pod(&pod).unwrap();
        assert_eq!(candidate.relax(), Some(Relaxation::PreferredPodAffinity));
        assert_eq!(candidate.preferred_pod_affinity.len(), 1);
        assert_eq!(candidate.preferred_pod_affinity[0].weight, 100);
        assert_eq!(candidate.relax(), Some(Relaxation::PreferredPodAffinity));
        assert_eq!(candidate.relax(), None);
    }
}
