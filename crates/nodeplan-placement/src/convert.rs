//! Conversion from API pods to the placement engine's [`PodCandidate`].
//!
//! Node selectors and node affinity are parsed into requirement sets once,
//! so the packer never re-parses selector expressions.

use crate::aggregate::pod_requests;
use nodeplan_api::{
    Pod, PodAffinityTerm, Toleration, TopologySpreadConstraint, WeightedPodAffinityTerm,
};
use nodeplan_core::{LabelSelector, RequirementError, Requirements, ResourceList};
use std::collections::BTreeMap;

/// A pending pod, reduced to what placement needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PodCandidate {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub requests: ResourceList,
    pub node_selector: Requirements,
    /// Required node-affinity terms. Terms are ORed; the first is in force.
    pub required_terms: Vec<Requirements>,
    /// Preferred node-affinity terms, heaviest first; the first is in force.
    pub preferred_terms: Vec<(i32, Requirements)>,
    pub pod_affinity: Vec<PodAffinityTerm>,
    pub pod_anti_affinity: Vec<PodAffinityTerm>,
    /// Preferred pod (anti-)affinity, heaviest first. All are in force until
    /// relaxed.
    pub preferred_pod_affinity: Vec<WeightedPodAffinityTerm>,
    pub preferred_pod_anti_affinity: Vec<WeightedPodAffinityTerm>,
    pub topology_spread: Vec<TopologySpreadConstraint>,
    pub tolerations: Vec<Toleration>,
}

impl PodCandidate {
    pub fn from_pod(pod: &Pod) -> Result<Self, RequirementError> {
        let node_selector = Requirements::from_labels(&pod.node_selector);
        let mut required_terms = Vec::new();
        let mut preferred_terms = Vec::new();
        if let Some(node_affinity) = &pod.affinity.node_affinity {
            for term in &node_affinity.required {
                required_terms.push(Requirements::from_selector(&term.match_expressions)?);
            }
            for term in &node_affinity.preferred {
                let reqs = Requirements::from_selector(&term.preference.match_expressions)?;
                preferred_terms.push((term.weight, reqs));
            }
        }
        preferred_terms.sort_by(|a, b| b.0.cmp(&a.0));

        let (pod_affinity, mut preferred_pod_affinity) = pod
            .affinity
            .pod_affinity
            .as_ref()
            .map(|a| (a.required.clone(), a.preferred.clone()))
            .unwrap_or_default();
        let (pod_anti_affinity, mut preferred_pod_anti_affinity) = pod
            .affinity
            .pod_anti_affinity
            .as_ref()
            .map(|a| (a.required.clone(), a.preferred.clone()))
            .unwrap_or_default();
        preferred_pod_affinity.sort_by(|a, b| b.weight.cmp(&a.weight));
        preferred_pod_anti_affinity.sort_by(|a, b| b.weight.cmp(&a.weight));

        Ok(Self {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            uid: pod.uid_or_id(),
            labels: pod.labels.clone(),
            requests: pod_requests(pod),
            node_selector,
            required_terms,
            preferred_terms,
            pod_affinity,
            pod_anti_affinity,
            preferred_pod_affinity,
            preferred_pod_anti_affinity,
            topology_spread: pod.topology_spread_constraints.clone(),
            tolerations: pod.tolerations.clone(),
        })
    }

    /// `namespace/name`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Hard requirements, one set per required node-affinity term. Used to
    /// decide NodePool eligibility, where any term may apply.
    pub fn strict_alternatives(&self) -> Vec<Requirements> {
        if self.required_terms.is_empty() {
            return vec![self.node_selector.clone()];
        }
        self.required_terms
            .iter()
            .map(|term| {
                let mut reqs = self.node_selector.clone();
                reqs.add_all(term);
                reqs
            })
            .collect()
    }

    /// Requirements currently in force: node selector, the first required
    /// term, and the heaviest remaining preferred term.
    pub fn requirements(&self) -> Result<Requirements, nodeplan_core::Infeasible> {
        let mut reqs = self.node_selector.clone();
        if let Some(term) = self.required_terms.first() {
            reqs.add_all(term);
        }
        if let Some((_, term)) = self.preferred_terms.first() {
            reqs.add_all(term);
        }
        reqs.check_feasible()?;
        Ok(reqs)
    }

    pub fn affinity_terms(&self) -> impl Iterator<Item = &PodAffinityTerm> {
        self.pod_affinity
            .iter()
            .chain(self.preferred_pod_affinity.iter().map(|w| &w.pod_affinity_term))
    }

    pub fn anti_affinity_terms(&self) -> impl Iterator<Item = &PodAffinityTerm> {
        self.pod_anti_affinity
            .iter()
            .chain(self.preferred_pod_anti_affinity.iter().map(|w| &w.pod_affinity_term))
    }

    /// Topology keys this pod cares about, in any form.
    pub fn topology_keys(&self) -> impl Iterator<Item = &str> {
        self.topology_spread
            .iter()
            .map(|c| c.topology_key.as_str())
            .chain(self.affinity_terms().map(|t| t.topology_key.as_str()))
            .chain(self.anti_affinity_terms().map(|t| t.topology_key.as_str()))
    }

    /// Whether any selector of this pod (spread, affinity, anti-affinity)
    /// matches `other`. Used to couple pods into packing groups.
    pub fn selects(&self, other: &PodCandidate) -> bool {
        let spread = self.topology_spread.iter().any(|c| {
            other.namespace == self.namespace && selector_matches(c.label_selector.as_ref(), &other.labels)
        });
        spread
            || self
                .affinity_terms()
                .chain(self.anti_affinity_terms())
                .any(|term| term_matches(term, &self.namespace, &other.namespace, &other.labels))
    }
}

/// A missing selector selects nothing.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    selector.is_some_and(|s| s.matches(labels))
}

/// Whether a pod affinity term declared by a pod in `owner_ns` selects a pod
/// in `namespace` carrying `labels`. An empty namespace list means the
/// owner's namespace.
pub fn term_matches(
    term: &PodAffinityTerm,
    owner_ns: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> bool {
    let in_scope = if term.namespaces.is_empty() {
        owner_ns == namespace
    } else {
        term.namespaces.iter().any(|ns| ns == namespace)
    };
    in_scope && selector_matches(term.label_selector.as_ref(), labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplan_api::{
        Affinity, NodeAffinity, NodeSelectorTerm, PodAffinity, PreferredSchedulingTerm,
    };
    use nodeplan_core::labels::{LABEL_ARCH, LABEL_HOSTNAME, LABEL_TOPOLOGY_ZONE};
    use nodeplan_core::{NodeSelectorRequirement, Operator};

    fn term(key: &str, values: &[&str]) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: vec![NodeSelectorRequirement::new(key, Operator::In, values)],
        }
    }

    fn make_pod() -> Pod {
        let mut pod = Pod::new("default", "web-0");
        pod.labels.insert("app".into(), "web".into());
        pod.node_selector.insert(LABEL_ARCH.into(), "amd64".into());
        pod
    }

    #[test]
    fn preferred_terms_sorted_heaviest_first() {
        let mut pod = make_pod();
        pod.affinity = Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![term(LABEL_TOPOLOGY_ZONE, &["us-west-2a", "us-west-2b"])],
                preferred: vec![
                    PreferredSchedulingTerm { weight: 1, preference: term(LABEL_TOPOLOGY_ZONE, &["us-west-2b"]) },
                    PreferredSchedulingTerm { weight: 50, preference: term(LABEL_TOPOLOGY_ZONE, &["us-west-2a"]) },
                ],
            }),
            ..Default::default()
        };
        let candidate = PodCandidate::from_pod(&pod).unwrap();
        assert_eq!(candidate.preferred_terms[0].0, 50);
        let reqs = candidate.requirements().unwrap();
        assert!(reqs.get(LABEL_TOPOLOGY_ZONE).unwrap().has("us-west-2a"));
        assert!(!reqs.get(LABEL_TOPOLOGY_ZONE).unwrap().has("us-west-2b"));
        assert!(reqs.has(LABEL_ARCH));
    }

    #[test]
    fn each_required_term_is_an_alternative() {
        let mut pod = make_pod();
        pod.affinity.node_affinity = Some(NodeAffinity {
            required: vec![term(LABEL_TOPOLOGY_ZONE, &["a"]), term(LABEL_TOPOLOGY_ZONE, &["b"])],
            preferred: vec![],
        });
        let candidate = PodCandidate::from_pod(&pod).unwrap();
        let alts = candidate.strict_alternatives();
        assert_eq!(alts.len(), 2);
        assert!(alts.iter().all(|a| a.has(LABEL_ARCH)));
    }

    #[test]
    fn conflicting_selector_and_term_are_infeasible() {
        let mut pod = make_pod();
        pod.affinity.node_affinity = Some(NodeAffinity {
            required: vec![term(LABEL_ARCH, &["arm64"])],
            preferred: vec![],
        });
        let candidate = PodCandidate::from_pod(&pod).unwrap();
        assert_eq!(candidate.requirements().unwrap_err().key, LABEL_ARCH);
    }

    #[test]
    fn malformed_expression_is_rejected() {
        let mut pod = make_pod();
        pod.affinity.node_affinity = Some(NodeAffinity {
            required: vec![NodeSelectorTerm {
                match_expressions: vec![NodeSelectorRequirement::new("cpu", Operator::Gt, &["lots"])],
            }],
            preferred: vec![],
        });
        assert!(PodCandidate::from_pod(&pod).is_err());
    }

    #[test]
    fn anti_affinity_couples_pods_in_scope() {
        let mut pod = make_pod();
        pod.affinity.pod_anti_affinity = Some(PodAffinity {
            required: vec![PodAffinityTerm {
                label_selector: Some(LabelSelector::from_labels(&[("app", "web")])),
                namespaces: vec![],
                topology_key: LABEL_HOSTNAME.into(),
            }],
            preferred: vec![],
        });
        let a = PodCandidate::from_pod(&pod).unwrap();
        let mut other = make_pod();
        other.name = "web-1".into();
        let b = PodCandidate::from_pod(&other).unwrap();
        assert!(a.selects(&b));
        assert!(!b.selects(&a));

        other.namespace = "staging".into();
        let c = PodCandidate::from_pod(&other).unwrap();
        assert!(!a.selects(&c));
        assert_eq!(a.topology_keys().collect::<Vec<_>>(), [LABEL_HOSTNAME]);
    }
}
