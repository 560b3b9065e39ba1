//! Pod label selectors, evaluated with the requirement algebra.

use crate::requirements::{NodeSelectorRequirement, RequirementError, Requirements};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels(pairs: &[(&str, &str)]) -> Self {
        Self {
            match_labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn requirements(&self) -> Result<Requirements, RequirementError> {
        let mut reqs = Requirements::from_selector(&self.match_expressions)?;
        reqs.add_all(&Requirements::from_labels(&self.match_labels));
        Ok(reqs)
    }

    /// An empty selector matches every label set. A malformed expression
    /// matches nothing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements()
            .map(|reqs| reqs.satisfies(labels))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::Operator;

    fn pod_labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_and_expressions_are_anded() {
        let selector = LabelSelector {
            match_labels: pod_labels(&[("app", "web")]),
            match_expressions: vec![NodeSelectorRequirement::new(
                "tier",
                Operator::NotIn,
                &["batch"],
            )],
        };
        assert!(selector.matches(&pod_labels(&[("app", "web")])));
        assert!(selector.matches(&pod_labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!selector.matches(&pod_labels(&[("app", "web"), ("tier", "batch")])));
        assert!(!selector.matches(&pod_labels(&[("app", "db")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(LabelSelector::default().matches(&pod_labels(&[("x", "y")])));
        assert!(LabelSelector::default().matches(&BTreeMap::new()));
    }
}
