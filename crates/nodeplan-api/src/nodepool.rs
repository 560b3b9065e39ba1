//! NodePools: templates for the nodes the provisioner may create.

use crate::nodeclass::KubeletConfiguration;
use crate::pod::Taint;
use nodeplan_core::labels::LABEL_NODEPOOL;
use nodeplan_core::{
    NillableDuration, NodeSelectorRequirement, Requirement, RequirementError, Requirements,
    ResourceList,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight used when a NodePool does not set one.
pub const DEFAULT_WEIGHT: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    /// Unix timestamp (seconds) the pool was created; older pools win ties.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub weight: Option<i32>,
    pub template: NodeClaimTemplate,
    #[serde(default)]
    pub disruption: Disruption,
    /// Ceiling on the total capacity of nodes launched from this pool.
    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Taints removed by an agent once the node is initialized. The
    /// simulator ignores them.
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
    #[serde(default)]
    pub requirements: Vec<NodeSelectorRequirement>,
    pub node_class_ref: NodeClassReference,
    /// Overrides the NodeClass kubelet settings when present.
    #[serde(default)]
    pub kubelet: Option<KubeletConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeClassReference {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsolidationPolicy {
    WhenEmpty,
    #[default]
    WhenUnderutilized,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disruption {
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    #[serde(default)]
    pub consolidate_after: Option<NillableDuration>,
    #[serde(default)]
    pub expire_after: Option<NillableDuration>,
}

impl NodePool {
    pub fn new(name: &str, node_class: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: 0,
            weight: None,
            template: NodeClaimTemplate {
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                taints: Vec::new(),
                startup_taints: Vec::new(),
                requirements: Vec::new(),
                node_class_ref: NodeClassReference {
                    name: node_class.to_string(),
                },
                kubelet: None,
            },
            disruption: Disruption::default(),
            limits: ResourceList::new(),
        }
    }

    pub fn weight(&self) -> i32 {
        self.weight.unwrap_or(DEFAULT_WEIGHT)
    }

    /// Requirements every node from this pool carries: the template
    /// requirements, the template labels, and the pool's own label.
    pub fn requirements(&self) -> Result<Requirements, RequirementError> {
        let mut reqs = Requirements::from_selector(&self.template.requirements)?;
        reqs.add_all(&Requirements::from_labels(&self.template.labels));
        reqs.add(Requirement::single(LABEL_NODEPOOL, &self.name));
        Ok(reqs)
    }
}
