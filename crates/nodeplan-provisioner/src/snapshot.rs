//! Cluster state handed to a pass, and the per-pass index built from it.

use nodeplan_api::{AmiFamily, FieldError, NodeClass, NodePool, Pod, Validate, ValidationErrors};
use nodeplan_catalog::Arch;
use nodeplan_catalog::amifamily::ssm_alias;
use nodeplan_core::ResourceList;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

/// Everything the caller knows about the cluster at pass start. The
/// provisioner only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
    #[serde(default)]
    pub node_classes: Vec<NodeClass>,
    /// Capacity already launched per NodePool, counted against its limits.
    #[serde(default)]
    pub usage: BTreeMap<String, ResourceList>,
}

/// A valid NodePool joined with its valid NodeClass.
#[derive(Debug, Clone)]
pub struct IndexedPool {
    pub pool: NodePool,
    pub node_class: Arc<NodeClass>,
}

/// NodePool to NodeClass references, resolved once per pass. Objects that
/// fail validation are left out and listed in `invalid`.
#[derive(Debug, Clone, Default)]
pub struct PassIndex {
    pub pools: Vec<IndexedPool>,
    pub node_classes: BTreeMap<String, Arc<NodeClass>>,
    pub invalid: Vec<ValidationErrors>,
}

impl PassIndex {
    pub fn build(snapshot: &ClusterSnapshot) -> Self {
        let mut index = PassIndex::default();

        let mut broken_classes = BTreeSet::new();
        for node_class in &snapshot.node_classes {
            match node_class.validate() {
                Ok(()) => {
                    index
                        .node_classes
                        .insert(node_class.name.clone(), Arc::new(node_class.clone()));
                }
                Err(e) => {
                    warn!(nodeclass = %node_class.name, error = %e, "skipping invalid nodeclass");
                    broken_classes.insert(node_class.name.clone());
                    index.invalid.push(e);
                }
            }
        }

        for pool in &snapshot.node_pools {
            if let Err(e) = pool.validate() {
                warn!(nodepool = %pool.name, error = %e, "skipping invalid nodepool");
                index.invalid.push(e);
                continue;
            }
            let class_name = &pool.template.node_class_ref.name;
            match index.node_classes.get(class_name) {
                Some(node_class) => index.pools.push(IndexedPool {
                    pool: pool.clone(),
                    node_class: node_class.clone(),
                }),
                None => {
                    let message = if broken_classes.contains(class_name) {
                        format!("nodeclass {class_name} is invalid")
                    } else {
                        format!("nodeclass {class_name} not found")
                    };
                    warn!(nodepool = %pool.name, nodeclass = %class_name, "skipping nodepool without usable nodeclass");
                    index.invalid.push(ValidationErrors {
                        kind: "NodePool",
                        name: pool.name.clone(),
                        errors: vec![FieldError {
                            field: "template.nodeClassRef.name".to_string(),
                            message,
                        }],
                    });
                }
            }
        }
        index
    }

    /// SSM parameters needed for default images of NodeClasses without
    /// image selector terms.
    pub fn ssm_parameters(&self, kubernetes_version: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for node_class in self.node_classes.values() {
            let family = node_class.ami_family();
            if !node_class.ami_selector_terms.is_empty() || family == AmiFamily::Custom {
                continue;
            }
            for accelerated in [false, true] {
                for arch in [Arch::Amd64, Arch::Arm64] {
                    names.extend(ssm_alias(family, arch, accelerated, kubernetes_version));
                }
            }
        }
        names
    }
}
