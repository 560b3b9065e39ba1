//! Turns a node stub and a chosen offering into a [`LaunchDescriptor`].

use crate::descriptor::{LaunchBlockDevice, LaunchDescriptor};
use crate::resolve::ResolvedNodeClass;
use crate::userdata::Bootstrap;
use crate::{MaterializeError, MaterializeResult};
use nodeplan_api::{NodeClass, NodePool};
use nodeplan_catalog::amifamily::default_block_device_mappings;
use nodeplan_catalog::{CatalogSettings, NodeProfile, OfferingCandidate};
use nodeplan_core::NodeplanConfig;
use nodeplan_core::config::ClusterConfig;
use nodeplan_core::labels::{self, LABEL_CAPACITY_TYPE, LABEL_NODECLASS, LABEL_NODEPOOL};
use nodeplan_core::resources::PODS;
use nodeplan_placement::NodeStub;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const ANNOTATION_NODEPOOL_HASH: &str = "karpenter.sh/nodepool-hash";
pub const ANNOTATION_NODECLASS_HASH: &str = "karpenter.k8s.aws/ec2nodeclass-hash";

pub const TAG_NODEPOOL: &str = "karpenter.sh/nodepool";
pub const TAG_NODECLAIM: &str = "karpenter.sh/nodeclaim";
pub const TAG_NODECLASS: &str = "karpenter.k8s.aws/ec2nodeclass";
pub const TAG_EKS_CLUSTER: &str = "eks:eks-cluster-name";
pub const TAG_NAME: &str = "Name";

/// Hex characters of the role digest in managed instance profile names.
const PROFILE_HASH_LEN: usize = 16;

pub struct Materializer {
    cluster: ClusterConfig,
    settings: CatalogSettings,
}

impl Materializer {
    pub fn new(cluster: ClusterConfig, settings: CatalogSettings) -> Self {
        Self { cluster, settings }
    }

    pub fn from_config(config: &NodeplanConfig) -> Self {
        Self::new(config.cluster.clone(), CatalogSettings::from_config(config))
    }

    /// Build the launch request for `stub` on `offering`, which must be one
    /// of the stub's offerings.
    pub fn materialize(
        &self,
        stub: &NodeStub,
        offering: &OfferingCandidate,
        pool: &NodePool,
        node_class: &NodeClass,
        resolved: &ResolvedNodeClass,
    ) -> MaterializeResult<LaunchDescriptor> {
        let zone = &offering.offering.zone;
        let subnet = resolved
            .subnet_for(zone)
            .ok_or_else(|| MaterializeError::NoSubnetInZone {
                nodeclass: node_class.name.clone(),
                zone: zone.clone(),
            })?;

        let arch = offering.instance_type.arch();
        let image = resolved
            .image_for(arch, offering.instance_type.is_accelerated())
            .ok_or_else(|| MaterializeError::NoImageForArch {
                arch: arch.as_str().to_string(),
                instance_type: offering.name().to_string(),
            })?;

        let mappings = if node_class.block_device_mappings.is_empty() {
            default_block_device_mappings(node_class.ami_family())
        } else {
            node_class.block_device_mappings.clone()
        };

        let labels = node_labels(stub, offering, pool, node_class);
        let user_data = self.user_data(offering, pool, node_class, &labels)?;

        let descriptor = LaunchDescriptor {
            name: stub.name.clone(),
            node_pool: pool.name.clone(),
            node_class: node_class.name.clone(),
            instance_type: offering.name().to_string(),
            instance_type_options: instance_type_options(stub, offering),
            zone: zone.clone(),
            zone_id: offering.offering.zone_id.clone(),
            capacity_type: offering.offering.capacity_type,
            price: offering.price(&self.settings),
            subnet_id: subnet.id.clone(),
            ami_id: image.id.clone(),
            security_group_ids: resolved.security_group_ids(),
            instance_profile: self.instance_profile(node_class)?,
            labels,
            annotations: annotations(pool, node_class)?,
            taints: pool.template.taints.clone(),
            startup_taints: pool.template.startup_taints.clone(),
            tags: self.tags(&stub.name, pool, node_class),
            block_device_mappings: mappings.iter().map(LaunchBlockDevice::from).collect(),
            metadata_options: node_class.metadata_options.clone().unwrap_or_default(),
            user_data,
            detailed_monitoring: node_class.detailed_monitoring,
            associate_public_ip_address: node_class.associate_public_ip_address,
            bound_pods: stub.pods.clone(),
        };
        debug!(
            node = %descriptor.name,
            instance_type = %descriptor.instance_type,
            zone = %descriptor.zone,
            capacity_type = %descriptor.capacity_type,
            subnet = %descriptor.subnet_id,
            ami = %descriptor.ami_id,
            "node materialized"
        );
        Ok(descriptor)
    }

    /// The NodeClass's user data merged with the family's bootstrap.
    fn user_data(
        &self,
        offering: &OfferingCandidate,
        pool: &NodePool,
        node_class: &NodeClass,
        labels: &BTreeMap<String, String>,
    ) -> MaterializeResult<Option<String>> {
        let profile = NodeProfile::for_pool(pool, node_class);
        let mut bootstrap_labels = pool.template.labels.clone();
        for key in [LABEL_NODEPOOL, LABEL_CAPACITY_TYPE] {
            if let Some(value) = labels.get(key) {
                bootstrap_labels.insert(key.to_string(), value.clone());
            }
        }
        let bootstrap = Bootstrap {
            cluster_name: &self.cluster.name,
            endpoint: self.cluster.endpoint.as_deref(),
            kubelet: &profile.kubelet,
            labels: bootstrap_labels,
            taints: pool
                .template
                .taints
                .iter()
                .chain(&pool.template.startup_taints)
                .cloned()
                .collect(),
            max_pods: offering.instance_type.capacity().get(PODS).value(),
        };
        bootstrap.render(node_class.ami_family(), node_class.user_data.as_deref())
    }

    fn tags(&self, node_name: &str, pool: &NodePool, node_class: &NodeClass) -> BTreeMap<String, String> {
        let mut tags = node_class.tags.clone();
        let cluster = &self.cluster.name;
        tags.insert(format!("kubernetes.io/cluster/{cluster}"), "owned".to_string());
        tags.insert(TAG_NODEPOOL.to_string(), pool.name.clone());
        tags.insert(TAG_NODECLAIM.to_string(), node_name.to_string());
        tags.insert(TAG_NODECLASS.to_string(), node_class.name.clone());
        tags.insert(TAG_EKS_CLUSTER.to_string(), cluster.clone());
        tags.entry(TAG_NAME.to_string())
            .or_insert_with(|| node_name.to_string());
        tags
    }

    fn instance_profile(&self, node_class: &NodeClass) -> MaterializeResult<String> {
        if let Some(profile) = &node_class.instance_profile {
            return Ok(profile.clone());
        }
        let role = node_class
            .role
            .as_ref()
            .ok_or_else(|| MaterializeError::NoInstanceProfile(node_class.name.clone()))?;
        let digest = hex::encode(Sha256::digest(
            format!("{}/{}/{role}", self.settings.region, node_class.name).as_bytes(),
        ));
        Ok(format!("{}_{}", self.cluster.name, &digest[..PROFILE_HASH_LEN]))
    }
}

/// The chosen type, then other types the stub could use in the same zone and
/// capacity type, cheapest first.
fn instance_type_options(stub: &NodeStub, chosen: &OfferingCandidate) -> Vec<String> {
    let mut seen = BTreeSet::from([chosen.name()]);
    let mut options = vec![chosen.name().to_string()];
    for candidate in &stub.offerings {
        if candidate.offering.zone == chosen.offering.zone
            && candidate.offering.capacity_type == chosen.offering.capacity_type
            && seen.insert(candidate.name())
        {
            options.push(candidate.name().to_string());
        }
    }
    options
}

fn node_labels(
    stub: &NodeStub,
    offering: &OfferingCandidate,
    pool: &NodePool,
    node_class: &NodeClass,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in offering.labels.iter() {
        for alias in labels::deprecated_aliases(key) {
            out.insert(alias.to_string(), value.clone());
        }
        out.insert(key.clone(), value.clone());
    }
    out.extend(stub.requirements.labels());
    out.extend(pool.template.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    out.insert(LABEL_NODEPOOL.to_string(), pool.name.clone());
    out.insert(LABEL_NODECLASS.to_string(), node_class.name.clone());
    out
}

fn hash_of<T: Serialize>(value: &T) -> MaterializeResult<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn annotations(pool: &NodePool, node_class: &NodeClass) -> MaterializeResult<BTreeMap<String, String>> {
    let mut annotations = pool.template.annotations.clone();
    annotations.insert(ANNOTATION_NODEPOOL_HASH.to_string(), hash_of(&pool.template)?);
    annotations.insert(ANNOTATION_NODECLASS_HASH.to_string(), hash_of(node_class)?);
    Ok(annotations)
}
