//! The launch request handed to a cloud launcher.

use nodeplan_api::{BlockDevice, BlockDeviceMapping, MetadataOptions, Taint, VolumeType};
use nodeplan_catalog::CapacityType;
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything needed to create one node. Immutable once built.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchDescriptor {
    pub name: String,
    pub node_pool: String,
    pub node_class: String,
    pub instance_type: String,
    /// The chosen type first, then fallbacks in the same zone and capacity type.
    pub instance_type_options: Vec<String>,
    pub zone: String,
    #[serde(rename = "zoneID")]
    pub zone_id: String,
    pub capacity_type: CapacityType,
    pub price: f64,
    #[serde(rename = "subnetID")]
    pub subnet_id: String,
    #[serde(rename = "amiID")]
    pub ami_id: String,
    #[serde(rename = "securityGroupIDs")]
    pub security_group_ids: Vec<String>,
    pub instance_profile: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub tags: BTreeMap<String, String>,
    pub block_device_mappings: Vec<LaunchBlockDevice>,
    pub metadata_options: MetadataOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    pub detailed_monitoring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associate_public_ip_address: Option<bool>,
    /// Pod ids (`namespace/name`) the node was sized for.
    pub bound_pods: Vec<String>,
}

/// A block device with its size in whole GiB.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchBlockDevice {
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_size_gib: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<VolumeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
    #[serde(rename = "kmsKeyID", skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    #[serde(rename = "snapshotID", skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub root_volume: bool,
}

impl From<&BlockDeviceMapping> for LaunchBlockDevice {
    fn from(mapping: &BlockDeviceMapping) -> Self {
        let BlockDevice {
            volume_size,
            volume_type,
            iops,
            throughput,
            encrypted,
            delete_on_termination,
            kms_key_id,
            snapshot_id,
        } = &mapping.ebs;
        Self {
            device_name: mapping.device_name.clone(),
            volume_size_gib: volume_size.map(|q| q.as_gibibytes_ceil()),
            volume_type: *volume_type,
            iops: *iops,
            throughput: *throughput,
            encrypted: *encrypted,
            delete_on_termination: *delete_on_termination,
            kms_key_id: kms_key_id.clone(),
            snapshot_id: snapshot_id.clone(),
            root_volume: mapping.root_volume,
        }
    }
}
