//! NodeClasses: cloud-specific launch settings shared by NodePools.

use nodeplan_core::{Quantity, ResourceList};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClass {
    pub name: String,
    #[serde(default)]
    pub ami_family: Option<AmiFamily>,
    #[serde(default)]
    pub ami_selector_terms: Vec<SelectorTerm>,
    #[serde(default)]
    pub subnet_selector_terms: Vec<SelectorTerm>,
    #[serde(default)]
    pub security_group_selector_terms: Vec<SelectorTerm>,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// IAM role for a managed instance profile.
    #[serde(default)]
    pub role: Option<String>,
    /// Pre-existing instance profile; excludes `role`.
    #[serde(default)]
    pub instance_profile: Option<String>,
    #[serde(default)]
    pub kubelet: Option<KubeletConfiguration>,
    #[serde(default)]
    pub metadata_options: Option<MetadataOptions>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub detailed_monitoring: bool,
    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,
}

impl NodeClass {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ami_family: None,
            ami_selector_terms: Vec::new(),
            subnet_selector_terms: Vec::new(),
            security_group_selector_terms: Vec::new(),
            block_device_mappings: Vec::new(),
            tags: BTreeMap::new(),
            role: None,
            instance_profile: None,
            kubelet: None,
            metadata_options: None,
            user_data: None,
            detailed_monitoring: false,
            associate_public_ip_address: None,
        }
    }

    /// The AMI family, `AL2` when unset.
    pub fn ami_family(&self) -> AmiFamily {
        self.ami_family.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AmiFamily {
    #[default]
    AL2,
    AL2023,
    Bottlerocket,
    Ubuntu,
    Windows2019,
    Windows2022,
    Custom,
}

impl AmiFamily {
    pub fn is_windows(&self) -> bool {
        matches!(self, AmiFamily::Windows2019 | AmiFamily::Windows2022)
    }

    /// Value of the `kubernetes.io/os` label for nodes of this family.
    pub fn os(&self) -> &'static str {
        if self.is_windows() { "windows" } else { "linux" }
    }
}

impl fmt::Display for AmiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AmiFamily::AL2 => "AL2",
            AmiFamily::AL2023 => "AL2023",
            AmiFamily::Bottlerocket => "Bottlerocket",
            AmiFamily::Ubuntu => "Ubuntu",
            AmiFamily::Windows2019 => "Windows2019",
            AmiFamily::Windows2022 => "Windows2022",
            AmiFamily::Custom => "Custom",
        };
        f.write_str(s)
    }
}

/// Selects subnets, security groups or images. Either `id`, or any mix of
/// `tags`, `name` and `owner`. A tag value of `*` matches any value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorTerm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl SelectorTerm {
    pub fn id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn tags(pairs: &[(&str, &str)]) -> Self {
        Self {
            tags: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Standard,
    Io1,
    Io2,
    Gp2,
    Sc1,
    St1,
    Gp3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    #[serde(default)]
    pub volume_size: Option<Quantity>,
    #[serde(default)]
    pub volume_type: Option<VolumeType>,
    #[serde(default)]
    pub iops: Option<i64>,
    #[serde(default)]
    pub throughput: Option<i64>,
    #[serde(default)]
    pub encrypted: Option<bool>,
    #[serde(default)]
    pub delete_on_termination: Option<bool>,
    #[serde(default, rename = "kmsKeyID")]
    pub kms_key_id: Option<String>,
    #[serde(default, rename = "snapshotID")]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceMapping {
    pub device_name: String,
    #[serde(default)]
    pub ebs: BlockDevice,
    /// The volume backing the node's ephemeral storage.
    #[serde(default)]
    pub root_volume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOptions {
    pub http_endpoint: String,
    #[serde(rename = "httpProtocolIPv6")]
    pub http_protocol_ipv6: String,
    pub http_put_response_hop_limit: i64,
    pub http_tokens: String,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            http_endpoint: "enabled".to_string(),
            http_protocol_ipv6: "disabled".to_string(),
            http_put_response_hop_limit: 1,
            http_tokens: "required".to_string(),
        }
    }
}

/// Kubelet settings that shape node capacity and overhead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    #[serde(default)]
    pub max_pods: Option<i32>,
    #[serde(default)]
    pub pods_per_core: Option<i32>,
    #[serde(default)]
    pub system_reserved: ResourceList,
    #[serde(default)]
    pub kube_reserved: ResourceList,
    /// Signal (e.g. `memory.available`) to threshold (`100Mi` or `10%`).
    #[serde(default)]
    pub eviction_hard: BTreeMap<String, String>,
    #[serde(default, rename = "imageGCHighThresholdPercent")]
    pub image_gc_high_threshold_percent: Option<i32>,
    #[serde(default, rename = "imageGCLowThresholdPercent")]
    pub image_gc_low_threshold_percent: Option<i32>,
    #[serde(default, rename = "clusterDNS")]
    pub cluster_dns: Vec<String>,
}
