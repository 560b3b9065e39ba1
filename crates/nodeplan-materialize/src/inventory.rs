//! Cloud resources a pass can launch into, as described by the inventory.

use nodeplan_catalog::{Arch, InstanceTypeInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub id: String,
    pub zone: String,
    #[serde(default)]
    pub zone_id: String,
    #[serde(default)]
    pub available_ips: u64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub architecture: Arch,
    /// RFC 3339 timestamp; compares lexicographically.
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Everything read from the cloud for one pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySnapshot {
    #[serde(default)]
    pub instance_types: Vec<InstanceTypeInfo>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
    #[serde(default)]
    pub images: Vec<Image>,
    /// SSM parameter name to value (an image id).
    #[serde(default)]
    pub ssm_parameters: BTreeMap<String, String>,
}

impl InventorySnapshot {
    pub fn image(&self, id: &str) -> Option<&Image> {
        self.images.iter().find(|i| i.id == id)
    }
}
