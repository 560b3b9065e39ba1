//! Raw instance type records as returned by the cloud inventory.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    #[serde(rename = "amd64", alias = "x86_64")]
    Amd64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Architecture name as the cloud spells it.
    pub fn cloud_name(&self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapacityType {
    #[serde(rename = "on-demand")]
    OnDemand,
    #[serde(rename = "spot")]
    Spot,
}

impl CapacityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityType::OnDemand => nodeplan_core::labels::CAPACITY_TYPE_ON_DEMAND,
            CapacityType::Spot => nodeplan_core::labels::CAPACITY_TYPE_SPOT,
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub name: String,
    pub manufacturer: String,
    pub count: i64,
    #[serde(default)]
    pub memory_mib: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInfo {
    pub name: String,
    pub manufacturer: String,
    pub count: i64,
}

/// One place an instance type can be bought.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Offering {
    pub zone: String,
    #[serde(rename = "zoneID")]
    pub zone_id: String,
    pub capacity_type: CapacityType,
    /// Hourly price, when known.
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "available_default")]
    pub available: bool,
}

fn available_default() -> bool {
    true
}

/// Zone-independent attributes of an instance type plus where it is offered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeInfo {
    pub name: String,
    pub vcpus: i64,
    pub memory_mib: i64,
    pub architecture: Arch,
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub cpu_manufacturer: Option<String>,
    #[serde(default)]
    pub encryption_in_transit: bool,
    #[serde(default)]
    pub network_bandwidth_mbps: Option<i64>,
    #[serde(default)]
    pub ebs_bandwidth_mbps: Option<i64>,
    /// Total local NVMe instance storage, in GB.
    #[serde(default)]
    pub local_nvme_gb: Option<i64>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    #[serde(default)]
    pub accelerators: Vec<AcceleratorInfo>,
    #[serde(default)]
    pub max_network_interfaces: Option<i64>,
    #[serde(default)]
    pub ipv4_per_interface: Option<i64>,
    /// Elastic Fabric Adapter interfaces the type supports.
    #[serde(default)]
    pub efa_interfaces: Option<i64>,
    /// Branch interfaces behind the trunk ENI, one per security-group pod.
    #[serde(default)]
    pub branch_interfaces: Option<i64>,
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl InstanceTypeInfo {
    /// A minimal record, mostly for tests and demos.
    pub fn new(name: &str, vcpus: i64, memory_mib: i64, architecture: Arch) -> Self {
        Self {
            name: name.to_string(),
            vcpus,
            memory_mib,
            architecture,
            hypervisor: Some("nitro".to_string()),
            cpu_manufacturer: None,
            encryption_in_transit: false,
            network_bandwidth_mbps: None,
            ebs_bandwidth_mbps: None,
            local_nvme_gb: None,
            gpus: Vec::new(),
            accelerators: Vec::new(),
            max_network_interfaces: None,
            ipv4_per_interface: None,
            efa_interfaces: None,
            branch_interfaces: None,
            offerings: Vec::new(),
        }
    }

    pub fn with_offering(
        mut self,
        zone: &str,
        zone_id: &str,
        capacity_type: CapacityType,
        price: Option<f64>,
    ) -> Self {
        self.offerings.push(Offering {
            zone: zone.to_string(),
            zone_id: zone_id.to_string(),
            capacity_type,
            price,
            available: true,
        });
        self
    }
}
