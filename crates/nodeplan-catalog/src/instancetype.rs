//! Computed view of an instance type: labels, capacity, overhead.
//!
//! Capacity and overhead depend on the node's image family and kubelet
//! settings, so an [`InstanceType`] is always built for a [`NodeProfile`].

use crate::amifamily;
use crate::catalog::CatalogSettings;
use crate::info::{Arch, InstanceTypeInfo, Offering};
use nodeplan_api::validation::{Threshold, parse_threshold};
use nodeplan_api::{AmiFamily, BlockDeviceMapping, KubeletConfiguration, NodeClass, NodePool};
use nodeplan_core::labels::*;
use nodeplan_core::resources::{
    AMD_GPU, AWS_NEURON, CPU, EFA, EPHEMERAL_STORAGE, HABANA_GAUDI, MEMORY, NVIDIA_GPU, PODS, POD_ENI,
};
use nodeplan_core::{Quantity, ResourceList};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// `<category>[-<n>tb]<generation>...<.size>`, e.g. `m5.large`, `u-6tb1.metal`.
static INSTANCE_TYPE_SCHEME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(^[a-z]+)(\-[0-9]+tb)?([0-9]+).*\.").ok());

const DEFAULT_MAX_PODS: i64 = 110;

/// Every label an offering can carry. Requirements on other keys (custom
/// labels, the nodepool label) say nothing about which offering to buy.
pub const OFFERING_LABEL_KEYS: &[&str] = &[
    LABEL_INSTANCE_TYPE,
    LABEL_ARCH,
    LABEL_OS,
    LABEL_TOPOLOGY_REGION,
    LABEL_TOPOLOGY_ZONE,
    LABEL_TOPOLOGY_ZONE_ID,
    LABEL_CAPACITY_TYPE,
    LABEL_WINDOWS_BUILD,
    LABEL_INSTANCE_HYPERVISOR,
    LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT,
    LABEL_INSTANCE_CATEGORY,
    LABEL_INSTANCE_FAMILY,
    LABEL_INSTANCE_GENERATION,
    LABEL_INSTANCE_LOCAL_NVME,
    LABEL_INSTANCE_SIZE,
    LABEL_INSTANCE_CPU,
    LABEL_INSTANCE_CPU_MANUFACTURER,
    LABEL_INSTANCE_MEMORY,
    LABEL_INSTANCE_EBS_BANDWIDTH,
    LABEL_INSTANCE_NETWORK_BANDWIDTH,
    LABEL_INSTANCE_GPU_NAME,
    LABEL_INSTANCE_GPU_MANUFACTURER,
    LABEL_INSTANCE_GPU_COUNT,
    LABEL_INSTANCE_GPU_MEMORY,
    LABEL_INSTANCE_ACCELERATOR_NAME,
    LABEL_INSTANCE_ACCELERATOR_MANUFACTURER,
    LABEL_INSTANCE_ACCELERATOR_COUNT,
];

pub fn is_offering_label(key: &str) -> bool {
    OFFERING_LABEL_KEYS.contains(&key)
}

/// Node-shaping settings taken from the NodeClass (and NodePool overrides).
#[derive(Debug, Clone, Default)]
pub struct NodeProfile {
    pub ami_family: AmiFamily,
    pub kubelet: KubeletConfiguration,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

impl NodeProfile {
    /// Profile for nodes of `pool`. Pool-level kubelet settings replace the
    /// NodeClass ones.
    pub fn for_pool(pool: &NodePool, node_class: &NodeClass) -> Self {
        Self {
            ami_family: node_class.ami_family(),
            kubelet: pool
                .template
                .kubelet
                .clone()
                .or_else(|| node_class.kubelet.clone())
                .unwrap_or_default(),
            block_device_mappings: node_class.block_device_mappings.clone(),
        }
    }
}

/// Resources held back from pods.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Overhead {
    pub kube_reserved: ResourceList,
    pub system_reserved: ResourceList,
    pub eviction_threshold: ResourceList,
}

impl Overhead {
    pub fn total(&self) -> ResourceList {
        self.kube_reserved
            .add(&self.system_reserved)
            .add(&self.eviction_threshold)
    }
}

#[derive(Debug, Clone)]
pub struct InstanceType {
    pub info: InstanceTypeInfo,
    labels: BTreeMap<String, String>,
    capacity: ResourceList,
    overhead: Overhead,
    allocatable: ResourceList,
}

impl InstanceType {
    /// `None` when the image family cannot run on this instance type.
    pub fn build(info: &InstanceTypeInfo, settings: &CatalogSettings, profile: &NodeProfile) -> Option<Self> {
        if !amifamily::supports_arch(profile.ami_family, info.architecture) {
            return None;
        }
        let labels = compute_labels(info, &settings.region, profile.ami_family);
        let capacity = compute_capacity(info, settings, profile);
        let overhead = compute_overhead(&capacity, &profile.kubelet);
        let allocatable = capacity.saturating_sub(&overhead.total());
        Some(Self {
            info: info.clone(),
            labels,
            capacity,
            overhead,
            allocatable,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn arch(&self) -> Arch {
        self.info.architecture
    }

    /// Zone-independent labels.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn capacity(&self) -> &ResourceList {
        &self.capacity
    }

    pub fn overhead(&self) -> &Overhead {
        &self.overhead
    }

    pub fn allocatable(&self) -> &ResourceList {
        &self.allocatable
    }

    /// Whether the type carries NVIDIA GPUs or Neuron devices, which need an
    /// accelerated image.
    pub fn is_accelerated(&self) -> bool {
        !self.capacity.get(NVIDIA_GPU).is_zero() || !self.capacity.get(AWS_NEURON).is_zero()
    }

    /// Full label set of a node launched from `offering`.
    pub fn offering_labels(&self, offering: &Offering) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_TOPOLOGY_ZONE.to_string(), offering.zone.clone());
        labels.insert(LABEL_TOPOLOGY_ZONE_ID.to_string(), offering.zone_id.clone());
        labels.insert(LABEL_CAPACITY_TYPE.to_string(), offering.capacity_type.as_str().to_string());
        labels
    }
}

fn lower_kebab(s: &str) -> String {
    s.replace(' ', "-").to_lowercase()
}

fn compute_labels(info: &InstanceTypeInfo, region: &str, family: AmiFamily) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        labels.insert(key.to_string(), value);
    };

    set(LABEL_INSTANCE_TYPE, info.name.clone());
    set(LABEL_ARCH, info.architecture.as_str().to_string());
    set(LABEL_OS, family.os().to_string());
    set(LABEL_TOPOLOGY_REGION, region.to_string());
    if let Some(build) = amifamily::windows_build(family) {
        set(LABEL_WINDOWS_BUILD, build.to_string());
    }

    if let Some(caps) = INSTANCE_TYPE_SCHEME.as_ref().and_then(|re| re.captures(&info.name)) {
        if let (Some(category), Some(generation)) = (caps.get(1), caps.get(3)) {
            set(LABEL_INSTANCE_CATEGORY, category.as_str().to_string());
            set(LABEL_INSTANCE_GENERATION, generation.as_str().to_string());
        }
    }
    if let Some((family_name, size)) = info.name.split_once('.') {
        if !size.contains('.') {
            set(LABEL_INSTANCE_FAMILY, family_name.to_string());
            set(LABEL_INSTANCE_SIZE, size.to_string());
        }
    }

    set(LABEL_INSTANCE_CPU, info.vcpus.to_string());
    set(LABEL_INSTANCE_MEMORY, info.memory_mib.to_string());
    set(LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT, info.encryption_in_transit.to_string());
    if let Some(m) = &info.cpu_manufacturer {
        set(LABEL_INSTANCE_CPU_MANUFACTURER, lower_kebab(m));
    }
    if let Some(h) = info.hypervisor.as_ref().filter(|h| !h.is_empty()) {
        set(LABEL_INSTANCE_HYPERVISOR, h.clone());
    }
    if let Some(bw) = info.network_bandwidth_mbps {
        set(LABEL_INSTANCE_NETWORK_BANDWIDTH, bw.to_string());
    }
    if let Some(bw) = info.ebs_bandwidth_mbps {
        set(LABEL_INSTANCE_EBS_BANDWIDTH, bw.to_string());
    }
    if let Some(gb) = info.local_nvme_gb {
        set(LABEL_INSTANCE_LOCAL_NVME, gb.to_string());
    }
    if let Some(gpu) = info.gpus.first() {
        set(LABEL_INSTANCE_GPU_NAME, lower_kebab(&gpu.name));
        set(LABEL_INSTANCE_GPU_MANUFACTURER, lower_kebab(&gpu.manufacturer));
        set(LABEL_INSTANCE_GPU_COUNT, gpu.count.to_string());
        set(LABEL_INSTANCE_GPU_MEMORY, gpu.memory_mib.to_string());
    }
    if let Some(acc) = info.accelerators.first() {
        set(LABEL_INSTANCE_ACCELERATOR_NAME, lower_kebab(&acc.name));
        set(LABEL_INSTANCE_ACCELERATOR_MANUFACTURER, lower_kebab(&acc.manufacturer));
        set(LABEL_INSTANCE_ACCELERATOR_COUNT, acc.count.to_string());
    }
    labels
}

fn compute_capacity(info: &InstanceTypeInfo, settings: &CatalogSettings, profile: &NodeProfile) -> ResourceList {
    let mut capacity = ResourceList::new();
    capacity.insert(CPU, Quantity::from_units(info.vcpus));

    // Graviton reserves 64MiB of CMA memory.
    let mut mib = info.memory_mib;
    if info.architecture == Arch::Arm64 {
        mib -= 64;
    }
    let vm_overhead = (mib as f64 * settings.vm_memory_overhead_percent).ceil() as i64;
    capacity.insert(MEMORY, Quantity::from_mebibytes(mib - vm_overhead));

    capacity.insert(
        EPHEMERAL_STORAGE,
        amifamily::ephemeral_storage(profile.ami_family, &profile.block_device_mappings),
    );
    capacity.insert(PODS, Quantity::from_units(max_pods(info, settings, profile)));

    let mut gpus: BTreeMap<&str, i64> = BTreeMap::new();
    for gpu in &info.gpus {
        let resource = match gpu.manufacturer.to_lowercase().as_str() {
            "nvidia" => NVIDIA_GPU,
            "amd" => AMD_GPU,
            "habana" => HABANA_GAUDI,
            _ => continue,
        };
        *gpus.entry(resource).or_default() += gpu.count;
    }
    let neurons: i64 = info
        .accelerators
        .iter()
        .filter(|a| a.manufacturer.eq_ignore_ascii_case("aws"))
        .map(|a| a.count)
        .sum();
    if neurons > 0 {
        gpus.insert(AWS_NEURON, neurons);
    }
    for (resource, count) in gpus {
        capacity.insert(resource, Quantity::from_units(count));
    }

    for (resource, count) in [(EFA, info.efa_interfaces), (POD_ENI, info.branch_interfaces)] {
        if let Some(count) = count.filter(|c| *c > 0) {
            capacity.insert(resource, Quantity::from_units(count));
        }
    }
    capacity
}

fn max_pods(info: &InstanceTypeInfo, settings: &CatalogSettings, profile: &NodeProfile) -> i64 {
    let family = profile.ami_family;
    let mut count = match (profile.kubelet.max_pods, info.max_network_interfaces, info.ipv4_per_interface) {
        (Some(max), _, _) => i64::from(max),
        (None, Some(enis), Some(ips)) if amifamily::supports_eni_limited_pod_density(family) => {
            let usable = (enis - i64::from(settings.reserved_enis)).max(0);
            if usable == 0 { 0 } else { usable * (ips - 1) + 2 }
        }
        _ => DEFAULT_MAX_PODS,
    };
    if let Some(per_core) = profile.kubelet.pods_per_core.filter(|p| *p > 0) {
        if amifamily::pods_per_core_enabled(family) {
            count = count.min(i64::from(per_core) * info.vcpus);
        }
    }
    count
}

/// kube-reserved CPU: 6% of the first core, 1% of the second, 0.5% of the
/// next two, 0.25% of the rest.
const CPU_RESERVATION_TIERS: &[(i64, i64, f64)] = &[
    (0, 1000, 0.06),
    (1000, 2000, 0.01),
    (2000, 4000, 0.005),
    (4000, 1 << 31, 0.0025),
];

fn compute_overhead(capacity: &ResourceList, kubelet: &KubeletConfiguration) -> Overhead {
    let cpu = capacity.get(CPU).as_milli();
    let mut reserved_cpu = 0i64;
    for (start, end, pct) in CPU_RESERVATION_TIERS {
        if cpu >= *start {
            let span = cpu.min(*end) - start;
            reserved_cpu += (span as f64 * pct) as i64;
        }
    }
    let pods = capacity.get(PODS).value();
    let mut kube_reserved = ResourceList::new()
        .with(CPU, Quantity::from_milli(reserved_cpu))
        .with(MEMORY, Quantity::from_mebibytes(11 * pods + 255))
        .with(EPHEMERAL_STORAGE, Quantity::from_gibibytes(1));
    for (name, qty) in kubelet.kube_reserved.iter() {
        kube_reserved.insert(name, qty);
    }

    let storage = capacity.get(EPHEMERAL_STORAGE);
    let memory = capacity.get(MEMORY);
    let mut eviction_threshold = ResourceList::new()
        .with(MEMORY, Quantity::from_mebibytes(100))
        .with(EPHEMERAL_STORAGE, Quantity::from_units((storage.value() as f64 / 10.0).ceil() as i64));
    for (signal, resource, basis) in [("memory.available", MEMORY, memory), ("nodefs.available", EPHEMERAL_STORAGE, storage)] {
        let Some(threshold) = kubelet.eviction_hard.get(signal).and_then(|raw| parse_threshold(raw)) else {
            continue;
        };
        let amount = match threshold {
            Threshold::Quantity(q) => q,
            Threshold::Percent(pct) => Quantity::from_units((basis.value() as f64 * pct / 100.0).ceil() as i64),
        };
        eviction_threshold.insert(resource, amount);
    }

    Overhead {
        kube_reserved,
        system_reserved: kubelet.system_reserved.clone(),
        eviction_threshold,
    }
}
