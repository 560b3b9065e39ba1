//! The per-pass instance type catalog.
//!
//! Every available offering is expanded once, at construction, into an
//! [`OfferingCandidate`] carrying its full label set and cost. Queries are a
//! filter over that pre-sorted list, so results are always in cost order.

use crate::info::{CapacityType, InstanceTypeInfo, Offering};
use crate::instancetype::{InstanceType, NodeProfile, is_offering_label};
use crate::{CatalogError, CatalogResult};
use nodeplan_core::{CostPolicy, NodeplanConfig, Requirements};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Proxy hourly price used when an offering has no price.
const PROXY_PRICE_PER_VCPU: f64 = 0.04;
const PROXY_PRICE_PER_GIB: f64 = 0.005;

/// Region and pricing inputs shared by every catalog of a pass.
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub region: String,
    pub cost_policy: CostPolicy,
    pub vm_memory_overhead_percent: f64,
    pub reserved_enis: u32,
    pub spot_price_ratio: f64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            region: String::new(),
            cost_policy: CostPolicy::Price,
            vm_memory_overhead_percent: 0.075,
            reserved_enis: 0,
            spot_price_ratio: 0.4,
        }
    }
}

impl CatalogSettings {
    pub fn from_config(config: &NodeplanConfig) -> Self {
        Self {
            region: config.cluster.region.clone(),
            cost_policy: config.scheduling.cost_policy,
            vm_memory_overhead_percent: config.scheduling.vm_memory_overhead_percent,
            reserved_enis: config.scheduling.reserved_enis,
            spot_price_ratio: config.scheduling.spot_price_ratio,
        }
    }
}

/// One purchasable (instance type, zone, capacity type) triple.
#[derive(Debug, Clone)]
pub struct OfferingCandidate {
    pub instance_type: Arc<InstanceType>,
    pub offering: Offering,
    pub labels: Arc<BTreeMap<String, String>>,
    /// Ordering key under the catalog's cost policy. Lower is cheaper.
    pub cost: f64,
}

impl OfferingCandidate {
    pub fn name(&self) -> &str {
        self.instance_type.name()
    }

    /// Price to report for the offering: the listed price, else the proxy.
    pub fn price(&self, settings: &CatalogSettings) -> f64 {
        self.offering
            .price
            .unwrap_or_else(|| proxy_price(&self.instance_type.info, self.offering.capacity_type, settings))
    }
}

fn proxy_price(info: &InstanceTypeInfo, capacity_type: CapacityType, settings: &CatalogSettings) -> f64 {
    let base = info.vcpus as f64 * PROXY_PRICE_PER_VCPU
        + info.memory_mib as f64 / 1024.0 * PROXY_PRICE_PER_GIB;
    match capacity_type {
        CapacityType::OnDemand => base,
        CapacityType::Spot => base * settings.spot_price_ratio,
    }
}

fn size_of(info: &InstanceTypeInfo) -> f64 {
    info.vcpus as f64 * info.memory_mib as f64
}

fn compare(a: &OfferingCandidate, b: &OfferingCandidate) -> Ordering {
    a.cost
        .total_cmp(&b.cost)
        .then_with(|| size_of(&a.instance_type.info).total_cmp(&size_of(&b.instance_type.info)))
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.offering.zone.cmp(&b.offering.zone))
        .then_with(|| a.offering.capacity_type.cmp(&b.offering.capacity_type))
}

/// Instance types as seen by one NodePool's nodes.
#[derive(Debug, Clone)]
pub struct Catalog {
    settings: CatalogSettings,
    instance_types: Vec<Arc<InstanceType>>,
    offerings: Vec<OfferingCandidate>,
}

impl Catalog {
    /// Build a catalog from inventory records. Records with no usable
    /// shape, or that the image family cannot run, are skipped.
    pub fn new(infos: &[InstanceTypeInfo], settings: CatalogSettings, profile: &NodeProfile) -> CatalogResult<Self> {
        let mut seen = BTreeSet::new();
        let mut instance_types = Vec::new();
        let mut offerings = Vec::new();

        for info in infos {
            if !seen.insert(info.name.as_str()) {
                return Err(CatalogError::Duplicate(info.name.clone()));
            }
            if info.vcpus <= 0 || info.memory_mib <= 0 {
                warn!(instance_type = %info.name, vcpus = info.vcpus, memory_mib = info.memory_mib, "skipping instance type with empty shape");
                continue;
            }
            let Some(it) = InstanceType::build(info, &settings, profile) else {
                debug!(instance_type = %info.name, family = %profile.ami_family, "instance type unsupported by image family");
                continue;
            };
            let it = Arc::new(it);
            for offering in info.offerings.iter().filter(|o| o.available) {
                let cost = match settings.cost_policy {
                    CostPolicy::Price => offering
                        .price
                        .unwrap_or_else(|| proxy_price(info, offering.capacity_type, &settings)),
                    CostPolicy::Size => size_of(info),
                };
                offerings.push(OfferingCandidate {
                    instance_type: it.clone(),
                    offering: offering.clone(),
                    labels: Arc::new(it.offering_labels(offering)),
                    cost,
                });
            }
            instance_types.push(it);
        }

        offerings.sort_by(compare);
        instance_types.sort_by(|a, b| a.name().cmp(b.name()));
        debug!(
            instance_types = instance_types.len(),
            offerings = offerings.len(),
            policy = ?settings.cost_policy,
            "catalog built"
        );
        Ok(Self {
            settings,
            instance_types,
            offerings,
        })
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    /// Instance types, by name.
    pub fn instance_types(&self) -> &[Arc<InstanceType>] {
        &self.instance_types
    }

    pub fn get(&self, name: &str) -> Option<&Arc<InstanceType>> {
        self.instance_types
            .binary_search_by(|it| it.name().cmp(name))
            .ok()
            .map(|i| &self.instance_types[i])
    }

    /// Every available offering, cheapest first.
    pub fn offerings(&self) -> &[OfferingCandidate] {
        &self.offerings
    }

    /// Available offerings whose full label set satisfies `requirements`,
    /// cheapest first. Keys offerings never carry are ignored.
    pub fn query(&self, requirements: &Requirements) -> Vec<OfferingCandidate> {
        let relevant = requirements.filter_keys(is_offering_label);
        self.offerings
            .iter()
            .filter(|c| relevant.satisfies(&c.labels))
            .cloned()
            .collect()
    }

    pub fn any_offering_satisfies(&self, requirements: &Requirements) -> bool {
        let relevant = requirements.filter_keys(is_offering_label);
        self.offerings.iter().any(|c| relevant.satisfies(&c.labels))
    }

    /// A copy with offerings outside `zones` removed.
    pub fn restrict_zones(&self, zones: &BTreeSet<String>) -> Catalog {
        let offerings: Vec<_> = self
            .offerings
            .iter()
            .filter(|c| zones.contains(&c.offering.zone))
            .cloned()
            .collect();
        let kept: BTreeSet<&str> = offerings.iter().map(|c| c.name()).collect();
        let instance_types = self
            .instance_types
            .iter()
            .filter(|it| kept.contains(it.name()))
            .cloned()
            .collect();
        Catalog {
            settings: self.settings.clone(),
            instance_types,
            offerings,
        }
    }

    /// Distinct values `key` takes across all offerings.
    pub fn domains(&self, key: &str) -> BTreeSet<String> {
        self.offerings
            .iter()
            .filter_map(|c| c.labels.get(key).cloned())
            .collect()
    }
}
