//! nodeplan-catalog: what can be launched, where, and at what cost.
//!
//! Raw inventory records ([`InstanceTypeInfo`]) are turned into
//! [`InstanceType`]s with well-known labels, capacity and overhead computed
//! for a particular image family and kubelet configuration. A [`Catalog`]
//! holds those for one NodePool and answers requirement queries in cost
//! order.

pub mod amifamily;
pub mod catalog;
pub mod info;
pub mod instancetype;

pub use catalog::{Catalog, CatalogSettings, OfferingCandidate};
pub use info::{AcceleratorInfo, Arch, CapacityType, GpuInfo, InstanceTypeInfo, Offering};
pub use instancetype::{InstanceType, NodeProfile, Overhead};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate instance type: {0}")]
    Duplicate(String),

    #[error("malformed instance type records: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Parse inventory records from their JSON form.
pub fn parse_records(json: &str) -> CatalogResult<Vec<InstanceTypeInfo>> {
    Ok(serde_json::from_str(json)?)
}
