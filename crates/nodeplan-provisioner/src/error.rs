//! Provisioner error types.

use nodeplan_catalog::{CapacityType, CatalogError};
use nodeplan_placement::SimulationError;
use thiserror::Error;

/// Errors that end a provisioning pass early. Per-pod problems do not end
/// a pass; they are reported as [`PendingReason`](crate::PendingReason)s.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("pass cancelled before any node was launched")]
    Cancelled,

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("simulation error: {0}")]
    Simulation(#[from] SimulationError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// A cloud inventory call that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("{call} unavailable: {message}")]
    Unavailable { call: &'static str, message: String },
}

/// Why the cloud refused a launch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    /// The offering has no capacity right now; other offerings may.
    #[error("insufficient capacity for {instance_type} ({capacity_type}) in {zone}")]
    CapacityUnavailable {
        instance_type: String,
        zone: String,
        capacity_type: CapacityType,
    },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("malformed launch request: {0}")]
    MalformedRequest(String),
}
