use nodeplan_core::{Incompatible, RequirementError};
use thiserror::Error;

/// Why a pod could not be placed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Infeasible {
    #[error("no nodepool can run the pod: {0}")]
    NoNodePool(String),

    #[error("taint {0} is not tolerated")]
    UntoleratedTaint(String),

    #[error(transparent)]
    Requirements(#[from] nodeplan_core::Infeasible),

    #[error("invalid requirement: {0}")]
    InvalidRequirement(#[from] RequirementError),

    #[error("incompatible with nodepool requirements: {0}")]
    Incompatible(#[from] Incompatible),

    #[error("no offering satisfies requirements [{0}]")]
    NoOffering(String),

    #[error("no instance type has enough {0}")]
    Resources(String),

    #[error("nodepool {pool} limit on {resource} would be exceeded")]
    Limits { pool: String, resource: String },

    #[error("minValues {min} for {key} not met: {found} values remain")]
    MinValues { key: String, min: usize, found: usize },

    #[error("topology {key}: {detail}")]
    Topology { key: String, detail: String },
}

pub type PlacementResult<T> = Result<T, Infeasible>;

/// A simulation pass that could not run to completion.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("packing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
