//! nodeplan placement: which pool, which nodes, which pods on each.
//!
//! This crate decides placement for pending pods. It does NOT pick subnets,
//! images or tags (that's `nodeplan-materialize`) and never talks to a
//! cloud. It ranks NodePools per pod and bin-packs pods onto hypothetical
//! nodes, honouring node selectors, affinity, topology spread and pool
//! limits.
//!
//! # Components
//!
//! - **`aggregate`**: Effective pod requests (init containers, sidecars, overhead)
//! - **`convert`**: API pods to [`PodCandidate`]
//! - **`ranker`**: NodePool eligibility and ranking
//! - **`preferences`**: Soft-constraint relaxation
//! - **`topology`**: Spread, pod affinity and anti-affinity domains
//! - **`simulator`**: Grouping, bin-packing and node stubs

pub mod aggregate;
pub mod convert;
pub mod error;
pub mod preferences;
pub mod ranker;
pub mod simulator;
pub mod topology;

pub use aggregate::{aggregate, pod_requests};
pub use convert::PodCandidate;
pub use error::{Infeasible, PlacementResult, SimulationError};
pub use preferences::Relaxation;
pub use ranker::{PoolOption, eligible, rank, select};
pub use simulator::{NodeStub, Phase, Simulation, Simulator, SimulatorSettings, stub_name};
pub use topology::{PlacedPod, Topology};
