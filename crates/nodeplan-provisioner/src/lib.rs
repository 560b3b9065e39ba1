//! nodeplan provisioner: passes from pending pods to launched nodes.
//!
//! Ties the other crates together: validates and indexes the cluster
//! snapshot, reads the cloud inventory, runs the scheduling simulator,
//! materializes each node stub and hands it to the cloud launcher.
//!
//! # Architecture
//!
//! ```text
//! Provisioner
//!   ├── PassIndex (valid NodePools joined with their NodeClasses)
//!   ├── CloudInventory (read once per pass → InventorySnapshot)
//!   ├── Simulator (per-pool catalogs, bin-packing → NodeStubs)
//!   ├── Materializer (NodeStub + offering → LaunchDescriptor)
//!   └── CloudLauncher (capacity fallback across a stub's offerings)
//! ```

pub mod cloud;
pub mod error;
pub mod inventory;
pub mod launcher;
pub mod provisioner;
pub mod snapshot;

pub use cloud::{BoxFuture, CloudInventory, CloudLauncher, LaunchedInstance};
pub use error::{InventoryError, LaunchError, ProvisionError, ProvisionResult};
pub use inventory::StaticInventory;
pub use launcher::DryRunLauncher;
pub use provisioner::{LaunchedNode, PassReport, PendingReason, Provisioner};
pub use snapshot::{ClusterSnapshot, IndexedPool, PassIndex};
