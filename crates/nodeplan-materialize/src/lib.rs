//! nodeplan materializer: from node stubs to launch requests.
//!
//! Placement decides which pods share a node and which offerings can host
//! them. This crate fills in everything else a launch needs: subnet, image,
//! security groups, instance profile, tags, labels, block devices and
//! bootstrap user data. It reads an [`InventorySnapshot`] and never calls
//! the cloud itself.
//!
//! # Components
//!
//! - **`inventory`**: Subnets, security groups, images and SSM parameters
//! - **`selector`**: NodeClass selector-term matching
//! - **`resolve`**: Per-pass NodeClass resolution
//! - **`descriptor`**: [`LaunchDescriptor`]
//! - **`materializer`**: Stub + offering to descriptor
//! - **`userdata`**: Per-family bootstrap merged with NodeClass user data

pub mod descriptor;
pub mod inventory;
pub mod materializer;
pub mod resolve;
pub mod selector;
pub mod userdata;

pub use descriptor::{LaunchBlockDevice, LaunchDescriptor};
pub use inventory::{Image, InventorySnapshot, SecurityGroup, Subnet};
pub use materializer::Materializer;
pub use resolve::{ResolvedImage, ResolvedNodeClass};
pub use userdata::Bootstrap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("nodeclass {0}: no subnets match the selector terms")]
    NoSubnets(String),

    #[error("nodeclass {0}: no security groups match the selector terms")]
    NoSecurityGroups(String),

    #[error("nodeclass {0}: no images resolved")]
    NoImages(String),

    #[error("nodeclass {0}: amiFamily Custom requires amiSelectorTerms")]
    CustomWithoutTerms(String),

    #[error("nodeclass {nodeclass}: no subnet in zone {zone}")]
    NoSubnetInZone { nodeclass: String, zone: String },

    #[error("no image for {arch} (instance type {instance_type})")]
    NoImageForArch { arch: String, instance_type: String },

    #[error("nodeclass {0}: neither instanceProfile nor role is set")]
    NoInstanceProfile(String),

    #[error("invalid user data: {0}")]
    InvalidUserData(String),

    #[error("hashing failed: {0}")]
    Hash(#[from] serde_json::Error),
}

pub type MaterializeResult<T> = Result<T, MaterializeError>;
