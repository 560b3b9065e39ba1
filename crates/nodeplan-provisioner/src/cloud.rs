//! The provisioner's cloud collaborators.
//!
//! Both traits return boxed futures so they stay object safe; a pass holds
//! them as `Arc<dyn ...>`. The inventory is read once at the start of every
//! pass; the launcher is called once per launch attempt.

use crate::error::{InventoryError, LaunchError};
use nodeplan_catalog::{CapacityType, InstanceTypeInfo};
use nodeplan_materialize::{Image, LaunchDescriptor, SecurityGroup, Subnet};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read-only view of the cloud account.
pub trait CloudInventory: Send + Sync {
    fn describe_instance_types(&self) -> BoxFuture<'_, Result<Vec<InstanceTypeInfo>, InventoryError>>;

    fn describe_subnets(&self) -> BoxFuture<'_, Result<Vec<Subnet>, InventoryError>>;

    fn describe_security_groups(&self) -> BoxFuture<'_, Result<Vec<SecurityGroup>, InventoryError>>;

    fn describe_images(&self) -> BoxFuture<'_, Result<Vec<Image>, InventoryError>>;

    /// Value of an SSM parameter, or `None` if it does not exist.
    fn resolve_ssm_parameter<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, InventoryError>>;
}

/// An instance the cloud accepted.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub name: String,
    pub instance_type: String,
    pub zone: String,
    pub capacity_type: CapacityType,
}

/// Creates instances.
pub trait CloudLauncher: Send + Sync {
    fn launch<'a>(&'a self, descriptor: &'a LaunchDescriptor) -> BoxFuture<'a, Result<LaunchedInstance, LaunchError>>;
}
