//! In-memory inventory serving a fixed scenario.

use crate::cloud::{BoxFuture, CloudInventory};
use crate::error::InventoryError;
use nodeplan_catalog::InstanceTypeInfo;
use nodeplan_materialize::{Image, InventorySnapshot, SecurityGroup, Subnet};
use tracing::debug;

/// A [`CloudInventory`] answering from an [`InventorySnapshot`].
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    snapshot: InventorySnapshot,
}

impl StaticInventory {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self { snapshot }
    }
}

impl CloudInventory for StaticInventory {
    fn describe_instance_types(&self) -> BoxFuture<'_, Result<Vec<InstanceTypeInfo>, InventoryError>> {
        Box::pin(async move { Ok(self.snapshot.instance_types.clone()) })
    }

    fn describe_subnets(&self) -> BoxFuture<'_, Result<Vec<Subnet>, InventoryError>> {
        Box::pin(async move { Ok(self.snapshot.subnets.clone()) })
    }

    fn describe_security_groups(&self) -> BoxFuture<'_, Result<Vec<SecurityGroup>, InventoryError>> {
        Box::pin(async move { Ok(self.snapshot.security_groups.clone()) })
    }

    fn describe_images(&self) -> BoxFuture<'_, Result<Vec<Image>, InventoryError>> {
        Box::pin(async move { Ok(self.snapshot.images.clone()) })
    }

    fn resolve_ssm_parameter<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, InventoryError>> {
        Box::pin(async move {
            let value = self.snapshot.ssm_parameters.get(name).cloned();
            debug!(parameter = %name, found = value.is_some(), "ssm parameter lookup");
            Ok(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn serves_the_snapshot() {
        let inventory = StaticInventory::new(InventorySnapshot {
            subnets: vec![Subnet {
                id: "subnet-1".into(),
                zone: "us-west-2a".into(),
                zone_id: "usw2-az1".into(),
                available_ips: 10,
                tags: BTreeMap::new(),
            }],
            ssm_parameters: BTreeMap::from([("/images/default".to_string(), "ami-1".to_string())]),
            ..Default::default()
        });
        assert_eq!(inventory.describe_subnets().await.unwrap().len(), 1);
        assert!(inventory.describe_images().await.unwrap().is_empty());
        assert_eq!(
            inventory.resolve_ssm_parameter("/images/default").await.unwrap().as_deref(),
            Some("ami-1")
        );
        assert!(inventory.resolve_ssm_parameter("/images/other").await.unwrap().is_none());
    }
}
