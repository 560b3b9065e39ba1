//! A launcher that records launches instead of making them.

use crate::cloud::{BoxFuture, CloudLauncher, LaunchedInstance};
use crate::error::LaunchError;
use nodeplan_catalog::CapacityType;
use nodeplan_materialize::LaunchDescriptor;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A [`CloudLauncher`] that hands out synthetic instance ids. It can be told
/// to reject offerings as out of capacity, or to stop after a quota.
#[derive(Debug, Default)]
pub struct DryRunLauncher {
    next_id: AtomicU64,
    rejected: BTreeSet<(String, String, CapacityType)>,
    quota: Option<usize>,
    launched: RwLock<Vec<LaunchDescriptor>>,
}

impl DryRunLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer launches of this offering with `CapacityUnavailable`.
    pub fn rejecting(mut self, instance_type: &str, zone: &str, capacity_type: CapacityType) -> Self {
        self.rejected
            .insert((instance_type.to_string(), zone.to_string(), capacity_type));
        self
    }

    /// Answer with `QuotaExceeded` once `max` instances were launched.
    pub fn with_quota(mut self, max: usize) -> Self {
        self.quota = Some(max);
        self
    }

    /// Descriptors accepted so far, in launch order.
    pub async fn launched(&self) -> Vec<LaunchDescriptor> {
        self.launched.read().await.clone()
    }
}

fn check_request(d: &LaunchDescriptor) -> Result<(), LaunchError> {
    let missing = [
        ("subnetID", d.subnet_id.is_empty()),
        ("amiID", d.ami_id.is_empty()),
        ("instanceProfile", d.instance_profile.is_empty()),
        ("securityGroupIDs", d.security_group_ids.is_empty()),
    ];
    match missing.iter().find(|(_, empty)| *empty) {
        Some((field, _)) => Err(LaunchError::MalformedRequest(format!("{field} is empty"))),
        None => Ok(()),
    }
}

impl CloudLauncher for DryRunLauncher {
    fn launch<'a>(&'a self, descriptor: &'a LaunchDescriptor) -> BoxFuture<'a, Result<LaunchedInstance, LaunchError>> {
        Box::pin(async move {
            check_request(descriptor)?;

            let offering = (
                descriptor.instance_type.clone(),
                descriptor.zone.clone(),
                descriptor.capacity_type,
            );
            if self.rejected.contains(&offering) {
                debug!(
                    node = %descriptor.name,
                    instance_type = %descriptor.instance_type,
                    zone = %descriptor.zone,
                    "dry run: offering rejected"
                );
                return Err(LaunchError::CapacityUnavailable {
                    instance_type: offering.0,
                    zone: offering.1,
                    capacity_type: offering.2,
                });
            }

            let mut launched = self.launched.write().await;
            if self.quota.is_some_and(|max| launched.len() >= max) {
                return Err(LaunchError::QuotaExceeded(format!(
                    "{} instances already running",
                    launched.len()
                )));
            }
            launched.push(descriptor.clone());

            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let instance = LaunchedInstance {
                instance_id: format!("i-{id:017x}"),
                name: descriptor.name.clone(),
                instance_type: descriptor.instance_type.clone(),
                zone: descriptor.zone.clone(),
                capacity_type: descriptor.capacity_type,
            };
            info!(
                node = %instance.name,
                instance_id = %instance.instance_id,
                instance_type = %instance.instance_type,
                zone = %instance.zone,
                "dry run: instance launched"
            );
            Ok(instance)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplan_api::MetadataOptions;
    use std::collections::BTreeMap;

    fn make_descriptor(instance_type: &str) -> LaunchDescriptor {
        LaunchDescriptor {
            name: "default-abc".into(),
            node_pool: "default".into(),
            node_class: "default".into(),
            instance_type: instance_type.into(),
            instance_type_options: vec![instance_type.into()],
            zone: "us-west-2a".into(),
            zone_id: "usw2-az1".into(),
            capacity_type: CapacityType::OnDemand,
            price: 0.192,
            subnet_id: "subnet-1".into(),
            ami_id: "ami-1".into(),
            security_group_ids: vec!["sg-1".into()],
            instance_profile: "prod_profile".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            taints: Vec::new(),
            startup_taints: Vec::new(),
            tags: BTreeMap::new(),
            block_device_mappings: Vec::new(),
            metadata_options: MetadataOptions::default(),
            user_data: None,
            detailed_monitoring: false,
            associate_public_ip_address: None,
            bound_pods: vec!["default/web-0".into()],
        }
    }

    #[tokio::test]
    async fn hands_out_distinct_instance_ids() {
        let launcher = DryRunLauncher::new();
        let a = launcher.launch(&make_descriptor("m5.xlarge")).await.unwrap();
        let b = launcher.launch(&make_descriptor("m5.xlarge")).await.unwrap();
        assert_ne!(a.instance_id, b.instance_id);
        assert!(a.instance_id.starts_with("i-"));
        assert_eq!(launcher.launched().await.len(), 2);
    }

    #[tokio::test]
    async fn rejected_offering_reports_capacity() {
        let launcher = DryRunLauncher::new().rejecting("m5.xlarge", "us-west-2a", CapacityType::OnDemand);
        let err = launcher.launch(&make_descriptor("m5.xlarge")).await.unwrap_err();
        assert!(matches!(err, LaunchError::CapacityUnavailable { ref instance_type, .. } if instance_type == "m5.xlarge"));
        assert!(launcher.launch(&make_descriptor("m5.2xlarge")).await.is_ok());
        assert_eq!(launcher.launched().await.len(), 1);
    }

    #[tokio::test]
    async fn rejections_accumulate_per_offering() {
        let launcher = DryRunLauncher::new()
            .rejecting("m5.xlarge", "us-west-2a", CapacityType::OnDemand)
            .rejecting("m5.2xlarge", "us-west-2a", CapacityType::OnDemand)
            .rejecting("m5.xlarge", "us-west-2a", CapacityType::OnDemand);
        assert_eq!(launcher.rejected.len(), 2);
        for instance_type in ["m5.xlarge", "m5.2xlarge"] {
            assert!(matches!(
                launcher.launch(&make_descriptor(instance_type)).await,
                Err(LaunchError::CapacityUnavailable { .. })
            ));
        }
        assert!(launcher.launched().await.is_empty());
    }

    #[tokio::test]
    async fn quota_and_malformed_requests() {
        let launcher = DryRunLauncher::new().with_quota(1);
        launcher.launch(&make_descriptor("m5.xlarge")).await.unwrap();
        assert!(matches!(
            launcher.launch(&make_descriptor("m5.xlarge")).await,
            Err(LaunchError::QuotaExceeded(_))
        ));

        let mut descriptor = make_descriptor("m5.xlarge");
        descriptor.ami_id.clear();
        assert_eq!(
            DryRunLauncher::new().launch(&descriptor).await.unwrap_err(),
            LaunchError::MalformedRequest("amiID is empty".into())
        );
    }
}
