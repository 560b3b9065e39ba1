//! Resolve a NodeClass's selector terms against the inventory, once per pass.

use crate::inventory::{Image, InventorySnapshot, SecurityGroup, Subnet};
use crate::selector::select;
use crate::{MaterializeError, MaterializeResult};
use nodeplan_api::{AmiFamily, NodeClass};
use nodeplan_catalog::Arch;
use nodeplan_catalog::amifamily::ssm_alias;
use std::collections::BTreeSet;
use tracing::debug;

/// An image a node may boot from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub id: String,
    pub name: String,
    pub arch: Arch,
    pub creation_date: String,
    /// `Some` for family defaults, which differ between plain and
    /// accelerated instance types. Selected images serve both.
    pub accelerated: Option<bool>,
}

/// The subnets, security groups and images a NodeClass selects.
#[derive(Debug, Clone)]
pub struct ResolvedNodeClass {
    pub name: String,
    pub subnets: Vec<Subnet>,
    /// Sorted by id.
    pub security_groups: Vec<SecurityGroup>,
    pub images: Vec<ResolvedImage>,
}

impl ResolvedNodeClass {
    pub fn resolve(
        node_class: &NodeClass,
        inventory: &InventorySnapshot,
        kubernetes_version: &str,
    ) -> MaterializeResult<Self> {
        let subnets: Vec<Subnet> = select(&node_class.subnet_selector_terms, &inventory.subnets)
            .into_iter()
            .cloned()
            .collect();
        if subnets.is_empty() {
            return Err(MaterializeError::NoSubnets(node_class.name.clone()));
        }

        let mut security_groups: Vec<SecurityGroup> =
            select(&node_class.security_group_selector_terms, &inventory.security_groups)
                .into_iter()
                .cloned()
                .collect();
        if security_groups.is_empty() {
            return Err(MaterializeError::NoSecurityGroups(node_class.name.clone()));
        }
        security_groups.sort_by(|a, b| a.id.cmp(&b.id));

        let images = if node_class.ami_selector_terms.is_empty() {
            default_images(node_class, inventory, kubernetes_version)?
        } else {
            select(&node_class.ami_selector_terms, &inventory.images)
                .into_iter()
                .map(|image| from_image(image, None))
                .collect()
        };
        if images.is_empty() {
            return Err(MaterializeError::NoImages(node_class.name.clone()));
        }

        debug!(
            nodeclass = %node_class.name,
            subnets = subnets.len(),
            security_groups = security_groups.len(),
            images = images.len(),
            "nodeclass resolved"
        );
        Ok(Self {
            name: node_class.name.clone(),
            subnets,
            security_groups,
            images,
        })
    }

    /// Zones the NodeClass has subnets in.
    pub fn zones(&self) -> BTreeSet<String> {
        self.subnets.iter().map(|s| s.zone.clone()).collect()
    }

    /// The subnet in `zone` with the most free addresses, then lowest id.
    pub fn subnet_for(&self, zone: &str) -> Option<&Subnet> {
        self.subnets
            .iter()
            .filter(|s| s.zone == zone)
            .max_by(|a, b| a.available_ips.cmp(&b.available_ips).then_with(|| b.id.cmp(&a.id)))
    }

    /// The newest image for `arch`, then lowest id.
    pub fn image_for(&self, arch: Arch, accelerated: bool) -> Option<&ResolvedImage> {
        self.images
            .iter()
            .filter(|i| i.arch == arch && i.accelerated.is_none_or(|a| a == accelerated))
            .max_by(|a, b| {
                a.creation_date
                    .cmp(&b.creation_date)
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    pub fn security_group_ids(&self) -> Vec<String> {
        self.security_groups.iter().map(|g| g.id.clone()).collect()
    }
}

fn from_image(image: &Image, accelerated: Option<bool>) -> ResolvedImage {
    ResolvedImage {
        id: image.id.clone(),
        name: image.name.clone(),
        arch: image.architecture,
        creation_date: image.creation_date.clone(),
        accelerated,
    }
}

/// Family default images, looked up through their SSM aliases.
fn default_images(
    node_class: &NodeClass,
    inventory: &InventorySnapshot,
    kubernetes_version: &str,
) -> MaterializeResult<Vec<ResolvedImage>> {
    let family = node_class.ami_family();
    if family == AmiFamily::Custom {
        return Err(MaterializeError::CustomWithoutTerms(node_class.name.clone()));
    }

    let mut seen = BTreeSet::new();
    let mut images = Vec::new();
    for accelerated in [false, true] {
        for arch in [Arch::Amd64, Arch::Arm64] {
            let Some(alias) = ssm_alias(family, arch, accelerated, kubernetes_version) else {
                continue;
            };
            // Families without an arch-specific variant reuse one alias.
            if !seen.insert(alias.clone()) {
                continue;
            }
            let Some(id) = inventory.ssm_parameters.get(&alias) else {
                debug!(nodeclass = %node_class.name, parameter = %alias, "ssm parameter not found");
                continue;
            };
            let image = match inventory.image(id) {
                Some(image) => from_image(image, Some(accelerated)),
                None => ResolvedImage {
                    id: id.clone(),
                    name: alias.clone(),
                    arch,
                    creation_date: String::new(),
                    accelerated: Some(accelerated),
                },
            };
            images.push(image);
        }
    }
    Ok(images)
}
