//! Per-family image defaults: SSM aliases, block devices, pod density.

use crate::info::Arch;
use nodeplan_api::{AmiFamily, BlockDevice, BlockDeviceMapping, VolumeType};
use nodeplan_core::Quantity;

/// Root volume used when neither the NodeClass nor the family names one.
pub fn default_ebs() -> BlockDevice {
    BlockDevice {
        volume_size: Some(Quantity::from_gibibytes(20)),
        volume_type: Some(VolumeType::Gp3),
        encrypted: Some(true),
        ..Default::default()
    }
}

fn ebs(gib: i64) -> BlockDevice {
    BlockDevice {
        volume_size: Some(Quantity::from_gibibytes(gib)),
        ..default_ebs()
    }
}

fn mapping(device: &str, gib: i64) -> BlockDeviceMapping {
    BlockDeviceMapping {
        device_name: device.to_string(),
        ebs: ebs(gib),
        root_volume: false,
    }
}

/// Block devices attached when the NodeClass does not list any.
pub fn default_block_device_mappings(family: AmiFamily) -> Vec<BlockDeviceMapping> {
    match family {
        AmiFamily::AL2 | AmiFamily::AL2023 => vec![mapping("/dev/xvda", 20)],
        AmiFamily::Ubuntu => vec![mapping("/dev/sda1", 20)],
        AmiFamily::Bottlerocket => vec![mapping("/dev/xvda", 4), mapping("/dev/xvdb", 20)],
        AmiFamily::Windows2019 | AmiFamily::Windows2022 => vec![mapping("/dev/sda1", 50)],
        AmiFamily::Custom => Vec::new(),
    }
}

/// Device that backs the node's ephemeral storage.
pub fn ephemeral_block_device(family: AmiFamily) -> Option<&'static str> {
    match family {
        AmiFamily::AL2 | AmiFamily::AL2023 => Some("/dev/xvda"),
        AmiFamily::Ubuntu | AmiFamily::Windows2019 | AmiFamily::Windows2022 => Some("/dev/sda1"),
        AmiFamily::Bottlerocket => Some("/dev/xvdb"),
        AmiFamily::Custom => None,
    }
}

/// Whether max pods follows the ENI/IP limits of the instance type.
pub fn supports_eni_limited_pod_density(family: AmiFamily) -> bool {
    !family.is_windows()
}

pub fn pods_per_core_enabled(family: AmiFamily) -> bool {
    family != AmiFamily::Bottlerocket
}

/// Whether the family can run on the architecture at all.
pub fn supports_arch(family: AmiFamily, arch: Arch) -> bool {
    !(family.is_windows() && arch == Arch::Arm64)
}

/// Windows build label value for Windows families.
pub fn windows_build(family: AmiFamily) -> Option<&'static str> {
    match family {
        AmiFamily::Windows2019 => Some("10.0.17763"),
        AmiFamily::Windows2022 => Some("10.0.20348"),
        _ => None,
    }
}

/// SSM parameter holding the recommended image for a family. `accelerated`
/// selects the GPU/Neuron variant where the family publishes one. `Custom`
/// has no default.
pub fn ssm_alias(family: AmiFamily, arch: Arch, accelerated: bool, k8s_version: &str) -> Option<String> {
    let alias = match family {
        AmiFamily::AL2 => {
            let suffix = match (accelerated, arch) {
                (true, _) => "-gpu",
                (false, Arch::Arm64) => "-arm64",
                (false, Arch::Amd64) => "",
            };
            format!("/aws/service/eks/optimized-ami/{k8s_version}/amazon-linux-2{suffix}/recommended/image_id")
        }
        AmiFamily::AL2023 => {
            let variant = if accelerated { "nvidia" } else { "standard" };
            format!(
                "/aws/service/eks/optimized-ami/{k8s_version}/amazon-linux-2023/{}/{variant}/recommended/image_id",
                arch.cloud_name()
            )
        }
        AmiFamily::Bottlerocket => {
            let flavor = if accelerated { "-nvidia" } else { "" };
            format!(
                "/aws/service/bottlerocket/aws-k8s-{k8s_version}{flavor}/{}/latest/image_id",
                arch.cloud_name()
            )
        }
        AmiFamily::Ubuntu => format!(
            "/aws/service/canonical/ubuntu/eks/20.04/{k8s_version}/stable/current/{}/hvm/ebs-gp2/ami-id",
            arch.as_str()
        ),
        AmiFamily::Windows2019 | AmiFamily::Windows2022 => {
            if arch == Arch::Arm64 {
                return None;
            }
            let year = if family == AmiFamily::Windows2019 { 2019 } else { 2022 };
            format!("/aws/service/ami-windows-latest/Windows_Server-{year}-English-Core-EKS_Optimized-{k8s_version}/image_id")
        }
        AmiFamily::Custom => return None,
    };
    Some(alias)
}

/// Ephemeral storage size a node gets from its block device mappings.
pub fn ephemeral_storage(family: AmiFamily, mappings: &[BlockDeviceMapping]) -> Quantity {
    let fallback = Quantity::from_gibibytes(20);
    if let Some(size) = mappings
        .iter()
        .find(|m| m.root_volume)
        .and_then(|m| m.ebs.volume_size)
    {
        return size;
    }
    if !mappings.is_empty() {
        if family == AmiFamily::Custom {
            return mappings
                .last()
                .and_then(|m| m.ebs.volume_size)
                .unwrap_or(fallback);
        }
        if let Some(size) = ephemeral_block_device(family)
            .and_then(|dev| mappings.iter().find(|m| m.device_name == dev))
            .and_then(|m| m.ebs.volume_size)
        {
            return size;
        }
    }
    ephemeral_block_device(family)
        .and_then(|dev| {
            default_block_device_mappings(family)
                .into_iter()
                .find(|m| m.device_name == dev)
        })
        .and_then(|m| m.ebs.volume_size)
        .unwrap_or(fallback)
}
