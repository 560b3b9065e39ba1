//! Well-known label registry and restricted-label policy.
//!
//! The registry is a static, versioned table. The catalog derives node labels
//! only from keys listed here, and NodePools may leave any of these keys
//! undefined while still being compatible with a pod that constrains them.

use thiserror::Error;

/// Bumped whenever a key is added to or removed from [`WELL_KNOWN_LABELS`].
pub const LABEL_REGISTRY_VERSION: u32 = 1;

// ── Kubernetes ──────────────────────────────────────────────────

pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
pub const LABEL_OS: &str = "kubernetes.io/os";
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const LABEL_WINDOWS_BUILD: &str = "node.kubernetes.io/windows-build";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";

// ── Provisioner ─────────────────────────────────────────────────

pub const LABEL_NODEPOOL: &str = "karpenter.sh/nodepool";
pub const LABEL_CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
pub const LABEL_INITIALIZED: &str = "karpenter.sh/initialized";
pub const LABEL_REGISTERED: &str = "karpenter.sh/registered";
pub const LABEL_NODECLASS: &str = "karpenter.k8s.aws/ec2nodeclass";

pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_SPOT: &str = "spot";

// ── Cloud provider ──────────────────────────────────────────────

pub const LABEL_TOPOLOGY_ZONE_ID: &str = "topology.k8s.aws/zone-id";
pub const LABEL_INSTANCE_HYPERVISOR: &str = "karpenter.k8s.aws/instance-hypervisor";
pub const LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT: &str =
    "karpenter.k8s.aws/instance-encryption-in-transit-supported";
pub const LABEL_INSTANCE_CATEGORY: &str = "karpenter.k8s.aws/instance-category";
pub const LABEL_INSTANCE_FAMILY: &str = "karpenter.k8s.aws/instance-family";
pub const LABEL_INSTANCE_GENERATION: &str = "karpenter.k8s.aws/instance-generation";
pub const LABEL_INSTANCE_LOCAL_NVME: &str = "karpenter.k8s.aws/instance-local-nvme";
pub const LABEL_INSTANCE_SIZE: &str = "karpenter.k8s.aws/instance-size";
pub const LABEL_INSTANCE_CPU: &str = "karpenter.k8s.aws/instance-cpu";
pub const LABEL_INSTANCE_CPU_MANUFACTURER: &str = "karpenter.k8s.aws/instance-cpu-manufacturer";
pub const LABEL_INSTANCE_MEMORY: &str = "karpenter.k8s.aws/instance-memory";
pub const LABEL_INSTANCE_EBS_BANDWIDTH: &str = "karpenter.k8s.aws/instance-ebs-bandwidth";
pub const LABEL_INSTANCE_NETWORK_BANDWIDTH: &str = "karpenter.k8s.aws/instance-network-bandwidth";
pub const LABEL_INSTANCE_GPU_NAME: &str = "karpenter.k8s.aws/instance-gpu-name";
pub const LABEL_INSTANCE_GPU_MANUFACTURER: &str = "karpenter.k8s.aws/instance-gpu-manufacturer";
pub const LABEL_INSTANCE_GPU_COUNT: &str = "karpenter.k8s.aws/instance-gpu-count";
pub const LABEL_INSTANCE_GPU_MEMORY: &str = "karpenter.k8s.aws/instance-gpu-memory";
pub const LABEL_INSTANCE_ACCELERATOR_NAME: &str = "karpenter.k8s.aws/instance-accelerator-name";
pub const LABEL_INSTANCE_ACCELERATOR_MANUFACTURER: &str =
    "karpenter.k8s.aws/instance-accelerator-manufacturer";
pub const LABEL_INSTANCE_ACCELERATOR_COUNT: &str = "karpenter.k8s.aws/instance-accelerator-count";

pub const WELL_KNOWN_LABELS: &[&str] = &[
    LABEL_TOPOLOGY_ZONE,
    LABEL_TOPOLOGY_REGION,
    LABEL_INSTANCE_TYPE,
    LABEL_ARCH,
    LABEL_OS,
    LABEL_WINDOWS_BUILD,
    LABEL_NODEPOOL,
    LABEL_CAPACITY_TYPE,
    LABEL_TOPOLOGY_ZONE_ID,
    LABEL_INSTANCE_HYPERVISOR,
    LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT,
    LABEL_INSTANCE_CATEGORY,
    LABEL_INSTANCE_FAMILY,
    LABEL_INSTANCE_GENERATION,
    LABEL_INSTANCE_LOCAL_NVME,
    LABEL_INSTANCE_SIZE,
    LABEL_INSTANCE_CPU,
    LABEL_INSTANCE_CPU_MANUFACTURER,
    LABEL_INSTANCE_MEMORY,
    LABEL_INSTANCE_EBS_BANDWIDTH,
    LABEL_INSTANCE_NETWORK_BANDWIDTH,
    LABEL_INSTANCE_GPU_NAME,
    LABEL_INSTANCE_GPU_MANUFACTURER,
    LABEL_INSTANCE_GPU_COUNT,
    LABEL_INSTANCE_GPU_MEMORY,
    LABEL_INSTANCE_ACCELERATOR_NAME,
    LABEL_INSTANCE_ACCELERATOR_MANUFACTURER,
    LABEL_INSTANCE_ACCELERATOR_COUNT,
];

/// Deprecated label keys and the well-known key they alias.
pub const NORMALIZED_LABELS: &[(&str, &str)] = &[
    ("beta.kubernetes.io/arch", LABEL_ARCH),
    ("beta.kubernetes.io/os", LABEL_OS),
    ("beta.kubernetes.io/instance-type", LABEL_INSTANCE_TYPE),
    ("failure-domain.beta.kubernetes.io/region", LABEL_TOPOLOGY_REGION),
    ("failure-domain.beta.kubernetes.io/zone", LABEL_TOPOLOGY_ZONE),
];

pub const RESTRICTED_LABEL_DOMAINS: &[&str] =
    &["kubernetes.io", "k8s.io", "karpenter.sh", "karpenter.k8s.aws"];

pub const LABEL_DOMAIN_EXCEPTIONS: &[&str] =
    &["kops.k8s.io", "node.kubernetes.io", "node-restriction.kubernetes.io"];

/// Labels the provisioner owns; users may never set or require them.
pub const RESTRICTED_LABELS: &[&str] = &[
    LABEL_NODEPOOL,
    LABEL_HOSTNAME,
    LABEL_INITIALIZED,
    LABEL_REGISTERED,
    LABEL_NODECLASS,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label {0:?} is restricted; specify a well known label or a custom label that does not use a restricted domain")]
    Restricted(String),

    #[error("label {key:?} is restricted; domain {domain:?} is reserved")]
    RestrictedDomain { key: String, domain: String },
}

pub fn is_well_known(key: &str) -> bool {
    WELL_KNOWN_LABELS.contains(&key)
}

/// Map a deprecated key to its current name; other keys pass through.
pub fn normalize_key(key: &str) -> &str {
    NORMALIZED_LABELS
        .iter()
        .find(|(old, _)| *old == key)
        .map_or(key, |(_, new)| new)
}

/// Deprecated aliases of `key`, if any.
pub fn deprecated_aliases(key: &str) -> impl Iterator<Item = &'static str> + '_ {
    NORMALIZED_LABELS
        .iter()
        .filter(move |(_, new)| *new == key)
        .map(|(old, _)| *old)
}

/// The `domain` part of `domain/name`.
pub fn label_domain(key: &str) -> Option<&str> {
    key.split_once('/').map(|(domain, _)| domain)
}

fn within(domain: &str, parent: &str) -> bool {
    domain == parent
        || domain
            .strip_suffix(parent)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Admission check for a label key used in NodePool labels or requirements.
pub fn check_label_key(key: &str) -> Result<(), LabelError> {
    if RESTRICTED_LABELS.contains(&key) {
        return Err(LabelError::Restricted(key.to_string()));
    }
    if is_well_known(key) {
        return Ok(());
    }
    let Some(domain) = label_domain(key) else {
        return Ok(());
    };
    if LABEL_DOMAIN_EXCEPTIONS.iter().any(|e| within(domain, e)) {
        return Ok(());
    }
    match RESTRICTED_LABEL_DOMAINS.iter().find(|r| within(domain, r)) {
        Some(restricted) => Err(LabelError::RestrictedDomain {
            key: key.to_string(),
            domain: (*restricted).to_string(),
        }),
        None => Ok(()),
    }
}

/// Whether a requirement label may be copied onto the node object. Keys under
/// a restricted domain are only copied when they are well-known.
pub fn is_propagatable(key: &str) -> bool {
    if RESTRICTED_LABELS.contains(&key) {
        return false;
    }
    check_label_key(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodepool_label_is_restricted_even_though_well_known() {
        assert!(is_well_known(LABEL_NODEPOOL));
        assert_eq!(
            check_label_key(LABEL_NODEPOOL),
            Err(LabelError::Restricted(LABEL_NODEPOOL.to_string()))
        );
    }

    #[test]
    fn restricted_domains_reject_custom_keys() {
        assert!(check_label_key("kubernetes.io/custom-label").is_err());
        assert!(check_label_key("karpenter.sh/custom").is_err());
        assert!(check_label_key("sub.k8s.io/anything").is_err());
    }

    #[test]
    fn exception_domains_and_subdomains_are_allowed() {
        assert!(check_label_key("node-restriction.kubernetes.io/custom-label").is_ok());
        assert!(check_label_key("subdomain.node-restriction.kubernetes.io/custom-label").is_ok());
        assert!(check_label_key("kops.k8s.io/instancegroup").is_ok());
    }

    #[test]
    fn well_known_and_custom_keys_are_allowed() {
        assert!(check_label_key(LABEL_INSTANCE_TYPE).is_ok());
        assert!(check_label_key(LABEL_INSTANCE_FAMILY).is_ok());
        assert!(check_label_key("team").is_ok());
        assert!(check_label_key("example.com/team").is_ok());
        // Suffix match needs a dot boundary.
        assert!(check_label_key("notkubernetes.io/x").is_ok());
    }

    #[test]
    fn deprecated_keys_normalize() {
        assert_eq!(normalize_key("failure-domain.beta.kubernetes.io/zone"), LABEL_TOPOLOGY_ZONE);
        assert_eq!(normalize_key("team"), "team");
        let aliases: Vec<_> = deprecated_aliases(LABEL_ARCH).collect();
        assert_eq!(aliases, vec!["beta.kubernetes.io/arch"]);
    }

    #[test]
    fn hostname_is_never_propagated() {
        assert!(!is_propagatable(LABEL_HOSTNAME));
        assert!(is_propagatable("team"));
        assert!(is_propagatable(LABEL_TOPOLOGY_ZONE));
    }
}
