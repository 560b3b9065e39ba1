//! nodeplan.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeplanConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub region: String,
    /// Minor version, e.g. "1.29". Used to resolve default AMI aliases.
    pub kubernetes_version: String,
    /// Cluster endpoint written into launch descriptors, if known.
    pub endpoint: Option<String>,
}

/// How offerings are ordered when several satisfy a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostPolicy {
    /// Offering price; unknown prices fall back to a cpu/memory proxy.
    #[default]
    Price,
    /// Smallest cpu x memory product, ignoring price.
    Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub cost_policy: CostPolicy,
    /// Fraction of instance memory reserved for the hypervisor.
    pub vm_memory_overhead_percent: f64,
    /// ENIs held back from pod networking when computing max pods.
    pub reserved_enis: u32,
    /// Multiplier applied to the proxy price of spot offerings without a price.
    pub spot_price_ratio: f64,
    /// Upper bound on NodePools packed in parallel during one pass.
    pub max_concurrent_pools: usize,
    /// Instance-type options carried on each launch descriptor.
    pub max_instance_types: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            cost_policy: CostPolicy::Price,
            vm_memory_overhead_percent: 0.075,
            reserved_enis: 0,
            spot_price_ratio: 0.4,
            max_concurrent_pools: 4,
            max_instance_types: 60,
        }
    }
}

impl NodeplanConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeplanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal nodeplan.toml for a cluster.
    pub fn scaffold(cluster: &str, region: &str) -> Self {
        NodeplanConfig {
            cluster: ClusterConfig {
                name: cluster.to_string(),
                region: region.to_string(),
                kubernetes_version: "1.29".to_string(),
                endpoint: None,
            },
            scheduling: SchedulingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scaffold() {
        let config = NodeplanConfig::scaffold("prod", "us-west-2");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("prod"));
        assert!(toml_str.contains("us-west-2"));
        assert!(toml_str.contains("cost_policy = \"price\""));
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[cluster]
name = "test"
region = "eu-west-1"
kubernetes_version = "1.30"
"#;
        let config: NodeplanConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cluster.name, "test");
        assert_eq!(config.scheduling.cost_policy, CostPolicy::Price);
        assert_eq!(config.scheduling.max_instance_types, 60);
    }

    #[test]
    fn test_parse_scheduling_overrides() {
        let toml_str = r#"
[cluster]
name = "test"
region = "eu-west-1"
kubernetes_version = "1.30"

[scheduling]
cost_policy = "size"
vm_memory_overhead_percent = 0.1
"#;
        let config: NodeplanConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduling.cost_policy, CostPolicy::Size);
        assert!((config.scheduling.vm_memory_overhead_percent - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.scheduling.reserved_enis, 0);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let scaffold = NodeplanConfig::scaffold("file-cluster", "ap-south-1");
        file.write_all(scaffold.to_toml_string().unwrap().as_bytes()).unwrap();

        let loaded = NodeplanConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.cluster.name, "file-cluster");
        assert_eq!(loaded.cluster.kubernetes_version, "1.29");
    }
}
