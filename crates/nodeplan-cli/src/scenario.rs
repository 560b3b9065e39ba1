//! Scenario files: configuration, cluster snapshot and inventory in one
//! document.

use anyhow::{Context, Result};
use nodeplan_core::NodeplanConfig;
use nodeplan_materialize::InventorySnapshot;
use nodeplan_provisioner::ClusterSnapshot;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub config: NodeplanConfig,
    #[serde(default)]
    pub cluster: ClusterSnapshot,
    #[serde(default)]
    pub inventory: InventorySnapshot,
}

impl Scenario {
    /// Read a scenario; `.json` files are JSON, anything else TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let scenario = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {} as JSON", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("parsing {} as TOML", path.display()))?
        };
        Ok(scenario)
    }
}
