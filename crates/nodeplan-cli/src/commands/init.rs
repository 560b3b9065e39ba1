use nodeplan_core::NodeplanConfig;
use std::path::Path;

pub fn init(cluster: &str, region: &str, output: &str) -> anyhow::Result<()> {
    let output = Path::new(output);
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = NodeplanConfig::scaffold(cluster, region);
    std::fs::write(output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
