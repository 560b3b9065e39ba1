use crate::scenario::Scenario;
use nodeplan_provisioner::PassIndex;
use std::path::Path;

pub fn validate(path: &str) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(Path::new(path))?;
    let index = PassIndex::build(&scenario.cluster);

    for name in index.node_classes.keys() {
        println!("✓ NodeClass {name}");
    }
    for indexed in &index.pools {
        println!("✓ NodePool {} → {}", indexed.pool.name, indexed.node_class.name);
    }
    for invalid in &index.invalid {
        println!("✗ {} {}", invalid.kind, invalid.name);
        for error in &invalid.errors {
            println!("    {error}");
        }
    }

    if !index.invalid.is_empty() {
        anyhow::bail!("{} object(s) failed validation", index.invalid.len());
    }
    Ok(())
}
