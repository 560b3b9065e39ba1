use crate::scenario::Scenario;
use anyhow::Context;
use nodeplan_api::Validate;
use nodeplan_catalog::{Catalog, CatalogSettings, NodeProfile, OfferingCandidate};
use nodeplan_core::resources::{CPU, MEMORY, PODS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogRow {
    name: String,
    arch: String,
    vcpus: i64,
    memory_mib: i64,
    allocatable_cpu: String,
    allocatable_memory: String,
    max_pods: i64,
    offerings: usize,
    cheapest: Option<f64>,
}

pub fn catalog(path: &str, pool: Option<&str>, format: &str) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(Path::new(path))?;
    let settings = CatalogSettings::from_config(&scenario.config);

    let (catalog, offerings) = match pool {
        Some(name) => {
            let pool = scenario
                .cluster
                .node_pools
                .iter()
                .find(|p| p.name == name)
                .with_context(|| format!("nodepool {name} not found"))?;
            pool.validate()?;
            let class_name = &pool.template.node_class_ref.name;
            let node_class = scenario
                .cluster
                .node_classes
                .iter()
                .find(|nc| &nc.name == class_name)
                .with_context(|| format!("nodeclass {class_name} not found"))?;
            let profile = NodeProfile::for_pool(pool, node_class);
            let catalog = Catalog::new(&scenario.inventory.instance_types, settings, &profile)?;
            let offerings = catalog.query(&pool.requirements()?);
            (catalog, offerings)
        }
        None => {
            let catalog = Catalog::new(&scenario.inventory.instance_types, settings, &NodeProfile::default())?;
            let offerings = catalog.offerings().to_vec();
            (catalog, offerings)
        }
    };

    let rows = rows(&catalog, &offerings);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            println!(
                "{:<16} {:<6} {:>5} {:>9} {:>10} {:>12} {:>5} {:>9} {:>10}",
                "NAME", "ARCH", "VCPU", "MEM(MiB)", "ALLOC-CPU", "ALLOC-MEM", "PODS", "OFFERINGS", "CHEAPEST"
            );
            for row in &rows {
                let cheapest = row
                    .cheapest
                    .map(|p| format!("${p:.4}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<16} {:<6} {:>5} {:>9} {:>10} {:>12} {:>5} {:>9} {:>10}",
                    row.name,
                    row.arch,
                    row.vcpus,
                    row.memory_mib,
                    row.allocatable_cpu,
                    row.allocatable_memory,
                    row.max_pods,
                    row.offerings,
                    cheapest
                );
            }
        }
    }
    Ok(())
}

/// One row per instance type with at least one matching offering, cheapest
/// first.
fn rows(catalog: &Catalog, offerings: &[OfferingCandidate]) -> Vec<CatalogRow> {
    let mut by_type: BTreeMap<&str, Vec<&OfferingCandidate>> = BTreeMap::new();
    for offering in offerings {
        by_type.entry(offering.name()).or_default().push(offering);
    }

    let mut rows: Vec<CatalogRow> = by_type
        .into_iter()
        .map(|(name, offerings)| {
            let it = &offerings[0].instance_type;
            let allocatable = it.allocatable();
            CatalogRow {
                name: name.to_string(),
                arch: it.arch().as_str().to_string(),
                vcpus: it.info.vcpus,
                memory_mib: it.info.memory_mib,
                allocatable_cpu: allocatable.get(CPU).to_string(),
                allocatable_memory: allocatable.get(MEMORY).to_string(),
                max_pods: allocatable.get(PODS).value(),
                offerings: offerings.len(),
                cheapest: offerings
                    .iter()
                    .map(|o| o.price(catalog.settings()))
                    .min_by(|a, b| a.total_cmp(b)),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        let (pa, pb) = (a.cheapest.unwrap_or(f64::MAX), b.cheapest.unwrap_or(f64::MAX));
        pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
    });
    rows
}
