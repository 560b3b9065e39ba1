//! `nodeplan simulate`: one provisioning pass against a dry-run launcher.

use crate::scenario::Scenario;
use nodeplan_provisioner::{DryRunLauncher, PassReport, Provisioner, StaticInventory};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn simulate(path: &str, format: &str, quota: Option<usize>) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(Path::new(path))?;
    info!(scenario = %path, cluster = %scenario.config.cluster.name, "simulating provisioning pass");

    let launcher = match quota {
        Some(max) => DryRunLauncher::new().with_quota(max),
        None => DryRunLauncher::new(),
    };
    let provisioner = Provisioner::new(
        scenario.config,
        Arc::new(StaticInventory::new(scenario.inventory)),
        Arc::new(launcher),
    );
    let report = provisioner.provision(&scenario.cluster).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => println!("{}", format_report(&report)),
    }
    Ok(())
}

fn format_report(report: &PassReport) -> String {
    let mut out = format!(
        "✓ {} node(s) for {} pod(s) in {} round(s)\n",
        report.launched.len(),
        report.launched_pods(),
        report.rounds
    );
    for node in &report.launched {
        let d = &node.descriptor;
        out.push_str(&format!(
            "  {:<24} {:<14} {:<12} {:<10} ${:.4}/h  {} pod(s)",
            d.name,
            d.instance_type,
            d.zone,
            d.capacity_type,
            d.price,
            d.bound_pods.len()
        ));
        if node.fallbacks > 0 {
            out.push_str(&format!("  ({} fallback(s))", node.fallbacks));
        }
        out.push('\n');
    }
    if !report.pending.is_empty() {
        out.push_str(&format!("\nPending ({}):\n", report.pending.len()));
        for (pod, reason) in &report.pending {
            out.push_str(&format!("  {pod}: {reason}\n"));
        }
    }
    if !report.skipped.is_empty() {
        out.push_str("\nSkipped:\n");
        for skipped in &report.skipped {
            out.push_str(&format!("  {skipped}\n"));
        }
    }
    if report.cancelled {
        out.push_str("\nPass was cancelled before every node launched.\n");
    }
    out
}
