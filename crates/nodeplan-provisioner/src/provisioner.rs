//! Provisioner: one pass from pending pods to launched nodes.
//!
//! A pass:
//! - indexes the snapshot's NodePools and NodeClasses, skipping invalid ones
//! - reads the cloud inventory once and resolves every NodeClass against it
//! - builds one catalog per NodePool and packs the pending pods
//! - materializes and launches each node stub, falling back to the stub's
//!   next-cheapest offering when the cloud has no capacity
//!
//! Node names are claimed in a set shared by every pass of one
//! `Provisioner`; a pass that finds its node name already claimed drops that
//! node and reports its pods as pending.

use crate::cloud::{CloudInventory, CloudLauncher, LaunchedInstance};
use crate::error::{LaunchError, ProvisionError, ProvisionResult};
use crate::snapshot::{ClusterSnapshot, IndexedPool, PassIndex};
use nodeplan_catalog::{Catalog, CatalogSettings, NodeProfile};
use nodeplan_core::{NodeplanConfig, ResourceList};
use nodeplan_materialize::{InventorySnapshot, LaunchDescriptor, Materializer, ResolvedNodeClass};
use nodeplan_placement::{NodeStub, PodCandidate, PoolOption, Simulator, SimulatorSettings};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Why a pod is still pending after a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum PendingReason {
    /// The pod object itself is malformed.
    Invalid(String),
    /// No NodePool or offering can run the pod.
    Infeasible(String),
    /// Every offering of the pod's node was out of capacity or quota.
    Capacity(String),
    /// The cloud refused the pod's node for another reason.
    Rejected(String),
    /// The pod's node was already committed by a concurrent pass.
    Conflict(String),
    Cancelled,
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingReason::Invalid(m) => write!(f, "invalid: {m}"),
            PendingReason::Infeasible(m) => write!(f, "infeasible: {m}"),
            PendingReason::Capacity(m) => write!(f, "capacity: {m}"),
            PendingReason::Rejected(m) => write!(f, "rejected: {m}"),
            PendingReason::Conflict(node) => write!(f, "conflict: node {node} already committed"),
            PendingReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A node the cloud accepted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedNode {
    pub descriptor: LaunchDescriptor,
    pub instance: LaunchedInstance,
    /// Offerings that were out of capacity before this one was accepted.
    pub fallbacks: usize,
}

/// Outcome of one pass.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub launched: Vec<LaunchedNode>,
    /// Pod id to the reason it is still pending.
    pub pending: BTreeMap<String, PendingReason>,
    /// NodePools and NodeClasses left out of the pass, with the reason.
    pub skipped: Vec<String>,
    pub rounds: usize,
    /// Cancellation arrived after some nodes were launched.
    pub cancelled: bool,
}

impl PassReport {
    pub fn launched_pods(&self) -> usize {
        self.launched.iter().map(|n| n.descriptor.bound_pods.len()).sum()
    }
}

pub struct Provisioner {
    config: NodeplanConfig,
    inventory: Arc<dyn CloudInventory>,
    launcher: Arc<dyn CloudLauncher>,
    /// Node names launched (or being launched) by any pass, until released.
    committed: Arc<RwLock<BTreeSet<String>>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Provisioner {
    pub fn new(
        config: NodeplanConfig,
        inventory: Arc<dyn CloudInventory>,
        launcher: Arc<dyn CloudLauncher>,
    ) -> Self {
        Self {
            config,
            inventory,
            launcher,
            committed: Arc::new(RwLock::new(BTreeSet::new())),
            cancel: None,
        }
    }

    /// Stop passes once `true` is sent on the channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn committed_names(&self) -> BTreeSet<String> {
        self.committed.read().await.clone()
    }

    /// Forget committed names whose nodes have registered or are gone, so
    /// the set only holds launches still in flight. Returns how many of
    /// `names` were held.
    pub async fn release_committed<I, S>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut committed = self.committed.write().await;
        let released = names.into_iter().filter(|name| committed.remove(name.as_ref())).count();
        if released > 0 {
            debug!(released, remaining = committed.len(), "committed node names released");
        }
        released
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run one pass over `snapshot`.
    ///
    /// Returns [`ProvisionError::Cancelled`] when cancellation arrives before
    /// any node was launched. Later cancellation ends the pass early with
    /// `cancelled` set in the report.
    pub async fn provision(&self, snapshot: &ClusterSnapshot) -> ProvisionResult<PassReport> {
        let started = Instant::now();
        let mut report = PassReport::default();

        let index = PassIndex::build(snapshot);
        report.skipped = index.invalid.iter().map(ToString::to_string).collect();
        info!(
            pods = snapshot.pods.len(),
            nodepools = index.pools.len(),
            nodeclasses = index.node_classes.len(),
            "pass started"
        );

        let inventory = self.load_inventory(&index).await?;
        let resolved = self.resolve_node_classes(&index, &inventory, &mut report);
        let pools = self.pool_options(&index, &inventory, &resolved, snapshot, &mut report)?;

        let mut candidates = Vec::with_capacity(snapshot.pods.len());
        for pod in &snapshot.pods {
            match PodCandidate::from_pod(pod) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    warn!(pod = %pod.id(), error = %e, "pod has malformed constraints");
                    report.pending.insert(pod.id(), PendingReason::Invalid(e.to_string()));
                }
            }
        }

        let simulation = Simulator::new(pools, SimulatorSettings::from_config(&self.config))
            .simulate(candidates)
            .await?;
        report.rounds = simulation.rounds;
        for (pod, reason) in simulation.failures {
            report.pending.insert(pod, PendingReason::Infeasible(reason.to_string()));
        }

        if self.is_cancelled() {
            info!(stubs = simulation.stubs.len(), "pass cancelled after packing");
            return Err(ProvisionError::Cancelled);
        }

        let materializer = Materializer::from_config(&self.config);
        let by_name: BTreeMap<&str, &IndexedPool> =
            index.pools.iter().map(|p| (p.pool.name.as_str(), p)).collect();

        for stub in &simulation.stubs {
            if report.cancelled || self.is_cancelled() {
                report.cancelled = true;
                mark_pending(&mut report, stub, PendingReason::Cancelled);
                continue;
            }
            // Stubs only come from indexed pools with resolved nodeclasses.
            let Some(indexed) = by_name.get(stub.pool.as_str()).copied() else {
                continue;
            };
            let Some(resolved) = resolved.get(&indexed.node_class.name) else {
                continue;
            };

            match self.launch_stub(stub, indexed, resolved, &materializer).await {
                Ok(node) => report.launched.push(node),
                Err(reason) => {
                    if reason == PendingReason::Cancelled {
                        report.cancelled = true;
                    }
                    mark_pending(&mut report, stub, reason);
                }
            }
        }

        if report.cancelled && report.launched.is_empty() {
            info!("pass cancelled before any launch");
            return Err(ProvisionError::Cancelled);
        }

        info!(
            launched = report.launched.len(),
            pods = report.launched_pods(),
            pending = report.pending.len(),
            rounds = report.rounds,
            cancelled = report.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pass finished"
        );
        Ok(report)
    }

    async fn load_inventory(&self, index: &PassIndex) -> ProvisionResult<InventorySnapshot> {
        let (instance_types, subnets, security_groups, images) = tokio::try_join!(
            self.inventory.describe_instance_types(),
            self.inventory.describe_subnets(),
            self.inventory.describe_security_groups(),
            self.inventory.describe_images(),
        )?;

        let mut ssm_parameters = BTreeMap::new();
        for name in index.ssm_parameters(&self.config.cluster.kubernetes_version) {
            if let Some(value) = self.inventory.resolve_ssm_parameter(&name).await? {
                ssm_parameters.insert(name, value);
            }
        }

        debug!(
            instance_types = instance_types.len(),
            subnets = subnets.len(),
            security_groups = security_groups.len(),
            images = images.len(),
            ssm_parameters = ssm_parameters.len(),
            "inventory loaded"
        );
        Ok(InventorySnapshot {
            instance_types,
            subnets,
            security_groups,
            images,
            ssm_parameters,
        })
    }

    fn resolve_node_classes(
        &self,
        index: &PassIndex,
        inventory: &InventorySnapshot,
        report: &mut PassReport,
    ) -> BTreeMap<String, ResolvedNodeClass> {
        let mut resolved = BTreeMap::new();
        for (name, node_class) in &index.node_classes {
            match ResolvedNodeClass::resolve(node_class, inventory, &self.config.cluster.kubernetes_version) {
                Ok(r) => {
                    resolved.insert(name.clone(), r);
                }
                Err(e) => {
                    warn!(nodeclass = %name, error = %e, "nodeclass could not be resolved");
                    report.skipped.push(format!("NodeClass {name:?}: {e}"));
                }
            }
        }
        resolved
    }

    fn pool_options(
        &self,
        index: &PassIndex,
        inventory: &InventorySnapshot,
        resolved: &BTreeMap<String, ResolvedNodeClass>,
        snapshot: &ClusterSnapshot,
        report: &mut PassReport,
    ) -> ProvisionResult<Vec<PoolOption>> {
        let settings = CatalogSettings::from_config(&self.config);
        let mut pools = Vec::with_capacity(index.pools.len());
        for indexed in &index.pools {
            let Some(resolved) = resolved.get(&indexed.node_class.name) else {
                report.skipped.push(format!(
                    "NodePool {:?}: nodeclass {} could not be resolved",
                    indexed.pool.name, indexed.node_class.name
                ));
                continue;
            };
            let profile = NodeProfile::for_pool(&indexed.pool, &indexed.node_class);
            let catalog = Catalog::new(&inventory.instance_types, settings.clone(), &profile)?
                .restrict_zones(&resolved.zones());
            let usage = snapshot
                .usage
                .get(&indexed.pool.name)
                .cloned()
                .unwrap_or_else(ResourceList::new);
            match PoolOption::new(indexed.pool.clone(), Arc::new(catalog), usage) {
                Ok(option) => pools.push(option),
                Err(e) => {
                    warn!(nodepool = %indexed.pool.name, error = %e, "nodepool requirements do not parse");
                    report.skipped.push(format!("NodePool {:?}: {e}", indexed.pool.name));
                }
            }
        }
        Ok(pools)
    }

    /// Claim the stub's name, then launch it on the cheapest offering the
    /// cloud accepts. The claim is released when no offering launches.
    async fn launch_stub(
        &self,
        stub: &NodeStub,
        indexed: &IndexedPool,
        resolved: &ResolvedNodeClass,
        materializer: &Materializer,
    ) -> Result<LaunchedNode, PendingReason> {
        if !self.committed.write().await.insert(stub.name.clone()) {
            warn!(node = %stub.name, "node already committed by another pass, dropping it");
            return Err(PendingReason::Conflict(stub.name.clone()));
        }

        let mut outcome = Err(PendingReason::Capacity(format!("node {} has no offerings", stub.name)));
        let mut fallbacks = 0;
        for offering in &stub.offerings {
            if self.is_cancelled() {
                outcome = Err(PendingReason::Cancelled);
                break;
            }
            let descriptor = match materializer.materialize(stub, offering, &indexed.pool, &indexed.node_class, resolved) {
                Ok(d) => d,
                Err(e) => {
                    debug!(node = %stub.name, instance_type = %offering.name(), error = %e, "offering cannot be materialized");
                    outcome = Err(PendingReason::Rejected(e.to_string()));
                    continue;
                }
            };
            match self.launcher.launch(&descriptor).await {
                Ok(instance) => {
                    return Ok(LaunchedNode {
                        descriptor,
                        instance,
                        fallbacks,
                    });
                }
                Err(e @ LaunchError::CapacityUnavailable { .. }) => {
                    info!(node = %stub.name, error = %e, "offering unavailable, trying the next one");
                    fallbacks += 1;
                    outcome = Err(PendingReason::Capacity(e.to_string()));
                }
                Err(e @ LaunchError::QuotaExceeded(_)) => {
                    warn!(node = %stub.name, error = %e, "launch refused");
                    outcome = Err(PendingReason::Capacity(e.to_string()));
                    break;
                }
                Err(e @ LaunchError::MalformedRequest(_)) => {
                    warn!(node = %stub.name, error = %e, "launch refused");
                    outcome = Err(PendingReason::Rejected(e.to_string()));
                    break;
                }
            }
        }

        self.committed.write().await.remove(&stub.name);
        outcome
    }
}

fn mark_pending(report: &mut PassReport, stub: &NodeStub, reason: PendingReason) {
    for pod in &stub.pods {
        report.pending.insert(pod.clone(), reason.clone());
    }
}
