//! The scheduling simulator.
//!
//! A pass moves through four phases. Pending pods are ranked against the
//! NodePools and grouped per pool (`Grouped`), every group is bin-packed onto
//! hypothetical nodes (`Packed`), and closed nodes become named
//! [`NodeStub`]s (`Finalized`). Pods a pool cannot take fall through to
//! their next-ranked pool in a following round.
//!
//! Pools pack concurrently on blocking tasks; the groups of one pool pack
//! one after another because they share the pool's limit budget. Pools
//! whose pending pods select each other pack in turn, so each sees the pods
//! the previous ones placed.

use crate::convert::PodCandidate;
use crate::error::{Infeasible, PlacementResult, SimulationError};
use crate::ranker::{PoolOption, rank};
use crate::topology::{PlacedPod, Topology};
use nodeplan_catalog::OfferingCandidate;
use nodeplan_catalog::instancetype::is_offering_label;
use nodeplan_core::resources::{CPU, MEMORY};
use nodeplan_core::{NodeplanConfig, Requirements, ResourceList};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Hex characters of the pod-set digest carried in node names.
const NAME_HASH_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Grouped,
    Packed,
    Finalized,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Grouped => "grouped",
            Phase::Packed => "packed",
            Phase::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatorSettings {
    pub max_concurrent_pools: usize,
    /// Distinct instance types kept on each stub. Zero keeps all.
    pub max_instance_types: usize,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_pools: 4,
            max_instance_types: 60,
        }
    }
}

impl SimulatorSettings {
    pub fn from_config(config: &NodeplanConfig) -> Self {
        Self {
            max_concurrent_pools: config.scheduling.max_concurrent_pools,
            max_instance_types: config.scheduling.max_instance_types,
        }
    }
}

/// A node the simulator decided to create, with the pods bound to it.
#[derive(Debug, Clone)]
pub struct NodeStub {
    pub name: String,
    pub pool: String,
    pub requirements: Requirements,
    /// Summed requests of the bound pods.
    pub requests: ResourceList,
    /// Ids (`namespace/name`) of the bound pods.
    pub pods: Vec<String>,
    /// Offerings that can host every bound pod, cheapest first.
    pub offerings: Vec<OfferingCandidate>,
}

impl NodeStub {
    pub fn cheapest(&self) -> Option<&OfferingCandidate> {
        self.offerings.first()
    }

    /// Distinct instance types among the offerings, cheapest first.
    pub fn instance_types(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.offerings
            .iter()
            .map(|o| o.name())
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// Result of one simulation pass.
#[derive(Debug, Default)]
pub struct Simulation {
    pub stubs: Vec<NodeStub>,
    /// Pods no pool could take, keyed by pod id, with the last reason.
    pub failures: BTreeMap<String, Infeasible>,
    pub rounds: usize,
}

struct Pending {
    pod: PodCandidate,
    /// Indices of eligible pools, best first.
    order: Vec<usize>,
    cursor: usize,
}

pub struct Simulator {
    pools: Arc<Vec<PoolOption>>,
    settings: SimulatorSettings,
}

impl Simulator {
    pub fn new(pools: Vec<PoolOption>, settings: SimulatorSettings) -> Self {
        Self {
            pools: Arc::new(pools),
            settings,
        }
    }

    pub fn pools(&self) -> &[PoolOption] {
        &self.pools
    }

    /// Pack `pods` onto new nodes.
    pub async fn simulate(&self, pods: Vec<PodCandidate>) -> Result<Simulation, SimulationError> {
        let mut sim = Simulation::default();
        debug!(pods = pods.len(), pools = self.pools.len(), phase = %Phase::Pending, "simulation started");
        let topology = Arc::new(Topology::build(&pods, &self.pools));

        let mut pending = Vec::new();
        for pod in pods {
            match rank(&pod, &self.pools) {
                Ok(ranked) => {
                    let order = ranked
                        .iter()
                        .filter_map(|r| self.pools.iter().position(|p| std::ptr::eq(p, *r)))
                        .collect();
                    pending.push(Pending { pod, order, cursor: 0 });
                }
                Err(reason) => {
                    debug!(pod = %pod.id(), reason = %reason, "no eligible nodepool");
                    sim.failures.insert(pod.id(), reason);
                }
            }
        }

        let mut placed: Vec<PlacedPod> = Vec::new();
        let mut pass_usage = vec![ResourceList::new(); self.pools.len()];
        while !pending.is_empty() {
            sim.rounds += 1;
            let mut by_pool: BTreeMap<usize, Vec<Pending>> = BTreeMap::new();
            for entry in pending.drain(..) {
                by_pool.entry(entry.order[entry.cursor]).or_default().push(entry);
            }
            debug!(round = sim.rounds, pools = by_pool.len(), phase = %Phase::Grouped, "pods grouped by nodepool");

            let placed_snapshot = Arc::new(placed.clone());
            let clusters = pool_clusters(&by_pool);
            if clusters.iter().any(|c| c.len() > 1) {
                debug!(round = sim.rounds, clusters = clusters.len(), "coupled pods span nodepools, packing them in turn");
            }
            let mut outcomes = BTreeMap::new();
            for batch in clusters.chunks(self.settings.max_concurrent_pools.max(1)) {
                let mut set = JoinSet::new();
                for cluster in batch {
                    let work: Vec<(usize, ResourceList, Vec<PodCandidate>)> = cluster
                        .iter()
                        .map(|idx| {
                            let usage = self.pools[*idx].usage.add(&pass_usage[*idx]);
                            let pods = by_pool[idx].iter().map(|e| e.pod.clone()).collect();
                            (*idx, usage, pods)
                        })
                        .collect();
                    let pools = self.pools.clone();
                    let topology = topology.clone();
                    let snapshot = placed_snapshot.clone();
                    let max_instance_types = self.settings.max_instance_types;
                    set.spawn_blocking(move || {
                        // Each pool of a cluster sees what the previous ones placed.
                        let mut placed = snapshot.to_vec();
                        let mut packed = Vec::with_capacity(work.len());
                        for (idx, usage, pods) in work {
                            let outcome = pack_pool(&pools[idx], &topology, &placed, usage, pods, max_instance_types);
                            placed.extend(outcome.placed.iter().cloned());
                            packed.push((idx, outcome));
                        }
                        packed
                    });
                }
                while let Some(joined) = set.join_next().await {
                    outcomes.extend(joined?);
                }
            }

            for (idx, outcome) in outcomes {
                debug!(
                    round = sim.rounds,
                    nodepool = %self.pools[idx].name(),
                    nodes = outcome.stubs.len(),
                    failed = outcome.failed.len(),
                    phase = %Phase::Packed,
                    "nodepool packed"
                );
                pass_usage[idx].add_assign(&outcome.usage);
                placed.extend(outcome.placed);
                sim.stubs.extend(outcome.stubs);

                let mut entries: Vec<Option<Pending>> = by_pool
                    .remove(&idx)
                    .unwrap_or_default()
                    .into_iter()
                    .map(Some)
                    .collect();
                for (i, reason) in outcome.failed {
                    let Some(mut entry) = entries.get_mut(i).and_then(Option::take) else {
                        continue;
                    };
                    entry.cursor += 1;
                    if entry.cursor < entry.order.len() {
                        debug!(
                            pod = %entry.pod.id(),
                            from = %self.pools[idx].name(),
                            to = %self.pools[entry.order[entry.cursor]].name(),
                            reason = %reason,
                            "falling through to next nodepool"
                        );
                        pending.push(entry);
                    } else {
                        sim.failures.insert(entry.pod.id(), reason);
                    }
                }
            }
        }

        info!(
            nodes = sim.stubs.len(),
            failed = sim.failures.len(),
            rounds = sim.rounds,
            phase = %Phase::Finalized,
            "simulation finished"
        );
        Ok(sim)
    }
}

// ── Packing ────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolOutcome {
    stubs: Vec<NodeStub>,
    placed: Vec<PlacedPod>,
    /// Capacity of the stubs, for the pool's limit budget.
    usage: ResourceList,
    /// Index into the input pods, and why it did not fit.
    failed: Vec<(usize, Infeasible)>,
}

struct OpenNode {
    hostname: String,
    requirements: Requirements,
    requests: ResourceList,
    options: Vec<OfferingCandidate>,
    pods: Vec<PodCandidate>,
}

impl OpenNode {
    /// Capacity of the cheapest remaining option.
    fn capacity(&self) -> ResourceList {
        self.options
            .first()
            .map(|o| o.instance_type.capacity().clone())
            .unwrap_or_default()
    }

    fn apply(&mut self, update: NodeUpdate, pod: &PodCandidate) {
        self.requirements = update.requirements;
        self.requests = update.requests;
        self.options = update.options;
        self.pods.push(pod.clone());
    }
}

struct NodeUpdate {
    requirements: Requirements,
    requests: ResourceList,
    options: Vec<OfferingCandidate>,
}

struct Packer<'a> {
    pool: &'a PoolOption,
    topology: &'a Topology,
    pool_options: Vec<OfferingCandidate>,
    /// Pods outside the group being packed.
    placed: Vec<PlacedPod>,
    /// Pool usage outside the group being packed.
    usage: ResourceList,
    max_instance_types: usize,
    opened: usize,
    outcome: PoolOutcome,
}

fn pack_pool(
    pool: &PoolOption,
    topology: &Topology,
    placed: &[PlacedPod],
    usage: ResourceList,
    pods: Vec<PodCandidate>,
    max_instance_types: usize,
) -> PoolOutcome {
    let mut packer = Packer {
        pool,
        topology,
        pool_options: pool.catalog.query(&pool.requirements),
        placed: placed.to_vec(),
        usage,
        max_instance_types,
        opened: 0,
        outcome: PoolOutcome::default(),
    };
    for group in groups(pods) {
        packer.pack_group(group);
    }
    packer.outcome
}

impl Packer<'_> {
    fn pack_group(&mut self, mut group: Vec<(usize, PodCandidate)>) {
        group.sort_by(|(_, a), (_, b)| {
            b.requests
                .get(CPU)
                .cmp(&a.requests.get(CPU))
                .then_with(|| b.requests.get(MEMORY).cmp(&a.requests.get(MEMORY)))
                .then_with(|| a.id().cmp(&b.id()))
        });

        let mut nodes = Vec::new();
        for (index, pod) in group {
            if let Err(reason) = self.place(&mut nodes, &pod) {
                debug!(pod = %pod.id(), nodepool = %self.pool.name(), reason = %reason, "pod does not fit nodepool");
                self.outcome.failed.push((index, reason));
            }
        }
        for node in nodes {
            self.close(node);
        }
    }

    /// Place `pod`, relaxing its preferences one at a time until it fits.
    fn place(&mut self, nodes: &mut Vec<OpenNode>, pod: &PodCandidate) -> PlacementResult<()> {
        let mut candidate = pod.clone();
        loop {
            match self.try_place(nodes, &candidate) {
                Ok(()) => return Ok(()),
                Err(reason) => match candidate.relax() {
                    Some(step) => {
                        debug!(pod = %pod.id(), relaxed = %step, reason = %reason, "retrying with relaxed preferences");
                    }
                    None => return Err(reason),
                },
            }
        }
    }

    fn try_place(&mut self, nodes: &mut Vec<OpenNode>, pod: &PodCandidate) -> PlacementResult<()> {
        let pod_reqs = pod.requirements()?;
        let placed = self.visible(nodes);

        for i in 0..nodes.len() {
            let others = self.usage_excluding(nodes, Some(i));
            if let Ok(update) = self.try_add(&nodes[i], pod, &pod_reqs, &placed, &others) {
                nodes[i].apply(update, pod);
                return Ok(());
            }
        }

        let mut node = OpenNode {
            hostname: format!("{}/open-{}", self.pool.name(), self.opened),
            requirements: self.pool.requirements.clone(),
            requests: ResourceList::new(),
            options: self.pool_options.clone(),
            pods: Vec::new(),
        };
        let others = self.usage_excluding(nodes, None);
        let update = self.try_add(&node, pod, &pod_reqs, &placed, &others)?;
        node.apply(update, pod);
        self.opened += 1;
        nodes.push(node);
        Ok(())
    }

    /// Pods placed so far, including those on the group's open nodes.
    fn visible(&self, nodes: &[OpenNode]) -> Vec<PlacedPod> {
        let mut placed = self.placed.clone();
        for node in nodes {
            let domains = self.topology.node_domains(&node.hostname, &node.requirements, &node.options);
            placed.extend(node.pods.iter().map(|p| PlacedPod::new(p, domains.clone())));
        }
        placed
    }

    fn usage_excluding(&self, nodes: &[OpenNode], skip: Option<usize>) -> ResourceList {
        let mut usage = self.usage.clone();
        for (i, node) in nodes.iter().enumerate() {
            if Some(i) != skip {
                usage.add_assign(&node.capacity());
            }
        }
        usage
    }

    fn try_add(
        &self,
        node: &OpenNode,
        pod: &PodCandidate,
        pod_reqs: &Requirements,
        placed: &[PlacedPod],
        others: &ResourceList,
    ) -> PlacementResult<NodeUpdate> {
        let reqs = node.requirements.intersect(pod_reqs)?;
        let requests = node.requests.add(&pod.requests);

        let relevant = reqs.filter_keys(is_offering_label);
        let satisfying: Vec<&OfferingCandidate> =
            node.options.iter().filter(|o| relevant.satisfies(&o.labels)).collect();
        if satisfying.is_empty() {
            return Err(Infeasible::NoOffering(reqs.to_string()));
        }

        let fitting: Vec<&OfferingCandidate> = satisfying
            .iter()
            .copied()
            .filter(|o| requests.fits(o.instance_type.allocatable()))
            .collect();
        if fitting.is_empty() {
            let resource = satisfying
                .iter()
                .find_map(|o| requests.first_exceeding(o.instance_type.allocatable()))
                .unwrap_or(CPU);
            return Err(Infeasible::Resources(resource.to_string()));
        }

        let limits = &self.pool.pool.limits;
        let mut exceeded = None;
        let within: Vec<OfferingCandidate> = fitting
            .into_iter()
            .filter(|o| {
                if limits.is_empty() {
                    return true;
                }
                match others.add(o.instance_type.capacity()).first_exceeding_limits(limits) {
                    Some(resource) => {
                        exceeded.get_or_insert_with(|| resource.to_string());
                        false
                    }
                    None => true,
                }
            })
            .cloned()
            .collect();
        if within.is_empty() {
            return Err(Infeasible::Limits {
                pool: self.pool.name().to_string(),
                resource: exceeded.unwrap_or_default(),
            });
        }

        let reqs = self
            .topology
            .constrain(pod, pod_reqs, &node.hostname, reqs, &within, placed)?;
        let relevant = reqs.filter_keys(is_offering_label);
        let options: Vec<OfferingCandidate> =
            within.into_iter().filter(|o| relevant.satisfies(&o.labels)).collect();
        if options.is_empty() {
            return Err(Infeasible::NoOffering(reqs.to_string()));
        }
        check_min_values(&reqs, &options)?;

        Ok(NodeUpdate {
            requirements: reqs,
            requests,
            options,
        })
    }

    fn close(&mut self, node: OpenNode) {
        let name = stub_name(self.pool.name(), node.pods.iter().map(|p| p.uid.as_str()));
        let domains = self.topology.node_domains(&name, &node.requirements, &node.options);
        let capacity = node.capacity();
        self.usage.add_assign(&capacity);
        self.outcome.usage.add_assign(&capacity);
        for pod in &node.pods {
            let placed = PlacedPod::new(pod, domains.clone());
            self.placed.push(placed.clone());
            self.outcome.placed.push(placed);
        }

        let offerings = truncate_options(&node.requirements, node.options, self.max_instance_types);
        debug!(
            node = %name,
            nodepool = %self.pool.name(),
            pods = node.pods.len(),
            offerings = offerings.len(),
            cheapest = offerings.first().map(|o| o.name()).unwrap_or(""),
            "node closed"
        );
        self.outcome.stubs.push(NodeStub {
            name,
            pool: self.pool.name().to_string(),
            requirements: node.requirements,
            requests: node.requests,
            pods: node.pods.iter().map(PodCandidate::id).collect(),
            offerings,
        });
    }
}

/// Partition the pools of one round into clusters whose pending pods are
/// coupled across pool boundaries. Pools of a cluster pack one after
/// another; separate clusters pack concurrently.
fn pool_clusters(by_pool: &BTreeMap<usize, Vec<Pending>>) -> Vec<Vec<usize>> {
    let pools: Vec<usize> = by_pool.keys().copied().collect();
    let entries: Vec<(usize, &PodCandidate)> = by_pool
        .values()
        .enumerate()
        .flat_map(|(slot, pending)| pending.iter().map(move |e| (slot, &e.pod)))
        .collect();
    let mut parent: Vec<usize> = (0..pools.len()).collect();
    for (i, (slot_a, a)) in entries.iter().enumerate() {
        for (slot_b, b) in &entries[i + 1..] {
            if slot_a != slot_b && (a.selects(b) || b.selects(a)) {
                let (x, y) = (find(&mut parent, *slot_a), find(&mut parent, *slot_b));
                if x != y {
                    parent[x.max(y)] = x.min(y);
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (slot, idx) in pools.iter().enumerate() {
        let root = find(&mut parent, slot);
        clusters.entry(root).or_default().push(*idx);
    }
    clusters.into_values().collect()
}

/// Partition pods into groups that must be packed together: pods coupled
/// through affinity, anti-affinity or spread selectors share a group, and
/// all uncoupled pods form one trailing free group.
fn groups(pods: Vec<PodCandidate>) -> Vec<Vec<(usize, PodCandidate)>> {
    let n = pods.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if pods[i].selects(&pods[j]) || pods[j].selects(&pods[i]) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut sets: BTreeMap<usize, Vec<(usize, PodCandidate)>> = BTreeMap::new();
    for (i, pod) in pods.into_iter().enumerate() {
        let root = find(&mut parent, i);
        sets.entry(root).or_default().push((i, pod));
    }

    let mut coupled = Vec::new();
    let mut free = Vec::new();
    for set in sets.into_values() {
        if set.len() > 1 {
            coupled.push(set);
        } else {
            free.extend(set);
        }
    }
    coupled.sort_by_cached_key(|set| set.iter().map(|(_, p)| p.id()).min().unwrap_or_default());
    if !free.is_empty() {
        coupled.push(free);
    }
    coupled
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn check_min_values(reqs: &Requirements, options: &[OfferingCandidate]) -> PlacementResult<()> {
    for (key, min) in reqs.with_min_values() {
        let found = options
            .iter()
            .filter_map(|o| o.labels.get(key))
            .collect::<BTreeSet<_>>()
            .len();
        if found < min {
            return Err(Infeasible::MinValues {
                key: key.to_string(),
                min,
                found,
            });
        }
    }
    Ok(())
}

/// Keep the cheapest `max` instance types, unless that would break a
/// `minValues` floor.
fn truncate_options(reqs: &Requirements, options: Vec<OfferingCandidate>, max: usize) -> Vec<OfferingCandidate> {
    if max == 0 {
        return options;
    }
    let mut kept: BTreeSet<String> = BTreeSet::new();
    let truncated: Vec<OfferingCandidate> = options
        .iter()
        .filter(|o| {
            if kept.contains(o.name()) {
                return true;
            }
            if kept.len() < max {
                kept.insert(o.name().to_string());
                return true;
            }
            false
        })
        .cloned()
        .collect();
    if check_min_values(reqs, &truncated).is_ok() {
        truncated
    } else {
        options
    }
}

/// `<pool>-<digest>`, where the digest covers the pool and the sorted uids
/// of the bound pods.
pub fn stub_name<'a>(pool: &str, uids: impl Iterator<Item = &'a str>) -> String {
    let mut uids: Vec<&str> = uids.collect();
    uids.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(pool.as_bytes());
    for uid in uids {
        hasher.update(b"\n");
        hasher.update(uid.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{pool}-{}", &digest[..NAME_HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplan_api::{
        Container, ContainerRestartPolicy, NodeAffinity, NodePool, NodeSelectorTerm, Pod, PodAffinity,
        PodAffinityTerm, PreferredSchedulingTerm, TopologySpreadConstraint, WhenUnsatisfiable,
    };
    use nodeplan_catalog::{Arch, CapacityType, Catalog, CatalogSettings, InstanceTypeInfo, NodeProfile};
    use nodeplan_core::labels::{LABEL_ARCH, LABEL_HOSTNAME, LABEL_INSTANCE_TYPE, LABEL_TOPOLOGY_ZONE};
    use nodeplan_core::{LabelSelector, NodeSelectorRequirement, Operator, Quantity};

    const ZONES: [(&str, &str); 3] = [
        ("us-west-2a", "usw2-az1"),
        ("us-west-2b", "usw2-az2"),
        ("us-west-2c", "usw2-az3"),
    ];

    fn make_catalog() -> Arc<Catalog> {
        let mut xlarge = InstanceTypeInfo::new("m5.xlarge", 4, 16384, Arch::Amd64);
        let mut xxlarge = InstanceTypeInfo::new("m5.2xlarge", 8, 32768, Arch::Amd64);
        for (zone, id) in ZONES {
            xlarge = xlarge.with_offering(zone, id, CapacityType::OnDemand, Some(0.192));
            xxlarge = xxlarge.with_offering(zone, id, CapacityType::OnDemand, Some(0.384));
        }
        Arc::new(Catalog::new(&[xlarge, xxlarge], CatalogSettings::default(), &NodeProfile::default()).unwrap())
    }

    fn make_pool(name: &str, weight: Option<i32>) -> PoolOption {
        let mut pool = NodePool::new(name, "default");
        pool.weight = weight;
        PoolOption::new(pool, make_catalog(), ResourceList::new()).unwrap()
    }

    fn make_simulator(pools: Vec<PoolOption>) -> Simulator {
        Simulator::new(pools, SimulatorSettings::default())
    }

    fn container(cpu_milli: i64) -> Container {
        Container {
            requests: ResourceList::new().with(CPU, Quantity::from_milli(cpu_milli)),
            ..Default::default()
        }
    }

    fn make_pod(name: &str, cpu_milli: i64) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.labels.insert("app".into(), "web".into());
        pod.containers.push(container(cpu_milli));
        pod
    }

    fn candidates(pods: &[Pod]) -> Vec<PodCandidate> {
        pods.iter().map(|p| PodCandidate::from_pod(p).unwrap()).collect()
    }

    fn zone_of(stub: &NodeStub) -> String {
        let values = stub.requirements.get(LABEL_TOPOLOGY_ZONE).and_then(|r| r.values()).unwrap();
        assert_eq!(values.len(), 1);
        values.iter().next().unwrap().clone()
    }

    #[tokio::test]
    async fn small_pods_share_one_node() {
        let pods: Vec<_> = (0..3).map(|i| make_pod(&format!("web-{i}"), 500)).collect();
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 1);
        assert_eq!(sim.stubs[0].pods.len(), 3);
        assert_eq!(sim.stubs[0].cheapest().unwrap().name(), "m5.xlarge");
        assert_eq!(sim.stubs[0].requests.get(CPU), Quantity::from_milli(1500));
        assert!(sim.failures.is_empty());
        assert_eq!(sim.rounds, 1);
    }

    #[tokio::test]
    async fn sidecar_pod_next_to_buffer_needs_larger_type() {
        let buffer = make_pod("buffer", 3000);
        let mut sidecar = Pod::new("default", "with-sidecar");
        sidecar.containers.push(container(400));
        sidecar.init_containers = vec![
            container(300),
            Container {
                restart_policy: Some(ContainerRestartPolicy::Always),
                ..container(350)
            },
            container(1000),
        ];
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&[buffer, sidecar]))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 1);
        assert_eq!(sim.stubs[0].requests.get(CPU), Quantity::from_milli(4350));
        assert_eq!(sim.stubs[0].instance_types(), ["m5.2xlarge"]);
    }

    #[tokio::test]
    async fn zone_spread_uses_three_zones() {
        let pods: Vec<_> = (0..3)
            .map(|i| {
                let mut pod = make_pod(&format!("web-{i}"), 100);
                pod.topology_spread_constraints.push(TopologySpreadConstraint {
                    max_skew: 1,
                    topology_key: LABEL_TOPOLOGY_ZONE.into(),
                    when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
                    label_selector: Some(LabelSelector::from_labels(&[("app", "web")])),
                    min_domains: Some(3),
                });
                pod
            })
            .collect();
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 3);
        let zones: BTreeSet<String> = sim.stubs.iter().map(zone_of).collect();
        assert_eq!(zones.len(), 3);
        assert!(sim.failures.is_empty());
    }

    #[tokio::test]
    async fn hostname_self_affinity_packs_one_node() {
        let pods: Vec<_> = (0..2)
            .map(|i| {
                let mut pod = make_pod(&format!("cache-{i}"), 100);
                pod.affinity.pod_affinity = Some(PodAffinity {
                    required: vec![PodAffinityTerm {
                        label_selector: Some(LabelSelector::from_labels(&[("app", "web")])),
                        namespaces: vec![],
                        topology_key: LABEL_HOSTNAME.into(),
                    }],
                    preferred: vec![],
                });
                pod
            })
            .collect();
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 1);
        assert_eq!(sim.stubs[0].pods.len(), 2);
    }

    #[tokio::test]
    async fn hostname_anti_affinity_splits_nodes() {
        let pods: Vec<_> = (0..2)
            .map(|i| {
                let mut pod = make_pod(&format!("web-{i}"), 100);
                pod.affinity.pod_anti_affinity = Some(PodAffinity {
                    required: vec![PodAffinityTerm {
                        label_selector: Some(LabelSelector::from_labels(&[("app", "web")])),
                        namespaces: vec![],
                        topology_key: LABEL_HOSTNAME.into(),
                    }],
                    preferred: vec![],
                });
                pod
            })
            .collect();
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 2);
        assert_ne!(sim.stubs[0].name, sim.stubs[1].name);
    }

    fn zone_anti_affine(mut pod: Pod) -> Pod {
        pod.affinity.pod_anti_affinity = Some(PodAffinity {
            required: vec![PodAffinityTerm {
                label_selector: Some(LabelSelector::from_labels(&[("app", "web")])),
                namespaces: vec![],
                topology_key: LABEL_TOPOLOGY_ZONE.into(),
            }],
            preferred: vec![],
        });
        pod
    }

    fn team_pool(team: &str) -> PoolOption {
        let mut pool = NodePool::new(team, "default");
        pool.template.labels.insert("team".into(), team.into());
        PoolOption::new(pool, make_catalog(), ResourceList::new()).unwrap()
    }

    #[tokio::test]
    async fn zone_anti_affinity_splits_zones_within_pool() {
        let pods: Vec<_> = (0..2)
            .map(|i| zone_anti_affine(make_pod(&format!("web-{i}"), 100)))
            .collect();
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert!(sim.failures.is_empty());
        assert_eq!(sim.stubs.len(), 2);
        assert_ne!(zone_of(&sim.stubs[0]), zone_of(&sim.stubs[1]));
    }

    #[tokio::test]
    async fn anti_affinity_holds_across_pools() {
        let pods: Vec<_> = ["x", "y"]
            .iter()
            .map(|team| {
                let mut pod = zone_anti_affine(make_pod(&format!("web-{team}"), 100));
                pod.node_selector.insert("team".into(), team.to_string());
                pod
            })
            .collect();
        let sim = make_simulator(vec![team_pool("x"), team_pool("y")])
            .simulate(candidates(&pods))
            .await
            .unwrap();

        assert!(sim.failures.is_empty());
        assert_eq!(sim.rounds, 1);
        assert_eq!(sim.stubs.len(), 2);
        let pools: BTreeSet<&str> = sim.stubs.iter().map(|s| s.pool.as_str()).collect();
        assert_eq!(pools, BTreeSet::from(["x", "y"]));
        assert_ne!(zone_of(&sim.stubs[0]), zone_of(&sim.stubs[1]));
    }

    #[tokio::test]
    async fn uncoupled_pools_pack_in_separate_clusters() {
        let pods: Vec<_> = ["x", "y"]
            .iter()
            .map(|team| {
                let mut pod = Pod::new("default", &format!("job-{team}"));
                pod.labels.insert("team".into(), team.to_string());
                pod.node_selector.insert("team".into(), team.to_string());
                pod.containers.push(container(100));
                PodCandidate::from_pod(&pod).unwrap()
            })
            .collect();
        let mut by_pool: BTreeMap<usize, Vec<Pending>> = BTreeMap::new();
        for (idx, pod) in pods.into_iter().enumerate() {
            by_pool.entry(idx).or_default().push(Pending { pod, order: vec![idx], cursor: 0 });
        }
        assert_eq!(pool_clusters(&by_pool), vec![vec![0], vec![1]]);
    }

    #[tokio::test]
    async fn heavier_pool_wins() {
        let mut light = NodePool::new("light", "default");
        light.weight = Some(10);
        light.template.requirements.push(NodeSelectorRequirement::new(
            LABEL_INSTANCE_TYPE,
            Operator::In,
            &["m5.xlarge"],
        ));
        let mut heavy = NodePool::new("heavy", "default");
        heavy.weight = Some(100);
        heavy.template.requirements.push(NodeSelectorRequirement::new(
            LABEL_INSTANCE_TYPE,
            Operator::In,
            &["m5.2xlarge"],
        ));
        let pools = vec![
            PoolOption::new(light, make_catalog(), ResourceList::new()).unwrap(),
            PoolOption::new(heavy, make_catalog(), ResourceList::new()).unwrap(),
        ];
        let sim = make_simulator(pools)
            .simulate(candidates(&[make_pod("web-0", 100)]))
            .await
            .unwrap();
        assert_eq!(sim.stubs[0].pool, "heavy");
        assert_eq!(sim.stubs[0].instance_types(), ["m5.2xlarge"]);
    }

    #[tokio::test]
    async fn limits_push_pods_to_next_pool() {
        let mut capped = NodePool::new("capped", "default");
        capped.weight = Some(100);
        capped.limits = ResourceList::new().with(CPU, Quantity::from_units(4));
        let pools = vec![
            PoolOption::new(capped, make_catalog(), ResourceList::new()).unwrap(),
            make_pool("overflow", None),
        ];
        let pods = [make_pod("web-0", 3000), make_pod("web-1", 3000)];
        let sim = make_simulator(pools).simulate(candidates(&pods)).await.unwrap();

        assert_eq!(sim.rounds, 2);
        let pools: Vec<&str> = sim.stubs.iter().map(|s| s.pool.as_str()).collect();
        assert_eq!(pools, ["capped", "overflow"]);
        assert!(sim.failures.is_empty());
    }

    #[tokio::test]
    async fn last_reason_reported_after_every_pool_fails() {
        let mut capped = NodePool::new("capped", "default");
        capped.limits = ResourceList::new().with(CPU, Quantity::from_units(4));
        let pools = vec![PoolOption::new(capped, make_catalog(), ResourceList::new()).unwrap()];
        let pods = [make_pod("web-0", 3000), make_pod("web-1", 3000)];
        let sim = make_simulator(pools).simulate(candidates(&pods)).await.unwrap();
        assert_eq!(sim.stubs.len(), 1);
        assert!(matches!(
            sim.failures.get("default/web-1"),
            Some(Infeasible::Limits { pool, .. }) if pool == "capped"
        ));
    }

    #[tokio::test]
    async fn pod_without_pool_is_reported() {
        let mut pod = make_pod("arm-only", 100);
        pod.node_selector.insert(LABEL_ARCH.into(), "arm64".into());
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&[pod]))
            .await
            .unwrap();
        assert!(sim.stubs.is_empty());
        assert!(matches!(sim.failures.get("default/arm-only"), Some(Infeasible::NoNodePool(_))));
    }

    #[tokio::test]
    async fn unsatisfiable_preference_is_relaxed() {
        let mut pod = make_pod("web-0", 100);
        pod.affinity.node_affinity = Some(NodeAffinity {
            required: vec![],
            preferred: vec![PreferredSchedulingTerm {
                weight: 50,
                preference: NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement::new(
                        LABEL_TOPOLOGY_ZONE,
                        Operator::In,
                        &["us-east-1a"],
                    )],
                },
            }],
        });
        let sim = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&[pod]))
            .await
            .unwrap();
        assert_eq!(sim.stubs.len(), 1);
        assert!(sim.failures.is_empty());
    }

    #[tokio::test]
    async fn min_values_rejects_narrow_nodes() {
        let mut pool = NodePool::new("diverse", "default");
        pool.template.requirements.push(
            NodeSelectorRequirement::new(LABEL_INSTANCE_TYPE, Operator::Exists, &[]).with_min_values(2),
        );
        let pools = vec![PoolOption::new(pool, make_catalog(), ResourceList::new()).unwrap()];

        let sim = make_simulator(pools.clone())
            .simulate(candidates(&[make_pod("small", 100)]))
            .await
            .unwrap();
        assert_eq!(sim.stubs[0].instance_types().len(), 2);

        // Only the larger type fits, leaving one distinct value.
        let sim = make_simulator(pools)
            .simulate(candidates(&[make_pod("big", 6000)]))
            .await
            .unwrap();
        assert!(matches!(
            sim.failures.get("default/big"),
            Some(Infeasible::MinValues { min: 2, found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn stub_names_are_stable() {
        let pods: Vec<_> = (0..2).map(|i| make_pod(&format!("web-{i}"), 100)).collect();
        let first = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        let second = make_simulator(vec![make_pool("default", None)])
            .simulate(candidates(&pods))
            .await
            .unwrap();
        assert_eq!(first.stubs[0].name, second.stubs[0].name);
        assert!(first.stubs[0].name.starts_with("default-"));
        assert_eq!(first.stubs[0].name.len(), "default-".len() + NAME_HASH_LEN);
    }

    #[test]
    fn stub_name_ignores_pod_order() {
        let a = stub_name("default", ["uid-1", "uid-2"].into_iter());
        let b = stub_name("default", ["uid-2", "uid-1"].into_iter());
        assert_eq!(a, b);
        assert_ne!(a, stub_name("other", ["uid-1", "uid-2"].into_iter()));
    }

    #[test]
    fn uncoupled_pods_share_the_free_group() {
        let mut spread = make_pod("b-spread", 100);
        spread.labels.insert("tier".into(), "db".into());
        spread.topology_spread_constraints.push(TopologySpreadConstraint {
            max_skew: 1,
            topology_key: LABEL_TOPOLOGY_ZONE.into(),
            when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
            label_selector: Some(LabelSelector::from_labels(&[("tier", "db")])),
            min_domains: None,
        });
        let mut peer = make_pod("a-peer", 100);
        peer.labels.insert("tier".into(), "db".into());
        let mut loner = make_pod("c-loner", 100);
        loner.labels.clear();

        let grouped = groups(candidates(&[spread, loner, peer]));
        assert_eq!(grouped.len(), 2);
        let coupled: Vec<usize> = grouped[0].iter().map(|(i, _)| *i).collect();
        assert_eq!(coupled, [0, 2]);
        assert_eq!(grouped[1].len(), 1);
        assert_eq!(grouped[1][0].1.name, "c-loner");
    }
}
