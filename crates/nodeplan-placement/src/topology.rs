//! Topology domains and inter-pod constraints.
//!
//! A domain is a value of a topology key (a zone, a capacity type, a
//! hostname). Placing a pod on a node narrows the node's requirements on
//! each topology key the pod constrains, so pods bound to the same node stay
//! mutually consistent. Counting only uses pods whose domain is already
//! decided (a single value); anti-affinity blocks every domain a pod might
//! still land in. Pods whose anti-affinity selects themselves settle on one
//! domain, mirroring the first pod of a self-selecting affinity group.

use crate::convert::{PodCandidate, selector_matches, term_matches};
use crate::error::{Infeasible, PlacementResult};
use crate::ranker::PoolOption;
use nodeplan_api::{PodAffinityTerm, TopologySpreadConstraint};
use nodeplan_catalog::OfferingCandidate;
use nodeplan_catalog::instancetype::is_offering_label;
use nodeplan_core::labels::LABEL_HOSTNAME;
use nodeplan_core::{Operator, Requirement, Requirements};
use std::collections::{BTreeMap, BTreeSet};

/// A pod already bound to a node in this pass, as seen by later pods.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedPod {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Required anti-affinity, which later pods must also respect.
    pub anti_affinity: Vec<PodAffinityTerm>,
    /// Domains the pod may occupy, per topology key.
    pub domains: BTreeMap<String, BTreeSet<String>>,
}

impl PlacedPod {
    pub fn new(pod: &PodCandidate, domains: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            namespace: pod.namespace.clone(),
            labels: pod.labels.clone(),
            anti_affinity: pod.pod_anti_affinity.clone(),
            domains,
        }
    }

    fn single_domain(&self, key: &str) -> Option<&str> {
        match self.domains.get(key) {
            Some(values) if values.len() == 1 => values.iter().next().map(String::as_str),
            _ => None,
        }
    }
}

/// Known domains per topology key for one pass.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    universe: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    /// Collect the domains every referenced topology key can take across
    /// `pools`. Hostnames are open-ended and never listed.
    pub fn build(pods: &[PodCandidate], pools: &[PoolOption]) -> Self {
        let keys: BTreeSet<&str> = pods
            .iter()
            .flat_map(|p| p.topology_keys())
            .filter(|k| *k != LABEL_HOSTNAME)
            .collect();
        let mut universe: BTreeMap<String, BTreeSet<String>> =
            keys.iter().map(|k| (k.to_string(), BTreeSet::new())).collect();
        if universe.is_empty() {
            return Self { universe };
        }

        for pool in pools {
            let offerings = pool.catalog.query(&pool.requirements);
            for (key, values) in universe.iter_mut() {
                if is_offering_label(key) {
                    values.extend(offerings.iter().filter_map(|o| o.labels.get(key).cloned()));
                } else if let Some(defined) = pool.requirements.get(key).and_then(|r| r.values()) {
                    values.extend(defined.iter().cloned());
                }
            }
        }
        Self { universe }
    }

    pub fn with_domains(mut self, key: &str, values: &[&str]) -> Self {
        self.universe
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().map(|v| v.to_string()));
        self
    }

    pub fn domains(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.universe.get(key)
    }

    /// Domains a node could still end up in, per tracked key.
    pub fn node_domains(
        &self,
        hostname: &str,
        reqs: &Requirements,
        options: &[OfferingCandidate],
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut out = BTreeMap::new();
        out.insert(LABEL_HOSTNAME.to_string(), BTreeSet::from([hostname.to_string()]));
        for key in self.universe.keys() {
            out.insert(key.clone(), self.candidates(key, hostname, reqs, options));
        }
        out
    }

    /// Narrow `reqs` so that `pod` on node `hostname` honours its spread,
    /// affinity and anti-affinity constraints and those of placed pods.
    pub fn constrain(
        &self,
        pod: &PodCandidate,
        pod_reqs: &Requirements,
        hostname: &str,
        mut reqs: Requirements,
        options: &[OfferingCandidate],
        placed: &[PlacedPod],
    ) -> PlacementResult<Requirements> {
        for constraint in &pod.topology_spread {
            self.spread(pod, pod_reqs, constraint, hostname, &mut reqs, options, placed)?;
        }
        for term in pod.affinity_terms() {
            self.affinity(pod, term, hostname, &mut reqs, options, placed)?;
        }

        let mut blocked: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut excludes_self: BTreeSet<&str> = BTreeSet::new();
        for term in pod.anti_affinity_terms() {
            if term_matches(term, &pod.namespace, &pod.namespace, &pod.labels) {
                excludes_self.insert(term.topology_key.as_str());
            }
            let entry = blocked.entry(term.topology_key.as_str()).or_default();
            for p in placed
                .iter()
                .filter(|p| term_matches(term, &pod.namespace, &p.namespace, &p.labels))
            {
                entry.extend(p.domains.get(&term.topology_key).into_iter().flatten().cloned());
            }
        }
        // Placed pods whose own anti-affinity selects this pod.
        for p in placed {
            for term in &p.anti_affinity {
                if term_matches(term, &p.namespace, &pod.namespace, &pod.labels) {
                    blocked
                        .entry(term.topology_key.as_str())
                        .or_default()
                        .extend(p.domains.get(&term.topology_key).into_iter().flatten().cloned());
                }
            }
        }
        for (key, blocked) in blocked {
            let mut allowed: BTreeSet<String> = self
                .candidates(key, hostname, &reqs, options)
                .difference(&blocked)
                .cloned()
                .collect();
            // A pod that repels its own kind takes a single domain and leaves
            // the rest to its siblings.
            if key != LABEL_HOSTNAME && excludes_self.contains(key) {
                allowed = allowed.into_iter().take(1).collect();
            }
            restrict(&mut reqs, key, &allowed, hostname, || {
                "every domain holds a pod excluded by anti-affinity".to_string()
            })?;
        }
        Ok(reqs)
    }

    fn candidates(
        &self,
        key: &str,
        hostname: &str,
        reqs: &Requirements,
        options: &[OfferingCandidate],
    ) -> BTreeSet<String> {
        if key == LABEL_HOSTNAME {
            return BTreeSet::from([hostname.to_string()]);
        }
        if is_offering_label(key) {
            let relevant = reqs.filter_keys(is_offering_label);
            return options
                .iter()
                .filter(|o| relevant.satisfies(&o.labels))
                .filter_map(|o| o.labels.get(key).cloned())
                .collect();
        }
        self.universe
            .get(key)
            .into_iter()
            .flatten()
            .filter(|d| reqs.get(key).is_none_or(|r| r.admits(Some(d))))
            .cloned()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn spread(
        &self,
        pod: &PodCandidate,
        pod_reqs: &Requirements,
        constraint: &TopologySpreadConstraint,
        hostname: &str,
        reqs: &mut Requirements,
        options: &[OfferingCandidate],
        placed: &[PlacedPod],
    ) -> PlacementResult<()> {
        let key = constraint.topology_key.as_str();
        let selector = constraint.label_selector.as_ref();
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for p in placed
            .iter()
            .filter(|p| p.namespace == pod.namespace && selector_matches(selector, &p.labels))
        {
            if let Some(domain) = p.single_domain(key) {
                *counts.entry(domain).or_default() += 1;
            }
        }
        let count = |d: &str| counts.get(d).copied().unwrap_or(0);
        let own = i64::from(selector_matches(selector, &pod.labels));
        let max_skew = i64::from(constraint.max_skew);
        let skew_error = || Infeasible::Topology {
            key: key.to_string(),
            detail: format!("would exceed max skew {max_skew}"),
        };

        // New nodes are always possible, so the hostname minimum is zero.
        if key == LABEL_HOSTNAME {
            return if count(hostname) + own <= max_skew {
                Ok(())
            } else {
                Err(skew_error())
            };
        }

        let pod_domains: Vec<&String> = self
            .universe
            .get(key)
            .into_iter()
            .flatten()
            .filter(|d| pod_reqs.get(key).is_none_or(|r| r.admits(Some(d))))
            .collect();
        let mut min = pod_domains.iter().map(|d| count(d.as_str())).min().unwrap_or(0);
        if let Some(min_domains) = constraint.min_domains {
            if (pod_domains.len() as i64) < i64::from(min_domains) {
                min = 0;
            }
        }

        let best = self
            .candidates(key, hostname, reqs, options)
            .into_iter()
            .filter(|d| count(d.as_str()) + own - min <= max_skew)
            .min_by(|a, b| count(a.as_str()).cmp(&count(b.as_str())).then_with(|| a.cmp(b)));
        match best {
            Some(domain) => restrict(reqs, key, &BTreeSet::from([domain]), hostname, String::new),
            None => Err(skew_error()),
        }
    }

    fn affinity(
        &self,
        pod: &PodCandidate,
        term: &PodAffinityTerm,
        hostname: &str,
        reqs: &mut Requirements,
        options: &[OfferingCandidate],
        placed: &[PlacedPod],
    ) -> PlacementResult<()> {
        let key = term.topology_key.as_str();
        let occupied: BTreeSet<String> = placed
            .iter()
            .filter(|p| term_matches(term, &pod.namespace, &p.namespace, &p.labels))
            .filter_map(|p| p.single_domain(key).map(str::to_string))
            .collect();
        let selects_self = term_matches(term, &pod.namespace, &pod.namespace, &pod.labels);
        let detail = || "no domain holds a matching pod".to_string();

        if key == LABEL_HOSTNAME {
            return if occupied.contains(hostname) || (occupied.is_empty() && selects_self) {
                Ok(())
            } else {
                Err(Infeasible::Topology {
                    key: key.to_string(),
                    detail: detail(),
                })
            };
        }

        let candidates = self.candidates(key, hostname, reqs, options);
        let mut allowed: BTreeSet<String> = candidates.intersection(&occupied).cloned().collect();
        // First pod of a self-selecting group picks the first domain; the
        // rest follow it.
        if allowed.is_empty() && occupied.is_empty() && selects_self {
            allowed.extend(candidates.into_iter().next());
        }
        restrict(reqs, key, &allowed, hostname, detail)
    }
}

fn restrict(
    reqs: &mut Requirements,
    key: &str,
    allowed: &BTreeSet<String>,
    hostname: &str,
    detail: impl FnOnce() -> String,
) -> PlacementResult<()> {
    let fail = |detail: String| Infeasible::Topology {
        key: key.to_string(),
        detail: if detail.is_empty() { "no eligible domain".to_string() } else { detail },
    };
    if key == LABEL_HOSTNAME {
        return if allowed.contains(hostname) {
            Ok(())
        } else {
            Err(fail(detail()))
        };
    }
    if allowed.is_empty() {
        return Err(fail(detail()));
    }
    let values: Vec<&str> = allowed.iter().map(String::as_str).collect();
    reqs.add(Requirement::new(key, Operator::In, &values)?);
    reqs.check_feasible()?;
    Ok(())
}
