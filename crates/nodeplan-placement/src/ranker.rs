//! NodePool selection.
//!
//! A pool is eligible for a pod when the pod tolerates the pool's taints,
//! the pool's requirements are compatible with one of the pod's required
//! alternatives, and at least one offering in the pool's catalog satisfies
//! the joined requirements and has room for the pod. Eligible pools are
//! ranked by weight (descending), creation time, then name.

use crate::convert::PodCandidate;
use crate::error::{Infeasible, PlacementResult};
use nodeplan_api::NodePool;
use nodeplan_api::pod::untolerated;
use nodeplan_catalog::Catalog;
use nodeplan_core::{RequirementError, Requirements, ResourceList, UndefinedLabels};
use std::sync::Arc;
use tracing::debug;

/// A NodePool resolved for one pass: parsed requirements, its catalog, and
/// the capacity it already has running.
#[derive(Debug, Clone)]
pub struct PoolOption {
    pub pool: Arc<NodePool>,
    pub requirements: Requirements,
    pub catalog: Arc<Catalog>,
    pub usage: ResourceList,
}

impl PoolOption {
    pub fn new(pool: NodePool, catalog: Arc<Catalog>, usage: ResourceList) -> Result<Self, RequirementError> {
        let requirements = pool.requirements()?;
        Ok(Self {
            pool: Arc::new(pool),
            requirements,
            catalog,
            usage,
        })
    }

    pub fn name(&self) -> &str {
        &self.pool.name
    }
}

/// Why `pool` cannot run `pod`, if it cannot.
pub fn eligible(pod: &PodCandidate, pool: &PoolOption) -> PlacementResult<()> {
    if let Some(taint) = untolerated(&pool.pool.template.taints, &pod.tolerations) {
        let value = taint.value.as_deref().unwrap_or("");
        return Err(Infeasible::UntoleratedTaint(format!(
            "{}={}:{:?}",
            taint.key, value, taint.effect
        )));
    }

    let mut last = Infeasible::NoOffering(pool.requirements.to_string());
    for alternative in pod.strict_alternatives() {
        if let Err(e) = pool.requirements.compatible(&alternative, UndefinedLabels::AllowWellKnown) {
            last = e.into();
            continue;
        }
        let joined = match pool.requirements.intersect(&alternative) {
            Ok(joined) => joined,
            Err(e) => {
                last = e.into();
                continue;
            }
        };
        let offerings = pool.catalog.query(&joined);
        if offerings.is_empty() {
            last = Infeasible::NoOffering(joined.to_string());
            continue;
        }
        match offerings
            .iter()
            .find(|c| pod.requests.fits(c.instance_type.allocatable()))
        {
            Some(_) => return Ok(()),
            None => {
                let resource = offerings
                    .iter()
                    .filter_map(|c| pod.requests.first_exceeding(c.instance_type.allocatable()))
                    .next()
                    .unwrap_or("resources");
                last = Infeasible::Resources(resource.to_string());
            }
        }
    }
    Err(last)
}

/// Eligible pools for `pod`, best first.
pub fn rank<'a>(pod: &PodCandidate, pools: &'a [PoolOption]) -> PlacementResult<Vec<&'a PoolOption>> {
    let mut ranked = Vec::new();
    let mut reasons = Vec::new();
    for pool in pools {
        match eligible(pod, pool) {
            Ok(()) => ranked.push(pool),
            Err(e) => {
                debug!(pod = %pod.id(), nodepool = %pool.name(), reason = %e, "nodepool not eligible");
                reasons.push(format!("{}: {e}", pool.name()));
            }
        }
    }
    if ranked.is_empty() {
        if reasons.is_empty() {
            reasons.push("no nodepools".to_string());
        }
        return Err(Infeasible::NoNodePool(reasons.join("; ")));
    }
    ranked.sort_by(|a, b| {
        b.pool
            .weight()
            .cmp(&a.pool.weight())
            .then_with(|| a.pool.created_at.cmp(&b.pool.created_at))
            .then_with(|| a.pool.name.cmp(&b.pool.name))
    });
    Ok(ranked)
}

/// The pool `pod` should be provisioned from.
pub fn select<'a>(pod: &PodCandidate, pools: &'a [PoolOption]) -> PlacementResult<&'a PoolOption> {
    rank(pod, pools)?
        .into_iter()
        .next()
        .ok_or_else(|| Infeasible::NoNodePool("no nodepools".to_string()))
}
