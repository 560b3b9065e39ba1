//! Requirement algebra over node labels.
//!
//! A [`Requirement`] is the set of label states a key may be in: a value
//! domain plus a flag saying whether the label may be absent. Keeping both
//! parts explicit makes intersection exact, so a label set satisfies `a ∩ b`
//! exactly when it satisfies `a` and `b`.
//!
//! | operator | domain | absent allowed |
//! |---|---|---|
//! | `In v…` | `{v…}` | no |
//! | `NotIn v…` | all but `{v…}` | yes |
//! | `Exists` | all | no |
//! | `DoesNotExist` | `{}` | yes |
//! | `Gt n` / `Lt n` | integers `> n` / `< n` | no |

use crate::labels;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl FromStr for Operator {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            "Gt" => Ok(Operator::Gt),
            "Lt" => Ok(Operator::Lt),
            other => Err(RequirementError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::In => "In",
            Operator::NotIn => "NotIn",
            Operator::Exists => "Exists",
            Operator::DoesNotExist => "DoesNotExist",
            Operator::Gt => "Gt",
            Operator::Lt => "Lt",
        };
        f.write_str(s)
    }
}

/// Wire form of a requirement, as written in NodePools and pod affinity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<i64>,
}

impl NodeSelectorRequirement {
    pub fn new(key: &str, operator: Operator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
            min_values: None,
        }
    }

    pub fn with_min_values(mut self, min_values: i64) -> Self {
        self.min_values = Some(min_values);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequirementError {
    #[error("unknown operator {0:?}")]
    UnknownOperator(String),

    #[error("operator {operator} on {key:?} requires exactly one integer value, got {values:?}")]
    InvalidBound {
        key: String,
        operator: Operator,
        values: Vec<String>,
    },
}

/// A key for which no label state satisfies every constraint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("requirement {key:?} is unsatisfiable: {detail}")]
pub struct Infeasible {
    pub key: String,
    pub detail: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Incompatible {
    #[error("label {0:?} does not have known values")]
    Undefined(String),

    #[error(transparent)]
    Disjoint(#[from] Infeasible),
}

/// How [`Requirements::compatible`] treats keys the receiver does not define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedLabels {
    /// Every key the other side requires must be defined here.
    Deny,
    /// Well-known keys may be undefined; the catalog fills them in.
    AllowWellKnown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Domain {
    Finite(BTreeSet<String>),
    Complement {
        excluded: BTreeSet<String>,
        gt: Option<i64>,
        lt: Option<i64>,
    },
}

impl Domain {
    fn everything() -> Self {
        Domain::Complement {
            excluded: BTreeSet::new(),
            gt: None,
            lt: None,
        }
    }

    fn contains(&self, value: &str) -> bool {
        match self {
            Domain::Finite(values) => values.contains(value),
            Domain::Complement { excluded, gt, lt } => {
                if excluded.contains(value) {
                    return false;
                }
                if gt.is_none() && lt.is_none() {
                    return true;
                }
                let Ok(n) = value.parse::<i64>() else {
                    return false;
                };
                gt.is_none_or(|g| n > g) && lt.is_none_or(|l| n < l)
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Domain::Finite(values) => values.is_empty(),
            Domain::Complement {
                excluded,
                gt: Some(gt),
                lt: Some(lt),
            } => {
                let lo = i128::from(*gt) + 1;
                let hi = i128::from(*lt) - 1;
                if lo > hi {
                    return true;
                }
                // Only canonical spellings exclude an integer: "05" is a
                // different label value from "5".
                let excluded_in_range = excluded
                    .iter()
                    .filter_map(|v| v.parse::<i64>().ok().filter(|n| n.to_string() == *v))
                    .filter(|n| (lo..=hi).contains(&i128::from(*n)))
                    .count();
                hi - lo + 1 <= excluded_in_range as i128
            }
            Domain::Complement { .. } => false,
        }
    }

    fn intersect(&self, other: &Domain) -> Domain {
        match (self, other) {
            (Domain::Finite(a), Domain::Finite(b)) => {
                Domain::Finite(a.intersection(b).cloned().collect())
            }
            (Domain::Finite(values), Domain::Complement { .. }) => filter_finite(values, other),
            (Domain::Complement { .. }, Domain::Finite(values)) => filter_finite(values, self),
            (
                Domain::Complement {
                    excluded: ea,
                    gt: ga,
                    lt: la,
                },
                Domain::Complement {
                    excluded: eb,
                    gt: gb,
                    lt: lb,
                },
            ) => Domain::Complement {
                excluded: ea.union(eb).cloned().collect(),
                gt: tighter(*ga, *gb, i64::max),
                lt: tighter(*la, *lb, i64::min),
            },
        }
    }
}

fn filter_finite(values: &BTreeSet<String>, complement: &Domain) -> Domain {
    Domain::Finite(
        values
            .iter()
            .filter(|v| complement.contains(v))
            .cloned()
            .collect(),
    )
}

fn tighter(a: Option<i64>, b: Option<i64>, pick: fn(i64, i64) -> i64) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

/// Constraint on a single label key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    domain: Domain,
    allows_absent: bool,
    min_values: Option<usize>,
}

impl Requirement {
    pub fn new(key: &str, operator: Operator, values: &[&str]) -> Result<Self, RequirementError> {
        let owned: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Self::build(key, operator, owned)
    }

    fn build(key: &str, operator: Operator, values: Vec<String>) -> Result<Self, RequirementError> {
        let key = labels::normalize_key(key).to_string();
        let bound = |values: &[String]| -> Result<i64, RequirementError> {
            match values {
                [single] => single.parse::<i64>().map_err(|_| RequirementError::InvalidBound {
                    key: key.clone(),
                    operator,
                    values: values.to_vec(),
                }),
                _ => Err(RequirementError::InvalidBound {
                    key: key.clone(),
                    operator,
                    values: values.to_vec(),
                }),
            }
        };

        let (domain, allows_absent) = match operator {
            Operator::In => (Domain::Finite(values.into_iter().collect()), false),
            Operator::NotIn => (
                Domain::Complement {
                    excluded: values.into_iter().collect(),
                    gt: None,
                    lt: None,
                },
                true,
            ),
            Operator::Exists => (Domain::everything(), false),
            Operator::DoesNotExist => (Domain::Finite(BTreeSet::new()), true),
            Operator::Gt => (
                Domain::Complement {
                    excluded: BTreeSet::new(),
                    gt: Some(bound(&values)?),
                    lt: None,
                },
                false,
            ),
            Operator::Lt => (
                Domain::Complement {
                    excluded: BTreeSet::new(),
                    gt: None,
                    lt: Some(bound(&values)?),
                },
                false,
            ),
        };

        Ok(Self {
            key,
            domain,
            allows_absent,
            min_values: None,
        })
    }

    /// `key In [value]`.
    pub fn single(key: &str, value: &str) -> Self {
        Self {
            key: labels::normalize_key(key).to_string(),
            domain: Domain::Finite(BTreeSet::from([value.to_string()])),
            allows_absent: false,
            min_values: None,
        }
    }

    pub fn from_selector(req: &NodeSelectorRequirement) -> Result<Self, RequirementError> {
        let mut out = Self::build(&req.key, req.operator, req.values.clone())?;
        out.min_values = req.min_values.and_then(|m| usize::try_from(m).ok());
        Ok(out)
    }

    pub fn with_min_values(mut self, min_values: usize) -> Self {
        self.min_values = Some(min_values);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn min_values(&self) -> Option<usize> {
        self.min_values
    }

    pub fn allows_absent(&self) -> bool {
        self.allows_absent
    }

    /// Whether a label with this key may hold `value`.
    pub fn has(&self, value: &str) -> bool {
        self.domain.contains(value)
    }

    /// Whether the label state (`None` = label absent) is admitted.
    pub fn admits(&self, value: Option<&str>) -> bool {
        match value {
            Some(v) => self.domain.contains(v),
            None => self.allows_absent,
        }
    }

    /// Explicit values, when the domain is finite.
    pub fn values(&self) -> Option<&BTreeSet<String>> {
        match &self.domain {
            Domain::Finite(values) => Some(values),
            Domain::Complement { .. } => None,
        }
    }

    /// Number of admissible values; unbounded domains report `usize::MAX`.
    pub fn len(&self) -> usize {
        match &self.domain {
            Domain::Finite(values) => values.len(),
            Domain::Complement { .. } if self.domain.is_empty() => 0,
            Domain::Complement { .. } => usize::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_empty()
    }

    /// Some label state exists that satisfies the requirement.
    pub fn is_feasible(&self) -> bool {
        self.allows_absent || !self.domain.is_empty()
    }

    /// The closest single operator. Used for compatibility rules that
    /// depend on how the incoming side was written.
    pub fn operator(&self) -> Operator {
        match (&self.domain, self.allows_absent) {
            (Domain::Finite(values), true) if values.is_empty() => Operator::DoesNotExist,
            (Domain::Finite(_), _) => Operator::In,
            (Domain::Complement { .. }, true) => Operator::NotIn,
            (Domain::Complement { gt: Some(_), .. }, false) => Operator::Gt,
            (Domain::Complement { lt: Some(_), .. }, false) => Operator::Lt,
            (Domain::Complement { .. }, false) => Operator::Exists,
        }
    }

    /// An admissible value, when one can be named.
    pub fn any_value(&self) -> Option<String> {
        match &self.domain {
            Domain::Finite(values) => values.iter().next().cloned(),
            Domain::Complement { excluded, gt, lt } if gt.is_some() || lt.is_some() => {
                let start = gt.map_or(i64::MIN.saturating_add(1), |g| g.saturating_add(1));
                (start..lt.unwrap_or(i64::MAX))
                    .map(|n| n.to_string())
                    .take(excluded.len() + 1)
                    .find(|v| !excluded.contains(v))
            }
            Domain::Complement { .. } => None,
        }
    }

    pub fn intersect(&self, other: &Requirement) -> Requirement {
        debug_assert_eq!(self.key, other.key);
        Requirement {
            key: self.key.clone(),
            domain: self.domain.intersect(&other.domain),
            allows_absent: self.allows_absent && other.allows_absent,
            min_values: match (self.min_values, other.min_values) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Lossless-as-possible wire form. Some intersections (e.g. `Exists` and
    /// `NotIn`) need more than one entry.
    pub fn to_selector(&self) -> Vec<NodeSelectorRequirement> {
        let mut out = Vec::new();
        let entry = |operator: Operator, values: Vec<String>| NodeSelectorRequirement {
            key: self.key.clone(),
            operator,
            values,
            min_values: None,
        };
        match &self.domain {
            Domain::Finite(values) if values.is_empty() && self.allows_absent => {
                out.push(entry(Operator::DoesNotExist, vec![]));
            }
            Domain::Finite(values) => out.push(entry(Operator::In, values.iter().cloned().collect())),
            Domain::Complement { excluded, gt, lt } => {
                if !self.allows_absent && excluded.is_empty() && gt.is_none() && lt.is_none() {
                    out.push(entry(Operator::Exists, vec![]));
                }
                if !excluded.is_empty() {
                    if !self.allows_absent && gt.is_none() && lt.is_none() {
                        out.push(entry(Operator::Exists, vec![]));
                    }
                    out.push(entry(Operator::NotIn, excluded.iter().cloned().collect()));
                }
                if let Some(g) = gt {
                    out.push(entry(Operator::Gt, vec![g.to_string()]));
                }
                if let Some(l) = lt {
                    out.push(entry(Operator::Lt, vec![l.to_string()]));
                }
            }
        }
        if let Some(first) = out.first_mut() {
            first.min_values = self.min_values.map(|m| m as i64);
        }
        out
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .to_selector()
            .iter()
            .map(|r| {
                if r.values.is_empty() {
                    format!("{} {}", r.key, r.operator)
                } else {
                    format!("{} {} [{}]", r.key, r.operator, r.values.join(" "))
                }
            })
            .collect();
        if parts.is_empty() {
            return write!(f, "{} <any>", self.key);
        }
        f.write_str(&parts.join(", "))?;
        if let Some(m) = self.min_values {
            write!(f, " minValues={m}")?;
        }
        Ok(())
    }
}

/// Requirements keyed by label. Adding a requirement for a key that is
/// already present intersects the two.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_selector(reqs: &[NodeSelectorRequirement]) -> Result<Self, RequirementError> {
        let mut out = Self::new();
        for req in reqs {
            out.add(Requirement::from_selector(req)?);
        }
        Ok(out)
    }

    pub fn from_labels<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut out = Self::new();
        for (key, value) in pairs {
            out.add(Requirement::single(key, value));
        }
        out
    }

    pub fn add(&mut self, req: Requirement) {
        match self.0.get_mut(&req.key) {
            Some(existing) => *existing = existing.intersect(&req),
            None => {
                self.0.insert(req.key.clone(), req);
            }
        }
    }

    pub fn add_all(&mut self, other: &Requirements) {
        for req in other.0.values() {
            self.add(req.clone());
        }
    }

    /// Intersection of two requirement sets. Fails on the first key (in key
    /// order) that no label state can satisfy.
    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, Infeasible> {
        let mut out = self.clone();
        out.add_all(other);
        out.check_feasible()?;
        Ok(out)
    }

    pub fn check_feasible(&self) -> Result<(), Infeasible> {
        match self.0.values().find(|r| !r.is_feasible()) {
            Some(req) => Err(Infeasible {
                key: req.key.clone(),
                detail: format!("{req}"),
            }),
            None => Ok(()),
        }
    }

    /// Whether `incoming` (typically a pod's requirements) can be satisfied
    /// on a node built from `self` (typically a NodePool's).
    pub fn compatible(
        &self,
        incoming: &Requirements,
        undefined: UndefinedLabels,
    ) -> Result<(), Incompatible> {
        for (key, req) in &incoming.0 {
            if self.0.contains_key(key) || req.allows_absent {
                continue;
            }
            if undefined == UndefinedLabels::AllowWellKnown && labels::is_well_known(key) {
                continue;
            }
            return Err(Incompatible::Undefined(key.clone()));
        }
        for (key, req) in &incoming.0 {
            if let Some(existing) = self.0.get(key) {
                let joined = existing.intersect(req);
                if !joined.is_feasible() {
                    return Err(Incompatible::Disjoint(Infeasible {
                        key: key.clone(),
                        detail: format!("{existing} conflicts with {req}"),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Whether a node carrying `labels` satisfies every requirement.
    pub fn satisfies(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .values()
            .all(|req| req.admits(labels.get(&req.key).map(String::as_str)))
    }

    /// First requirement `labels` violates, for diagnostics.
    pub fn first_unsatisfied(&self, labels: &BTreeMap<String, String>) -> Option<&Requirement> {
        self.0
            .values()
            .find(|req| !req.admits(labels.get(&req.key).map(String::as_str)))
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The subset of requirements whose key passes `keep`.
    pub fn filter_keys(&self, keep: impl Fn(&str) -> bool) -> Requirements {
        Requirements(
            self.0
                .iter()
                .filter(|(key, _)| keep(key.as_str()))
                .map(|(key, req)| (key.clone(), req.clone()))
                .collect(),
        )
    }

    /// Requirements that carry a `minValues` floor.
    pub fn with_min_values(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0
            .values()
            .filter_map(|r| r.min_values.map(|m| (r.key.as_str(), m)))
    }

    /// Single-valued requirements whose key may be copied onto a node.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0
            .values()
            .filter(|r| !r.allows_absent && labels::is_propagatable(&r.key))
            .filter_map(|r| match r.values() {
                Some(values) if values.len() == 1 => {
                    values.iter().next().map(|v| (r.key.clone(), v.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn to_selector(&self) -> Vec<NodeSelectorRequirement> {
        self.0.values().flat_map(Requirement::to_selector).collect()
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.values().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(", "))
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<I: IntoIterator<Item = Requirement>>(iter: I) -> Self {
        let mut out = Requirements::new();
        for req in iter {
            out.add(req);
        }
        out
    }
}

impl Serialize for Requirements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_selector().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Requirements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<NodeSelectorRequirement>::deserialize(deserializer)?;
        Requirements::from_selector(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str, op: Operator, values: &[&str]) -> Requirement {
        Requirement::new(key, op, values).unwrap()
    }

    fn label_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn operators_admit_expected_states() {
        let in_ab = req("k", Operator::In, &["a", "b"]);
        assert!(in_ab.admits(Some("a")));
        assert!(!in_ab.admits(Some("c")));
        assert!(!in_ab.admits(None));

        let not_in = req("k", Operator::NotIn, &["a"]);
        assert!(not_in.admits(None));
        assert!(not_in.admits(Some("b")));
        assert!(!not_in.admits(Some("a")));

        let exists = req("k", Operator::Exists, &[]);
        assert!(exists.admits(Some("anything")));
        assert!(!exists.admits(None));

        let dne = req("k", Operator::DoesNotExist, &[]);
        assert!(dne.admits(None));
        assert!(!dne.admits(Some("a")));
    }

    #[test]
    fn gt_lt_compare_integers_strictly() {
        let gt = req("mem", Operator::Gt, &["1000"]);
        assert!(gt.admits(Some("1001")));
        assert!(!gt.admits(Some("1000")));
        assert!(!gt.admits(Some("large")));
        assert!(!gt.admits(None));

        let lt = req("mem", Operator::Lt, &["8"]);
        assert!(lt.admits(Some("-3")));
        assert!(!lt.admits(Some("8")));
    }

    #[test]
    fn gt_requires_single_integer() {
        assert!(matches!(
            Requirement::new("k", Operator::Gt, &["1", "2"]),
            Err(RequirementError::InvalidBound { .. })
        ));
        assert!(Requirement::new("k", Operator::Lt, &["x"]).is_err());
        assert!(matches!(
            "within".parse::<Operator>(),
            Err(RequirementError::UnknownOperator(_))
        ));
    }

    #[test]
    fn gt_and_lt_with_no_integer_between_is_infeasible() {
        let joined = req("k", Operator::Gt, &["3"]).intersect(&req("k", Operator::Lt, &["4"]));
        assert!(!joined.is_feasible());

        let joined = req("k", Operator::Gt, &["3"]).intersect(&req("k", Operator::Lt, &["6"]));
        assert!(joined.is_feasible());
        assert_eq!(joined.any_value().as_deref(), Some("4"));

        let excluded = joined.intersect(&req("k", Operator::NotIn, &["4", "5"]));
        assert!(!excluded.is_feasible());
    }

    #[test]
    fn not_in_and_does_not_exist_intersect_on_absence() {
        let joined = req("k", Operator::NotIn, &["a"]).intersect(&req("k", Operator::DoesNotExist, &[]));
        assert!(joined.is_feasible());
        assert!(joined.admits(None));
        assert_eq!(joined.operator(), Operator::DoesNotExist);
    }

    #[test]
    fn intersect_reports_offending_key() {
        let a: Requirements = [req("zone", Operator::In, &["a"]), req("arch", Operator::In, &["amd64"])]
            .into_iter()
            .collect();
        let b: Requirements = [req("zone", Operator::In, &["b"])].into_iter().collect();
        let err = a.intersect(&b).unwrap_err();
        assert_eq!(err.key, "zone");
        assert_eq!(b.intersect(&a).unwrap_err().key, "zone");
    }

    #[test]
    fn min_values_takes_the_larger_floor() {
        let a = req("type", Operator::In, &["a", "b", "c"]).with_min_values(2);
        let b = req("type", Operator::Exists, &[]).with_min_values(3);
        assert_eq!(a.intersect(&b).min_values(), Some(3));
        assert_eq!(b.intersect(&a).min_values(), Some(3));
    }

    #[test]
    fn deprecated_keys_are_normalized() {
        let r = req("failure-domain.beta.kubernetes.io/zone", Operator::In, &["a"]);
        assert_eq!(r.key(), labels::LABEL_TOPOLOGY_ZONE);
    }

    #[test]
    fn compatible_denies_undefined_custom_labels() {
        let pool: Requirements = [req(labels::LABEL_ARCH, Operator::In, &["amd64"])]
            .into_iter()
            .collect();

        let custom: Requirements = [req("team", Operator::In, &["a"])].into_iter().collect();
        assert_eq!(
            pool.compatible(&custom, UndefinedLabels::AllowWellKnown),
            Err(Incompatible::Undefined("team".into()))
        );

        let avoid: Requirements = [req("team", Operator::NotIn, &["a"])].into_iter().collect();
        assert!(pool.compatible(&avoid, UndefinedLabels::AllowWellKnown).is_ok());

        let zone: Requirements = [req(labels::LABEL_TOPOLOGY_ZONE, Operator::In, &["z1"])]
            .into_iter()
            .collect();
        assert!(pool.compatible(&zone, UndefinedLabels::AllowWellKnown).is_ok());
        assert!(pool.compatible(&zone, UndefinedLabels::Deny).is_err());
    }

    #[test]
    fn compatible_rejects_disjoint_values() {
        let pool: Requirements = [req(labels::LABEL_ARCH, Operator::In, &["arm64"])]
            .into_iter()
            .collect();
        let pod: Requirements = [req(labels::LABEL_ARCH, Operator::In, &["amd64"])]
            .into_iter()
            .collect();
        assert!(matches!(
            pool.compatible(&pod, UndefinedLabels::AllowWellKnown),
            Err(Incompatible::Disjoint(_))
        ));
    }

    #[test]
    fn satisfies_checks_absent_labels() {
        let reqs: Requirements = [
            req("zone", Operator::In, &["a", "b"]),
            req("gpu", Operator::DoesNotExist, &[]),
        ]
        .into_iter()
        .collect();
        assert!(reqs.satisfies(&label_map(&[("zone", "a")])));
        assert!(!reqs.satisfies(&label_map(&[("zone", "a"), ("gpu", "t4")])));
        assert!(!reqs.satisfies(&label_map(&[])));
        assert_eq!(reqs.first_unsatisfied(&label_map(&[])).map(|r| r.key()), Some("zone"));
    }

    #[test]
    fn labels_only_returns_single_valued_propagatable_keys() {
        let reqs: Requirements = [
            req("team", Operator::In, &["payments"]),
            req("tier", Operator::In, &["a", "b"]),
            req(labels::LABEL_NODEPOOL, Operator::In, &["default"]),
            req("kubernetes.io/custom", Operator::In, &["x"]),
        ]
        .into_iter()
        .collect();
        let out = reqs.labels();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("team").map(String::as_str), Some("payments"));
    }

    #[test]
    fn serde_round_trips_through_selector_form() {
        let json = r#"[
            {"key": "karpenter.k8s.aws/instance-family", "operator": "In", "values": ["c5", "m5"], "minValues": 2},
            {"key": "karpenter.k8s.aws/instance-cpu", "operator": "Gt", "values": ["2"]}
        ]"#;
        let reqs: Requirements = serde_json::from_str(json).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(
            reqs.get(labels::LABEL_INSTANCE_FAMILY).and_then(|r| r.min_values()),
            Some(2)
        );
        let back: Requirements = serde_json::from_value(serde_json::to_value(&reqs).unwrap()).unwrap();
        assert_eq!(back, reqs);
    }

    #[test]
    fn exists_and_not_in_keeps_both_halves_on_the_wire() {
        let joined = req("k", Operator::Exists, &[]).intersect(&req("k", Operator::NotIn, &["a"]));
        let wire = joined.to_selector();
        assert_eq!(wire.len(), 2);
        let back = Requirements::from_selector(&wire).unwrap();
        assert_eq!(back.get("k"), Some(&joined));
    }
}
