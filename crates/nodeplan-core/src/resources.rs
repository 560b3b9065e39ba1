//! Resource quantities and resource lists.
//!
//! A [`Quantity`] is stored as a signed count of milli-units, which is exact
//! for CPU (`250m`) and for byte counts up to several exabytes. Parsing accepts
//! the Kubernetes suffix grammar (`m`, decimal `k M G T P E`, binary
//! `Ki Mi Gi Ti Pi Ei`).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;
use thiserror::Error;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";
pub const AMD_GPU: &str = "amd.com/gpu";
pub const AWS_NEURON: &str = "aws.amazon.com/neuron";
pub const HABANA_GAUDI: &str = "habana.ai/gaudi";
pub const EFA: &str = "vpc.amazonaws.com/efa";
pub const POD_ENI: &str = "vpc.amazonaws.com/pod-eni";

const KI: i64 = 1024;
const MI: i64 = KI * 1024;
const GI: i64 = MI * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity number: {0:?}")]
    InvalidNumber(String),

    #[error("unknown quantity suffix: {0:?}")]
    UnknownSuffix(String),

    #[error("quantity out of range: {0:?}")]
    Overflow(String),
}

/// A resource amount in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    pub const fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(1000))
    }

    pub const fn from_mebibytes(mib: i64) -> Self {
        Quantity::from_units(mib.saturating_mul(MI))
    }

    pub const fn from_gibibytes(gib: i64) -> Self {
        Quantity::from_units(gib.saturating_mul(GI))
    }

    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        let valid = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !valid(int_part)
            || !valid(frac_part)
            || int_part.len() + frac_part.len() > 30
        {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }

        let factor: i128 = match suffix {
            "" => 1000,
            "m" => 1,
            "k" => 1_000_000,
            "M" => 1_000_000_000,
            "G" => 1_000_000_000_000,
            "T" => 1_000_000_000_000_000,
            "P" => 1_000_000_000_000_000_000,
            "E" => 1_000_000_000_000_000_000_000,
            "Ki" => 1000 * (KI as i128),
            "Mi" => 1000 * (MI as i128),
            "Gi" => 1000 * (GI as i128),
            "Ti" => 1000 * (GI as i128) * 1024,
            "Pi" => 1000 * (GI as i128) * 1024 * 1024,
            "Ei" => 1000 * (GI as i128) * 1024 * 1024 * 1024,
            other => return Err(QuantityError::UnknownSuffix(other.to_string())),
        };

        let mut mantissa: i128 = 0;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa * 10 + i128::from(b - b'0');
        }
        let scale = 10i128.pow(frac_part.len() as u32);
        let scaled = mantissa
            .checked_mul(factor)
            .ok_or_else(|| QuantityError::Overflow(input.to_string()))?;
        // Sub-milli precision rounds up, like the apiserver.
        let milli = (scaled + scale - 1) / scale;
        let milli = if negative { -milli } else { milli };
        let milli = i64::try_from(milli).map_err(|_| QuantityError::Overflow(input.to_string()))?;
        Ok(Quantity(milli))
    }

    pub const fn as_milli(&self) -> i64 {
        self.0
    }

    /// Whole units, rounded up.
    pub fn value(&self) -> i64 {
        self.0.div_euclid(1000) + i64::from(self.0.rem_euclid(1000) != 0)
    }

    /// Whole mebibytes, rounded down.
    pub fn as_mebibytes(&self) -> i64 {
        self.0 / 1000 / MI
    }

    /// Whole gibibytes, rounded up.
    pub fn as_gibibytes_ceil(&self) -> i64 {
        let bytes = self.value();
        bytes / GI + i64::from(bytes % GI != 0)
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    pub fn scale(self, factor: f64) -> Quantity {
        Quantity((self.0 as f64 * factor).round() as i64)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 != 0 {
            return write!(f, "{}m", self.0);
        }
        let units = self.0 / 1000;
        if units != 0 && units % GI == 0 {
            write!(f, "{}Gi", units / GI)
        } else if units != 0 && units % MI == 0 {
            write!(f, "{}Mi", units / MI)
        } else {
            write!(f, "{units}")
        }
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a resource quantity such as \"500m\", \"2Gi\" or 4")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                Quantity::parse(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                i64::try_from(v)
                    .map(Quantity::from_units)
                    .map_err(|_| E::custom("quantity out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> {
                Ok(Quantity((v * 1000.0).ceil() as i64))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// Named resource amounts, e.g. a pod's requests or a node's allocatable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, quantity: Quantity) -> Self {
        self.0.insert(name.to_string(), quantity);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    /// Amount of `name`; missing resources count as zero.
    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Per-resource sum.
    pub fn add(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    pub fn add_assign(&mut self, other: &ResourceList) {
        for (name, qty) in other.iter() {
            *self.0.entry(name.to_string()).or_default() += qty;
        }
    }

    /// Per-resource maximum.
    pub fn max(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, qty) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_default();
            if qty > *entry {
                *entry = qty;
            }
        }
        out
    }

    /// Per-resource difference, floored at zero.
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, qty) in other.iter() {
            if let Some(entry) = out.0.get_mut(name) {
                *entry = if *entry > qty { *entry - qty } else { Quantity::ZERO };
            }
        }
        out
    }

    /// Whether every positive request in `self` fits in `available`.
    pub fn fits(&self, available: &ResourceList) -> bool {
        self.first_exceeding(available).is_none()
    }

    /// First resource whose amount in `self` is above the amount in `bound`.
    pub fn first_exceeding(&self, bound: &ResourceList) -> Option<&str> {
        self.iter()
            .find(|(name, qty)| !qty.is_zero() && *qty > bound.get(name))
            .map(|(name, _)| name)
    }

    /// Like [`first_exceeding`](Self::first_exceeding), but only resources
    /// named in `limits` are constrained.
    pub fn first_exceeding_limits<'a>(&self, limits: &'a ResourceList) -> Option<&'a str> {
        limits
            .iter()
            .find(|(name, limit)| self.get(name) > *limit)
            .map(|(name, _)| name)
    }
}

impl<const N: usize> From<[(&str, Quantity); N]> for ResourceList {
    fn from(pairs: [(&str, Quantity); N]) -> Self {
        ResourceList(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn exceeded_limit_name_outlives_usage() {
        let limits = ResourceList::new()
            .with(CPU, Quantity::from_units(8))
            .with(MEMORY, q("32Gi"));
        let exceeded = {
            let usage = ResourceList::new()
                .with(CPU, Quantity::from_units(4))
                .with(MEMORY, q("64Gi"))
                .with(NVIDIA_GPU, Quantity::from_units(2));
            usage.first_exceeding_limits(&limits)
        };
        assert_eq!(exceeded, Some(MEMORY));

        let within = ResourceList::new().with(CPU, Quantity::from_units(8));
        assert_eq!(within.first_exceeding_limits(&limits), None);
    }

    #[test]
    fn parse_cpu_forms() {
        assert_eq!(q("250m").as_milli(), 250);
        assert_eq!(q("1").as_milli(), 1000);
        assert_eq!(q("1.5").as_milli(), 1500);
        assert_eq!(q("0.1").as_milli(), 100);
    }

    #[test]
    fn parse_memory_forms() {
        assert_eq!(q("1Gi").value(), 1 << 30);
        assert_eq!(q("512Mi").as_mebibytes(), 512);
        assert_eq!(q("1G").value(), 1_000_000_000);
        assert_eq!(q("10k").value(), 10_000);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Quantity::parse(""), Err(QuantityError::Empty));
        assert!(matches!(Quantity::parse("abc"), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(Quantity::parse("1Xi"), Err(QuantityError::UnknownSuffix(_))));
        assert!(matches!(Quantity::parse("1."), Ok(_)));
        assert!(matches!(Quantity::parse("99999E"), Err(QuantityError::Overflow(_))));
    }

    #[test]
    fn gibibytes_round_up() {
        assert_eq!(q("10G").as_gibibytes_ceil(), 10);
        assert_eq!(q("20Gi").as_gibibytes_ceil(), 20);
        assert_eq!(q("1").as_gibibytes_ceil(), 1);
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("2048Mi").to_string(), "2Gi");
        assert_eq!(q("100Mi").to_string(), "100Mi");
    }

    #[test]
    fn resource_list_arithmetic() {
        let a = ResourceList::from([(CPU, q("1")), (MEMORY, q("1Gi"))]);
        let b = ResourceList::from([(CPU, q("500m")), (PODS, q("1"))]);

        let sum = a.add(&b);
        assert_eq!(sum.get(CPU), q("1500m"));
        assert_eq!(sum.get(PODS), q("1"));

        let max = a.max(&b);
        assert_eq!(max.get(CPU), q("1"));
        assert_eq!(max.get(PODS), q("1"));

        let diff = b.saturating_sub(&a);
        assert_eq!(diff.get(CPU), Quantity::ZERO);
    }

    #[test]
    fn fits_ignores_zero_requests() {
        let request = ResourceList::from([(CPU, q("1")), (NVIDIA_GPU, Quantity::ZERO)]);
        let node = ResourceList::from([(CPU, q("2"))]);
        assert!(request.fits(&node));

        let gpu = ResourceList::from([(NVIDIA_GPU, q("1"))]);
        assert_eq!(gpu.first_exceeding(&node), Some(NVIDIA_GPU));
    }

    #[test]
    fn limits_only_constrain_named_resources() {
        let usage = ResourceList::from([(CPU, q("8")), (MEMORY, q("64Gi"))]);
        let limits = ResourceList::from([(CPU, q("16"))]);
        assert_eq!(usage.first_exceeding_limits(&limits), None);

        let tight = ResourceList::from([(CPU, q("4"))]);
        assert_eq!(usage.first_exceeding_limits(&tight), Some(CPU));
    }

    #[test]
    fn serde_accepts_strings_and_numbers() {
        let list: ResourceList = serde_json::from_str(r#"{"cpu": 2, "memory": "4Gi"}"#).unwrap();
        assert_eq!(list.get(CPU), q("2"));
        assert_eq!(list.get(MEMORY), q("4Gi"));
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, r#"{"cpu":"2","memory":"4Gi"}"#);
    }
}
