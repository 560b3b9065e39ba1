//! Admission validation for NodePools and NodeClasses.
//!
//! Validation collects every problem with an object instead of stopping at
//! the first one, so a caller can report them together. Invalid objects are
//! never retried; they must be fixed and resubmitted.

use crate::nodeclass::{KubeletConfiguration, MetadataOptions, NodeClass, SelectorTerm};
use crate::nodepool::{ConsolidationPolicy, NodePool};
use nodeplan_core::labels::{self, LABEL_NODECLASS, LABEL_NODEPOOL};
use nodeplan_core::{Operator, Quantity};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Tag keys the provisioner writes itself.
pub const RESTRICTED_TAG_KEYS: &[&str] = &[
    LABEL_NODEPOOL,
    "karpenter.sh/nodeclaim",
    "karpenter.sh/managed-by",
    LABEL_NODECLASS,
    "eks:eks-cluster-name",
];

const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

const EVICTION_SIGNALS: &[&str] = &[
    "memory.available",
    "nodefs.available",
    "nodefs.inodesFree",
    "imagefs.available",
    "imagefs.inodesFree",
    "pid.available",
];

const RESERVED_RESOURCES: &[&str] = &["cpu", "memory", "ephemeral-storage", "pid"];

const MAX_MIN_VALUES: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every problem found with one object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} {name:?} is invalid: {}", format_errors(.errors))]
pub struct ValidationErrors {
    pub kind: &'static str,
    pub name: String,
    pub errors: Vec<FieldError>,
}

fn format_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors>;
}

#[derive(Default)]
struct Collector {
    errors: Vec<FieldError>,
}

impl Collector {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn finish(self, kind: &'static str, name: &str) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                kind,
                name: name.to_string(),
                errors: self.errors,
            })
        }
    }
}

// ── NodePool ───────────────────────────────────────────────────────

impl Validate for NodePool {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut c = Collector::default();

        if self.name.is_empty() {
            c.push("name", "must not be empty");
        }
        if let Some(weight) = self.weight {
            if !(1..=100).contains(&weight) {
                c.push("weight", format!("must be between 1 and 100, got {weight}"));
            }
        }

        for key in self.template.labels.keys() {
            if let Err(e) = labels::check_label_key(key) {
                c.push(format!("template.labels[{key}]"), e.to_string());
            }
        }

        for (i, req) in self.template.requirements.iter().enumerate() {
            let field = format!("template.requirements[{i}]");
            if let Err(e) = labels::check_label_key(&req.key) {
                c.push(format!("{field}.key"), e.to_string());
            }
            match req.operator {
                Operator::In | Operator::NotIn if req.values.is_empty() => {
                    c.push(format!("{field}.values"), format!("operator {} requires at least one value", req.operator));
                }
                Operator::Exists | Operator::DoesNotExist if !req.values.is_empty() => {
                    c.push(format!("{field}.values"), format!("operator {} takes no values", req.operator));
                }
                Operator::Gt | Operator::Lt => {
                    let single_int = matches!(req.values.as_slice(), [v] if v.parse::<i64>().is_ok_and(|n| n >= 0));
                    if !single_int {
                        c.push(
                            format!("{field}.values"),
                            format!("operator {} requires exactly one non-negative integer value", req.operator),
                        );
                    }
                }
                _ => {}
            }
            if let Some(min) = req.min_values {
                if !(1..=MAX_MIN_VALUES).contains(&min) {
                    c.push(format!("{field}.minValues"), format!("must be between 1 and {MAX_MIN_VALUES}, got {min}"));
                } else if req.operator == Operator::In && min as usize > unique(&req.values) {
                    c.push(
                        format!("{field}.minValues"),
                        format!("must be at most the number of values ({}), got {min}", unique(&req.values)),
                    );
                }
            }
        }

        let mut seen = BTreeSet::new();
        for (i, taint) in self.template.taints.iter().chain(&self.template.startup_taints).enumerate() {
            if taint.key.is_empty() {
                c.push(format!("template.taints[{i}].key"), "must not be empty");
            }
            if !seen.insert((taint.key.as_str(), taint.effect)) {
                c.push(format!("template.taints[{i}]"), format!("duplicate taint {}:{:?}", taint.key, taint.effect));
            }
        }

        match (self.disruption.consolidation_policy, self.disruption.consolidate_after) {
            (ConsolidationPolicy::WhenUnderutilized, Some(_)) => {
                c.push(
                    "disruption.consolidateAfter",
                    "cannot be combined with consolidationPolicy=WhenUnderutilized",
                );
            }
            (_, Some(after)) if after.is_negative() => {
                c.push("disruption.consolidateAfter", "must not be negative");
            }
            _ => {}
        }
        if self.disruption.expire_after.is_some_and(|d| d.is_negative()) {
            c.push("disruption.expireAfter", "must not be negative");
        }

        for (name, qty) in self.limits.iter() {
            if qty < Quantity::ZERO {
                c.push(format!("limits[{name}]"), "must not be negative");
            }
        }

        if let Some(kubelet) = &self.template.kubelet {
            validate_kubelet(kubelet, "template.kubelet", &mut c);
        }

        c.finish("NodePool", &self.name)
    }
}

fn unique(values: &[String]) -> usize {
    values.iter().collect::<BTreeSet<_>>().len()
}

// ── NodeClass ──────────────────────────────────────────────────────

impl Validate for NodeClass {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut c = Collector::default();

        if self.name.is_empty() {
            c.push("name", "must not be empty");
        }

        if self.subnet_selector_terms.is_empty() {
            c.push("subnetSelectorTerms", "must have at least one term");
        }
        if self.security_group_selector_terms.is_empty() {
            c.push("securityGroupSelectorTerms", "must have at least one term");
        }
        validate_terms(&self.subnet_selector_terms, "subnetSelectorTerms", "subnet-", &mut c);
        validate_terms(&self.security_group_selector_terms, "securityGroupSelectorTerms", "sg-", &mut c);
        validate_terms(&self.ami_selector_terms, "amiSelectorTerms", "ami-", &mut c);

        if self.ami_family() == crate::nodeclass::AmiFamily::Custom && self.ami_selector_terms.is_empty() {
            c.push("amiSelectorTerms", "must be set when amiFamily is Custom");
        }

        match (&self.role, &self.instance_profile) {
            (Some(_), Some(_)) => c.push("role", "role and instanceProfile are mutually exclusive"),
            (None, None) => c.push("role", "one of role or instanceProfile is required"),
            (Some(role), None) if role.is_empty() => c.push("role", "must not be empty"),
            (None, Some(profile)) if profile.is_empty() => c.push("instanceProfile", "must not be empty"),
            _ => {}
        }

        for key in self.tags.keys() {
            if key.is_empty() {
                c.push("tags", "tag keys must not be empty");
            } else if is_restricted_tag(key) {
                c.push(format!("tags[{key}]"), "tag key is restricted");
            }
        }

        let roots = self.block_device_mappings.iter().filter(|b| b.root_volume).count();
        if roots > 1 {
            c.push("blockDeviceMappings", "at most one mapping may be the root volume");
        }
        for (i, bdm) in self.block_device_mappings.iter().enumerate() {
            if bdm.device_name.is_empty() {
                c.push(format!("blockDeviceMappings[{i}].deviceName"), "must not be empty");
            }
            if let Some(size) = bdm.ebs.volume_size {
                if size < Quantity::from_gibibytes(1) || size > Quantity::from_gibibytes(64 * 1024) {
                    c.push(format!("blockDeviceMappings[{i}].ebs.volumeSize"), format!("must be between 1Gi and 64Ti, got {size}"));
                }
            }
            if bdm.ebs.snapshot_id.is_none() && bdm.ebs.volume_size.is_none() {
                c.push(format!("blockDeviceMappings[{i}].ebs"), "one of volumeSize or snapshotID is required");
            }
        }

        if let Some(kubelet) = &self.kubelet {
            validate_kubelet(kubelet, "kubelet", &mut c);
        }
        if let Some(opts) = &self.metadata_options {
            validate_metadata_options(opts, &mut c);
        }

        c.finish("NodeClass", &self.name)
    }
}

impl NodeClass {
    /// Validation for a change from `old` to `self`. The identity mode
    /// (managed role vs. unmanaged instance profile) cannot be switched.
    pub fn validate_update(&self, old: &NodeClass) -> Result<(), ValidationErrors> {
        self.validate()?;
        let mut c = Collector::default();
        if old.role.is_some() && self.instance_profile.is_some() {
            c.push("instanceProfile", "changing from role to instanceProfile is not supported");
        }
        if old.instance_profile.is_some() && self.role.is_some() {
            c.push("role", "changing from instanceProfile to role is not supported");
        }
        c.finish("NodeClass", &self.name)
    }
}

pub fn is_restricted_tag(key: &str) -> bool {
    if RESTRICTED_TAG_KEYS.contains(&key) {
        return true;
    }
    match key.strip_prefix(CLUSTER_TAG_PREFIX) {
        Some(cluster) => {
            let mut chars = cluster.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        None => false,
    }
}

fn validate_terms(terms: &[SelectorTerm], field: &str, id_prefix: &str, c: &mut Collector) {
    for (i, term) in terms.iter().enumerate() {
        let field = format!("{field}[{i}]");
        let has_other = !term.tags.is_empty() || term.name.is_some() || term.owner.is_some();
        match &term.id {
            Some(_) if has_other => c.push(&field, "id cannot be combined with tags, name or owner"),
            Some(id) if !id.starts_with(id_prefix) => {
                c.push(format!("{field}.id"), format!("must start with {id_prefix:?}, got {id:?}"));
            }
            None if !has_other => c.push(&field, "must specify id, tags, name or owner"),
            _ => {}
        }
        for (key, value) in &term.tags {
            if key.is_empty() || value.is_empty() {
                c.push(format!("{field}.tags"), "tag keys and values must not be empty");
            }
        }
    }
}

fn validate_kubelet(kubelet: &KubeletConfiguration, field: &str, c: &mut Collector) {
    let high = kubelet.image_gc_high_threshold_percent;
    let low = kubelet.image_gc_low_threshold_percent;
    for (name, value) in [("imageGCHighThresholdPercent", high), ("imageGCLowThresholdPercent", low)] {
        if let Some(v) = value {
            if !(0..=100).contains(&v) {
                c.push(format!("{field}.{name}"), format!("must be between 0 and 100, got {v}"));
            }
        }
    }
    if let (Some(high), Some(low)) = (high, low) {
        if high <= low {
            c.push(
                format!("{field}.imageGCHighThresholdPercent"),
                "must be greater than imageGCLowThresholdPercent",
            );
        }
    }

    if kubelet.max_pods.is_some_and(|m| m < 0) {
        c.push(format!("{field}.maxPods"), "must not be negative");
    }
    if kubelet.pods_per_core.is_some_and(|m| m < 0) {
        c.push(format!("{field}.podsPerCore"), "must not be negative");
    }

    for (section, reserved) in [("kubeReserved", &kubelet.kube_reserved), ("systemReserved", &kubelet.system_reserved)] {
        for (name, qty) in reserved.iter() {
            if !RESERVED_RESOURCES.contains(&name) {
                c.push(format!("{field}.{section}[{name}]"), "unsupported resource");
            } else if qty < Quantity::ZERO {
                c.push(format!("{field}.{section}[{name}]"), "must not be negative");
            }
        }
    }

    for (signal, threshold) in &kubelet.eviction_hard {
        if !EVICTION_SIGNALS.contains(&signal.as_str()) {
            c.push(format!("{field}.evictionHard[{signal}]"), "unsupported eviction signal");
            continue;
        }
        if parse_threshold(threshold).is_none() {
            c.push(
                format!("{field}.evictionHard[{signal}]"),
                format!("invalid threshold {threshold:?}; expected a quantity or a percentage"),
            );
        }
    }
}

/// An eviction threshold: an absolute quantity or a percentage of capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Quantity(Quantity),
    Percent(f64),
}

pub fn parse_threshold(raw: &str) -> Option<Threshold> {
    match raw.trim().strip_suffix('%') {
        Some(pct) => pct
            .parse::<f64>()
            .ok()
            .filter(|p| (0.0..=100.0).contains(p))
            .map(Threshold::Percent),
        None => Quantity::parse(raw)
            .ok()
            .filter(|q| *q >= Quantity::ZERO)
            .map(Threshold::Quantity),
    }
}

fn validate_metadata_options(opts: &MetadataOptions, c: &mut Collector) {
    if !matches!(opts.http_endpoint.as_str(), "enabled" | "disabled") {
        c.push("metadataOptions.httpEndpoint", "must be enabled or disabled");
    }
    if !matches!(opts.http_protocol_ipv6.as_str(), "enabled" | "disabled") {
        c.push("metadataOptions.httpProtocolIPv6", "must be enabled or disabled");
    }
    if !(1..=64).contains(&opts.http_put_response_hop_limit) {
        c.push("metadataOptions.httpPutResponseHopLimit", "must be between 1 and 64");
    }
    if !matches!(opts.http_tokens.as_str(), "required" | "optional") {
        c.push("metadataOptions.httpTokens", "must be required or optional");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeclass::{AmiFamily, BlockDevice, BlockDeviceMapping};
    use nodeplan_core::{NillableDuration, NodeSelectorRequirement};

    fn make_pool() -> NodePool {
        let mut pool = NodePool::new("default", "default");
        pool.template.requirements.push(NodeSelectorRequirement::new(
            labels::LABEL_INSTANCE_TYPE,
            Operator::In,
            &["c4.large", "c4.xlarge"],
        ));
        pool
    }

    fn make_node_class() -> NodeClass {
        let mut nc = NodeClass::new("default");
        nc.role = Some("KarpenterNodeRole".into());
        nc.subnet_selector_terms = vec![SelectorTerm::tags(&[("karpenter.sh/discovery", "demo")])];
        nc.security_group_selector_terms = vec![SelectorTerm::tags(&[("karpenter.sh/discovery", "demo")])];
        nc
    }

    fn pool_with_requirement(req: NodeSelectorRequirement) -> NodePool {
        let mut pool = make_pool();
        pool.template.requirements = vec![req];
        pool
    }

    #[test]
    fn valid_objects_pass() {
        assert!(make_pool().validate().is_ok());
        assert!(make_node_class().validate().is_ok());
    }

    #[test]
    fn restricted_labels_are_rejected() {
        let mut pool = make_pool();
        pool.template.labels.insert(LABEL_NODEPOOL.into(), "mine".into());
        assert!(pool.validate().is_err());

        let mut pool = make_pool();
        pool.template.labels.insert("kubernetes.io/custom-label".into(), "v".into());
        assert!(pool.validate().is_err());

        let mut pool = make_pool();
        pool.template
            .labels
            .insert("subdomain.node-restriction.kubernetes.io/custom-label".into(), "v".into());
        assert!(pool.validate().is_ok());

        let pool = pool_with_requirement(NodeSelectorRequirement::new(LABEL_NODEPOOL, Operator::In, &["default"]));
        let err = pool.validate().unwrap_err();
        assert!(err.has_field("template.requirements[0].key"));
    }

    #[test]
    fn operator_value_shapes() {
        let pool = pool_with_requirement(NodeSelectorRequirement::new(labels::LABEL_INSTANCE_TYPE, Operator::In, &[]));
        assert!(pool.validate().is_err());

        let pool = pool_with_requirement(NodeSelectorRequirement::new(
            labels::LABEL_INSTANCE_MEMORY,
            Operator::Gt,
            &["1000000", "2000000"],
        ));
        assert!(pool.validate().is_err());

        let pool = pool_with_requirement(NodeSelectorRequirement::new(labels::LABEL_INSTANCE_MEMORY, Operator::Lt, &["8192"]));
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn min_values_bounds() {
        let base = NodeSelectorRequirement::new(labels::LABEL_INSTANCE_TYPE, Operator::In, &["c4.large", "c4.xlarge"]);
        for bad in [-1, 0, 101, 3] {
            let pool = pool_with_requirement(base.clone().with_min_values(bad));
            assert!(pool.validate().is_err(), "minValues {bad} should be rejected");
        }
        let pool = pool_with_requirement(base.with_min_values(2));
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn consolidation_rules() {
        let mut pool = make_pool();
        pool.disruption.consolidation_policy = ConsolidationPolicy::WhenUnderutilized;
        pool.disruption.consolidate_after = Some(NillableDuration::Seconds(60));
        assert!(pool.validate().is_err());

        let mut pool = make_pool();
        pool.disruption.consolidation_policy = ConsolidationPolicy::WhenEmpty;
        pool.disruption.consolidate_after = Some(NillableDuration::Seconds(-1));
        assert!(pool.validate().is_err());

        pool.disruption.consolidate_after = Some(NillableDuration::Never);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn image_gc_thresholds() {
        let mut pool = make_pool();
        pool.template.kubelet = Some(KubeletConfiguration {
            image_gc_high_threshold_percent: Some(10),
            image_gc_low_threshold_percent: Some(60),
            ..Default::default()
        });
        assert!(pool.validate().is_err());

        let mut nc = make_node_class();
        nc.kubelet = Some(KubeletConfiguration {
            image_gc_low_threshold_percent: Some(-10),
            ..Default::default()
        });
        assert!(nc.validate().is_err());
    }

    #[test]
    fn eviction_thresholds() {
        assert_eq!(parse_threshold("10%"), Some(Threshold::Percent(10.0)));
        assert_eq!(parse_threshold("100Mi"), Some(Threshold::Quantity(Quantity::from_mebibytes(100))));
        assert_eq!(parse_threshold("150%"), None);

        let mut nc = make_node_class();
        let mut kubelet = KubeletConfiguration::default();
        kubelet.eviction_hard.insert("memory.available".into(), "lots".into());
        nc.kubelet = Some(kubelet);
        assert!(nc.validate().is_err());
    }

    #[test]
    fn custom_family_requires_ami_terms() {
        let mut nc = make_node_class();
        nc.ami_family = Some(AmiFamily::Custom);
        assert!(nc.validate().unwrap_err().has_field("amiSelectorTerms"));

        nc.ami_selector_terms = vec![SelectorTerm::id("ami-0123456789")];
        assert!(nc.validate().is_ok());
    }

    #[test]
    fn selector_term_shapes() {
        let mut nc = make_node_class();
        nc.ami_selector_terms = vec![SelectorTerm::id("must-start-with-ami")];
        assert!(nc.validate().is_err());

        let mut nc = make_node_class();
        let mut term = SelectorTerm::id("subnet-123");
        term.tags.insert("Name".into(), "private".into());
        nc.subnet_selector_terms = vec![term];
        assert!(nc.validate().is_err());

        let mut nc = make_node_class();
        nc.security_group_selector_terms = vec![SelectorTerm::default()];
        assert!(nc.validate().is_err());
    }

    #[test]
    fn restricted_tags() {
        let mut nc = make_node_class();
        nc.tags.insert("karpenter.sh/custom-key".into(), "v".into());
        nc.tags.insert("kubernetes.io/role/key".into(), "v".into());
        assert!(nc.validate().is_ok());

        for key in ["karpenter.sh/nodepool", "kubernetes.io/cluster/my-cluster", "karpenter.sh/managed-by"] {
            let mut nc = make_node_class();
            nc.tags.insert(key.into(), "v".into());
            assert!(nc.validate().is_err(), "tag {key} should be restricted");
        }
    }

    #[test]
    fn role_xor_instance_profile() {
        let mut nc = make_node_class();
        nc.instance_profile = Some("profile".into());
        assert!(nc.validate().is_err());

        nc.role = None;
        nc.instance_profile = None;
        assert!(nc.validate().is_err());
    }

    #[test]
    fn identity_mode_cannot_switch_on_update() {
        let old = make_node_class();
        let mut new = old.clone();
        new.role = None;
        new.instance_profile = Some("profile".into());
        assert!(new.validate().is_ok());
        assert!(new.validate_update(&old).is_err());

        let mut renamed = old.clone();
        renamed.role = Some("OtherRole".into());
        assert!(renamed.validate_update(&old).is_ok());
    }

    #[test]
    fn block_device_rules() {
        let mut nc = make_node_class();
        let root = BlockDeviceMapping {
            device_name: "/dev/xvda".into(),
            ebs: BlockDevice {
                volume_size: Some(Quantity::from_gibibytes(20)),
                ..Default::default()
            },
            root_volume: true,
        };
        nc.block_device_mappings = vec![root.clone(), root];
        assert!(nc.validate().is_err());

        let mut nc = make_node_class();
        nc.block_device_mappings = vec![BlockDeviceMapping {
            device_name: "/dev/xvda".into(),
            ebs: BlockDevice {
                volume_size: Some(Quantity::from_mebibytes(512)),
                ..Default::default()
            },
            root_volume: true,
        }];
        assert!(nc.validate().is_err());
    }
}
