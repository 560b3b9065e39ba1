//! nodeplan-api: the objects the provisioner reads.
//!
//! Pods, NodePools and NodeClasses arrive from the cluster object store and
//! are never written back by the provisioning engine. All types deserialize
//! from the camelCase JSON/TOML form used in scenario files.
//!
//! # Components
//!
//! ```text
//! pod.rs         Pod, Container, affinity, topology spread, taints/tolerations
//! nodepool.rs    NodePool, NodeClaimTemplate, Disruption
//! nodeclass.rs   NodeClass, selector terms, block devices, kubelet settings
//! validation.rs  Validate trait, admission rules, update rules
//! ```

pub mod nodeclass;
pub mod nodepool;
pub mod pod;
pub mod validation;

pub use nodeclass::{
    AmiFamily, BlockDevice, BlockDeviceMapping, KubeletConfiguration, MetadataOptions, NodeClass,
    SelectorTerm, VolumeType,
};
pub use nodepool::{ConsolidationPolicy, Disruption, NodeClaimTemplate, NodeClassReference, NodePool};
pub use pod::{
    Affinity, Container, ContainerRestartPolicy, NodeAffinity, NodeSelectorTerm, Pod, PodAffinity,
    PodAffinityTerm, PreferredSchedulingTerm, Taint, TaintEffect, Toleration, TolerationOperator,
    TopologySpreadConstraint, WeightedPodAffinityTerm, WhenUnsatisfiable,
};
pub use validation::{FieldError, Validate, ValidationErrors};
