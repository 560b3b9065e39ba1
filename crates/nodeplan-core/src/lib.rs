pub mod config;
pub mod duration;
pub mod labels;
pub mod requirements;
pub mod resources;
pub mod selector;

pub use config::{CostPolicy, NodeplanConfig};
pub use duration::NillableDuration;
pub use requirements::{
    Incompatible, Infeasible, NodeSelectorRequirement, Operator, Requirement, RequirementError,
    Requirements, UndefinedLabels,
};
pub use resources::{Quantity, ResourceList};
pub use selector::LabelSelector;
