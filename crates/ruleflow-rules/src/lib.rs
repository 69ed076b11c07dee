//! Workflow definition for ruleflow.
//!
//! Parses the workflow file and project config, compiles wildcard patterns and
//! command templates, and validates everything into an immutable [`Registry`].

mod braces;
pub mod config;
pub mod pattern;
pub mod registry;
pub mod template;
pub mod workflow;

pub use config::{expand_config, ParamValue, ProjectConfig, RuleSettings};
pub use pattern::{Pattern, Unbound, WildcardBinding};
pub use registry::{
    ProducerRef, Registry, Resources, RuleInput, RuleMatch, RuleOutput, RuleTemplate,
};
pub use template::{CommandTemplate, Placeholder, Selector};
pub use workflow::{InputDef, OutputDef, OutputRef, RuleDef, WorkflowFile};
