//! Serde model of the workflow file (`Ruleflow.toml`).
//!
//! This is the raw, unvalidated form. [`crate::Registry::load`] turns it into
//! typed [`crate::RuleTemplate`]s.

use std::collections::BTreeMap;
use std::path::Path;

use ruleflow_types::Result;
use serde::Deserialize;

use crate::config::ParamValue;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowFile {
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSection {
    /// Default targets, built when none are given on the command line.
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
    pub name: String,
    #[serde(default)]
    pub input: Vec<InputDef>,
    #[serde(default)]
    pub output: Vec<OutputDef>,
    pub log: Option<String>,
    pub shell: Option<String>,
    pub threads: Option<usize>,
    pub memory: Option<String>,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InputDef {
    Path(String),
    Spec {
        name: Option<String>,
        path: Option<String>,
        /// Name of the producing rule.
        from: Option<String>,
        output: Option<OutputRef>,
    },
}

/// Refers to one output of a producer rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OutputRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OutputDef {
    Path(String),
    Spec {
        path: String,
        name: Option<String>,
        #[serde(default)]
        temp: bool,
    },
}

impl WorkflowFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let workflow = Self::from_toml(&data)?;
        tracing::debug!(path = %path.display(), rules = workflow.rules.len(), "Loaded workflow");
        Ok(workflow)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }
}
