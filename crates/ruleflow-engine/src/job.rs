//! Concrete jobs: one rule instantiated with one wildcard binding.

use std::collections::BTreeMap;
use std::time::Duration;

use ruleflow_rules::WildcardBinding;
use serde::{Deserialize, Serialize};

use crate::resolve::job_label;

/// Index of a job in its [`crate::JobGraph`]. Ids are assigned in
/// dependency order, so every producer has a smaller id than its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub usize);

impl JobId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub name: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub name: Option<String>,
    pub path: String,
    pub temp: bool,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub rule: String,
    pub binding: WildcardBinding,
    pub inputs: Vec<JobInput>,
    pub outputs: Vec<JobOutput>,
    pub log: Option<String>,
    pub threads: usize,
    pub memory: Option<String>,
    pub timeout: Option<Duration>,
    /// Parameter values rendered for this binding.
    pub params: BTreeMap<String, String>,
    /// Rendered command line; `None` for rules without a command.
    pub command: Option<String>,
}

impl Job {
    pub fn label(&self) -> String {
        job_label(&self.rule, &self.binding)
    }

    pub fn input_paths(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.path.as_str())
    }

    pub fn output_paths(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.path.as_str())
    }

    pub fn consumes(&self, path: &str) -> bool {
        self.input_paths().any(|p| p == path)
    }
}
