//! Wildcard resolver: which rule produces a concrete path.

use ruleflow_rules::{Registry, RuleMatch, WildcardBinding};
use ruleflow_types::{FlowError, Result};

use crate::storage::Storage;

#[derive(Debug)]
pub enum Resolution<'r> {
    /// Exactly one (rule, binding) pair produces the path.
    Produced(RuleMatch<'r>),
    /// No rule produces the path and it exists already.
    External,
}

/// Display form of a (rule, binding) pair, e.g. `trim[s=A]`.
pub fn job_label(rule: &str, binding: &WildcardBinding) -> String {
    if binding.is_empty() {
        return rule.to_string();
    }
    let pairs: Vec<String> = binding.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{rule}[{}]", pairs.join(","))
}

/// Resolve `path` to its producer.
///
/// More than one candidate is always an error; nothing here picks a winner.
pub fn resolve<'r>(
    registry: &'r Registry,
    storage: &dyn Storage,
    path: &str,
) -> Result<Resolution<'r>> {
    let mut matches = registry.matches(path);
    match matches.len() {
        0 if storage.exists(path) => Ok(Resolution::External),
        0 => Err(FlowError::NoProducer {
            path: path.to_string(),
        }),
        1 => Ok(Resolution::Produced(matches.remove(0))),
        _ => Err(FlowError::AmbiguousProducer {
            path: path.to_string(),
            candidates: matches
                .iter()
                .map(|m| job_label(&m.rule.name, &m.binding))
                .collect(),
        }),
    }
}
