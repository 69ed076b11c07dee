//! Project configuration loaded from `config.toml` (or `.json`).
//!
//! Recognized top-level keys are `samples` and `reference_genome`; every other
//! top-level table is the settings group of the rule with the same name.
//! Groups are typed ([`RuleSettings`]) and checked against the registry when
//! it loads, so a misspelled key fails before any job is built.

use std::collections::BTreeMap;
use std::path::Path;

use ruleflow_types::{FlowError, Result};
use serde::Deserialize;

/// A scalar or list value passed through to command templates untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::String(s) => f.write_str(s),
            ParamValue::List(items) => {
                let joined: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&joined.join(" "))
            }
        }
    }
}

/// Per-rule settings group.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    pub threads: Option<usize>,
    pub memory: Option<String>,
    /// Seconds before the job's process group is terminated.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub samples: Vec<String>,
    pub reference_genome: Option<String>,
    #[serde(flatten)]
    pub groups: BTreeMap<String, RuleSettings>,
}

impl ProjectConfig {
    /// Load from TOML, or JSON when the extension is `.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&data)?
        } else {
            Self::from_toml(&data)?
        };
        tracing::debug!(
            path = %path.display(),
            samples = config.samples.len(),
            groups = config.groups.len(),
            "Loaded config"
        );
        Ok(config)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| FlowError::InvalidConfig(format!("JSON config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for sample in &self.samples {
            if sample.is_empty() || sample.contains('/') {
                return Err(FlowError::InvalidConfig(format!(
                    "sample identifier '{sample}' must be non-empty and contain no '/'"
                )));
            }
            if !seen.insert(sample) {
                return Err(FlowError::InvalidConfig(format!(
                    "sample '{sample}' is listed twice"
                )));
            }
        }
        for (name, group) in &self.groups {
            if group.threads == Some(0) {
                return Err(FlowError::InvalidConfig(format!(
                    "settings group '{name}' requests 0 threads"
                )));
            }
        }
        Ok(())
    }

    /// Values available to `{config.KEY}` placeholders.
    pub fn globals(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("samples".to_string(), self.samples.join(" "));
        if let Some(ref genome) = self.reference_genome {
            vars.insert("reference_genome".to_string(), genome.clone());
        }
        vars
    }
}

/// Substitute `{config.KEY}` placeholders with config globals.
///
/// Other placeholders and `{{`/`}}` escapes are left untouched for the
/// pattern and template parsers. Unknown keys are an error.
pub fn expand_config(text: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    const PREFIX: &str = "{config.";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..2]);
            rest = &rest[2..];
        } else if rest.starts_with(PREFIX) {
            let end = rest.find('}').ok_or_else(|| {
                FlowError::InvalidConfig(format!("unterminated config placeholder in '{text}'"))
            })?;
            let key = &rest[PREFIX.len()..end];
            let value = vars.get(key).ok_or_else(|| {
                FlowError::InvalidConfig(format!("unknown config key '{key}' referenced in '{text}'"))
            })?;
            out.push_str(value);
            rest = &rest[end + 1..];
        } else {
            out.push_str(&rest[..1]);
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
samples = ["A", "B"]
reference_genome = "ref/genome.fa"

[trim]
threads = 4
memory = "4G"
timeout = 600

[trim.params]
opts = "--quality 30"
lengths = [20, 30]
"#;

    #[test]
    fn parses_globals_and_groups() {
        let config = ProjectConfig::from_toml(SAMPLE_TOML).unwrap();
        assert_eq!(config.samples, vec!["A", "B"]);
        assert_eq!(config.reference_genome.as_deref(), Some("ref/genome.fa"));
        let trim = &config.groups["trim"];
        assert_eq!(trim.threads, Some(4));
        assert_eq!(trim.memory.as_deref(), Some("4G"));
        assert_eq!(trim.timeout, Some(600));
        assert_eq!(trim.params["opts"].to_string(), "--quality 30");
        assert_eq!(trim.params["lengths"].to_string(), "20 30");
    }

    #[test]
    fn unknown_group_key_is_rejected() {
        let err = ProjectConfig::from_toml("[trim]\nthreds = 4\n").unwrap_err();
        assert!(err.is_configuration(), "got: {err}");
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(ProjectConfig::from_toml("[trim]\nthreads = 0\n").is_err());
    }

    #[test]
    fn duplicate_samples_are_rejected() {
        let err = ProjectConfig::from_toml("samples = [\"A\", \"A\"]\n").unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn json_config_is_supported() {
        let config = ProjectConfig::from_json(
            r#"{"samples": ["S1"], "align": {"threads": 8, "params": {"rg": "@RG"}}}"#,
        )
        .unwrap();
        assert_eq!(config.samples, vec!["S1"]);
        assert_eq!(config.groups["align"].threads, Some(8));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"samples": ["X"]}"#).unwrap();
        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.samples, vec!["X"]);
    }

    #[test]
    fn globals_join_samples() {
        let config = ProjectConfig::from_toml(SAMPLE_TOML).unwrap();
        let vars = config.globals();
        assert_eq!(vars["samples"], "A B");
        assert_eq!(vars["reference_genome"], "ref/genome.fa");
    }

    // ---- expand_config ----

    #[test]
    fn expand_substitutes_config_keys() {
        let mut vars = BTreeMap::new();
        vars.insert("reference_genome".to_string(), "ref/g.fa".to_string());
        assert_eq!(
            expand_config("bwameth.py --reference {config.reference_genome} {input}", &vars).unwrap(),
            "bwameth.py --reference ref/g.fa {input}"
        );
    }

    #[test]
    fn expand_leaves_escapes_and_wildcards_alone() {
        let vars = BTreeMap::new();
        let text = "awk '{{print}}' {sample}.txt";
        assert_eq!(expand_config(text, &vars).unwrap(), text);
    }

    #[test]
    fn expand_unknown_key_is_an_error() {
        let err = expand_config("{config.nope}", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown config key 'nope'"));
    }
}
