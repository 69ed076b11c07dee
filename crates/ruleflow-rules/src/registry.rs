//! The rule registry: validated, immutable rule templates.
//!
//! Built once per process from a [`WorkflowFile`] and a [`ProjectConfig`].
//! All configuration checks happen here, eagerly, so later stages only see
//! well-formed templates.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use ruleflow_types::{FlowError, Result};

use crate::braces::is_identifier;
use crate::config::{expand_config, ProjectConfig, RuleSettings};
use crate::pattern::{Pattern, WildcardBinding};
use crate::template::CommandTemplate;
use crate::workflow::{InputDef, OutputDef, OutputRef, RuleDef, WorkflowFile};

/// Typed cross-rule reference from a consumer input to a producer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRef {
    pub rule: String,
    pub output: usize,
}

#[derive(Debug, Clone)]
pub struct RuleInput {
    pub name: Option<String>,
    pub pattern: Pattern,
    pub producer: Option<ProducerRef>,
}

#[derive(Debug, Clone)]
pub struct RuleOutput {
    pub name: Option<String>,
    pub pattern: Pattern,
    pub temp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub threads: usize,
    pub memory: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuleTemplate {
    pub name: String,
    pub inputs: Vec<RuleInput>,
    pub outputs: Vec<RuleOutput>,
    pub log: Option<Pattern>,
    /// `None` for aggregate rules that only gather inputs.
    pub command: Option<CommandTemplate>,
    pub resources: Resources,
    pub timeout: Option<Duration>,
    pub params: BTreeMap<String, CommandTemplate>,
}

impl RuleTemplate {
    /// Wildcards bound by matching an output; identical for every output.
    pub fn wildcards(&self) -> BTreeSet<String> {
        self.outputs
            .first()
            .map(|o| o.pattern.wildcards())
            .unwrap_or_default()
    }

    pub fn output_index(&self, reference: &OutputRef) -> Option<usize> {
        match reference {
            OutputRef::Index(i) => (*i < self.outputs.len()).then_some(*i),
            OutputRef::Name(name) => self
                .outputs
                .iter()
                .position(|o| o.name.as_deref() == Some(name.as_str())),
        }
    }
}

/// One (rule, binding) pair able to produce a concrete path.
#[derive(Debug, Clone)]
pub struct RuleMatch<'r> {
    pub rule: &'r RuleTemplate,
    pub binding: WildcardBinding,
    /// Index of the output pattern that matched.
    pub output: usize,
}

#[derive(Debug, Clone)]
pub struct Registry {
    rules: Vec<RuleTemplate>,
    index: HashMap<String, usize>,
    default_targets: Vec<String>,
}

enum PendingInput {
    Ready(RuleInput),
    From {
        name: Option<String>,
        rule: String,
        output: Option<OutputRef>,
    },
}

fn invalid_rule(rule: &str, message: impl Into<String>) -> FlowError {
    FlowError::InvalidRule {
        rule: rule.to_string(),
        message: message.into(),
    }
}

fn check_unique_names<'a>(
    rule: &str,
    kind: &str,
    names: impl Iterator<Item = Option<&'a String>>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names.flatten() {
        if !seen.insert(name) {
            return Err(invalid_rule(rule, format!("{kind} name '{name}' is used twice")));
        }
    }
    Ok(())
}

fn build_rule(
    def: RuleDef,
    settings: Option<&RuleSettings>,
    vars: &BTreeMap<String, String>,
) -> Result<(RuleTemplate, Vec<PendingInput>)> {
    let rule = def.name.as_str();

    let mut outputs = Vec::with_capacity(def.output.len());
    for out in &def.output {
        let (path, name, temp) = match out {
            OutputDef::Path(p) => (p, None, false),
            OutputDef::Spec { path, name, temp } => (path, name.clone(), *temp),
        };
        outputs.push(RuleOutput {
            name,
            pattern: Pattern::parse(&expand_config(path, vars)?)?,
            temp,
        });
    }
    check_unique_names(rule, "output", outputs.iter().map(|o| o.name.as_ref()))?;

    if let Some(first) = outputs.first() {
        let expected = first.pattern.wildcards();
        if let Some(odd) = outputs.iter().find(|o| o.pattern.wildcards() != expected) {
            return Err(invalid_rule(
                rule,
                format!(
                    "outputs '{}' and '{}' use different wildcards",
                    first.pattern, odd.pattern
                ),
            ));
        }
    }

    let mut inputs = Vec::with_capacity(def.input.len());
    for input in def.input {
        let pending = match input {
            InputDef::Path(p) => PendingInput::Ready(RuleInput {
                name: None,
                pattern: Pattern::parse(&expand_config(&p, vars)?)?,
                producer: None,
            }),
            InputDef::Spec {
                name,
                path,
                from,
                output,
            } => match (path, from) {
                (Some(p), None) => {
                    if output.is_some() {
                        return Err(invalid_rule(rule, "input 'output' is only valid together with 'from'"));
                    }
                    PendingInput::Ready(RuleInput {
                        name,
                        pattern: Pattern::parse(&expand_config(&p, vars)?)?,
                        producer: None,
                    })
                }
                (None, Some(from)) => PendingInput::From {
                    name,
                    rule: from,
                    output,
                },
                (Some(_), Some(_)) => {
                    return Err(invalid_rule(rule, "input sets both 'path' and 'from'"));
                }
                (None, None) => {
                    return Err(invalid_rule(rule, "input needs either 'path' or 'from'"));
                }
            },
        };
        inputs.push(pending);
    }
    check_unique_names(
        rule,
        "input",
        inputs.iter().map(|i| match i {
            PendingInput::Ready(r) => r.name.as_ref(),
            PendingInput::From { name, .. } => name.as_ref(),
        }),
    )?;

    if inputs.is_empty() && outputs.is_empty() {
        return Err(invalid_rule(rule, "declares neither inputs nor outputs"));
    }

    let threads = settings
        .and_then(|s| s.threads)
        .or(def.threads)
        .unwrap_or(1);
    if threads == 0 {
        return Err(invalid_rule(rule, "threads must be at least 1"));
    }
    let memory = settings.and_then(|s| s.memory.clone()).or(def.memory);
    let timeout = settings
        .and_then(|s| s.timeout)
        .or(def.timeout)
        .map(Duration::from_secs);

    let mut raw_params = def.params;
    if let Some(settings) = settings {
        for (key, value) in &settings.params {
            if !raw_params.contains_key(key) {
                return Err(FlowError::InvalidConfig(format!(
                    "settings group '{rule}' sets param '{key}' which the rule does not declare"
                )));
            }
            raw_params.insert(key.clone(), value.clone());
        }
    }
    let mut params = BTreeMap::new();
    for (key, value) in raw_params {
        if !is_identifier(&key) {
            return Err(invalid_rule(rule, format!("param name '{key}' is not an identifier")));
        }
        let template = CommandTemplate::parse(&expand_config(&value.to_string(), vars)?)?;
        params.insert(key, template);
    }

    let log = def
        .log
        .as_deref()
        .map(|l| expand_config(l, vars).and_then(|l| Pattern::parse(&l)))
        .transpose()?;
    let command = def
        .shell
        .as_deref()
        .map(|s| expand_config(s, vars).and_then(|s| CommandTemplate::parse(&s)))
        .transpose()?;

    let template = RuleTemplate {
        name: def.name,
        inputs: Vec::new(),
        outputs,
        log,
        command,
        resources: Resources { threads, memory },
        timeout,
        params,
    };
    Ok((template, inputs))
}

impl Registry {
    /// Validate `workflow` against `config` and build the registry.
    pub fn load(workflow: WorkflowFile, config: &ProjectConfig) -> Result<Self> {
        let vars = config.globals();

        let declared: HashSet<&str> = workflow.rules.iter().map(|r| r.name.as_str()).collect();
        if let Some(group) = config.groups.keys().find(|g| !declared.contains(g.as_str())) {
            return Err(FlowError::InvalidConfig(format!(
                "settings group '{group}' does not match any rule"
            )));
        }

        let mut rules = Vec::with_capacity(workflow.rules.len());
        let mut pending = Vec::with_capacity(workflow.rules.len());
        let mut index = HashMap::new();
        for def in workflow.rules {
            if !is_identifier(&def.name) {
                return Err(invalid_rule(&def.name, "rule names must be identifiers"));
            }
            if index.contains_key(&def.name) {
                return Err(invalid_rule(&def.name, "rule is defined twice"));
            }
            let settings = config.groups.get(&def.name);
            let (template, inputs) = build_rule(def, settings, &vars)?;
            index.insert(template.name.clone(), rules.len());
            rules.push(template);
            pending.push(inputs);
        }

        // Resolve `from` references now that every producer's outputs are known.
        let mut resolved_inputs = Vec::with_capacity(pending.len());
        for (consumer, inputs) in rules.iter().zip(pending) {
            let mut resolved = Vec::with_capacity(inputs.len());
            for input in inputs {
                match input {
                    PendingInput::Ready(r) => resolved.push(r),
                    PendingInput::From { name, rule, output } => {
                        let producer = index.get(&rule).map(|&i| &rules[i]).ok_or_else(|| {
                            invalid_rule(&consumer.name, format!("input refers to unknown rule '{rule}'"))
                        })?;
                        let reference = output.unwrap_or(OutputRef::Index(0));
                        let idx = producer.output_index(&reference).ok_or_else(|| {
                            invalid_rule(
                                &consumer.name,
                                format!("rule '{rule}' has no output {reference:?}"),
                            )
                        })?;
                        resolved.push(RuleInput {
                            name,
                            pattern: producer.outputs[idx].pattern.clone(),
                            producer: Some(ProducerRef { rule, output: idx }),
                        });
                    }
                }
            }
            resolved_inputs.push(resolved);
        }
        for (rule, inputs) in rules.iter_mut().zip(resolved_inputs) {
            rule.inputs = inputs;
        }

        let default_targets = expand_default_targets(&workflow.workflow.targets, config, &index)?;

        tracing::info!(
            rules = rules.len(),
            default_targets = default_targets.len(),
            "Rule registry loaded"
        );

        Ok(Self {
            rules,
            index,
            default_targets,
        })
    }

    /// Parse a workflow from TOML text and load it.
    pub fn from_toml(workflow: &str, config: &ProjectConfig) -> Result<Self> {
        Self::load(WorkflowFile::from_toml(workflow)?, config)
    }

    /// Load the workflow file and the optional config file from disk.
    pub fn from_files(workflow: &Path, config: Option<&Path>) -> Result<Self> {
        let config = match config {
            Some(path) => ProjectConfig::load(path)?,
            None => ProjectConfig::default(),
        };
        Self::load(WorkflowFile::load(workflow)?, &config)
    }

    pub fn rules(&self) -> &[RuleTemplate] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&RuleTemplate> {
        self.index.get(name).map(|&i| &self.rules[i])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Targets built when the caller requests none.
    pub fn default_targets(&self) -> &[String] {
        &self.default_targets
    }

    /// Every distinct (rule, binding) pair with an output matching `path`.
    pub fn matches(&self, path: &str) -> Vec<RuleMatch<'_>> {
        let mut found: Vec<RuleMatch<'_>> = Vec::new();
        for rule in &self.rules {
            for (i, out) in rule.outputs.iter().enumerate() {
                let Some(binding) = out.pattern.matches(path) else {
                    continue;
                };
                let duplicate = found
                    .iter()
                    .any(|m| m.rule.name == rule.name && m.binding == binding);
                if !duplicate {
                    found.push(RuleMatch {
                        rule,
                        binding,
                        output: i,
                    });
                }
            }
        }
        found
    }
}

/// Expand `{sample}` over the configured samples. Rule names pass through.
fn expand_default_targets(
    targets: &[String],
    config: &ProjectConfig,
    rules: &HashMap<String, usize>,
) -> Result<Vec<String>> {
    let vars = config.globals();
    let mut out = Vec::new();
    for raw in targets {
        let expanded = expand_config(raw, &vars)?;
        if rules.contains_key(&expanded) {
            out.push(expanded);
            continue;
        }
        let pattern = Pattern::parse(&expanded)?;
        if let Some(name) = pattern.wildcards().into_iter().find(|w| w != "sample") {
            return Err(FlowError::UnboundPlaceholder {
                rule: "workflow".into(),
                name,
                context: format!("default target '{raw}'"),
            });
        }
        if pattern.is_concrete() {
            out.push(expanded);
            continue;
        }
        if config.samples.is_empty() {
            tracing::warn!(pattern = %raw,"Default target uses {{sample}} but no samples are configured");
        }
        for sample in &config.samples {
            let mut binding = WildcardBinding::new();
            binding.insert("sample".to_string(), sample.clone());
            let path = pattern.render(&binding).map_err(|u| FlowError::UnboundPlaceholder {
                rule: "workflow".into(),
                name: u.0,
                context: format!("default target '{raw}'"),
            })?;
            out.push(path);
        }
    }
    Ok(out)
}
