//! Command renderer.
//!
//! Rendering is pure: it reads only the job's resolved paths, binding,
//! resources and params. The graph builder renders every command once while
//! building so unbound placeholders fail before any process starts.

use std::collections::BTreeMap;

use ruleflow_rules::{CommandTemplate, Placeholder, RuleTemplate, Selector, Unbound};
use ruleflow_types::{FlowError, Result};

use crate::job::Job;

fn select<'a>(
    items: impl Iterator<Item = (Option<&'a str>, &'a str)>,
    selector: &Selector,
) -> Option<String> {
    let items: Vec<(Option<&str>, &str)> = items.collect();
    match selector {
        Selector::All => Some(
            items
                .iter()
                .map(|(_, path)| *path)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Selector::Index(i) => items.get(*i).map(|(_, path)| path.to_string()),
        Selector::Name(name) => items
            .iter()
            .find(|(n, _)| *n == Some(name.as_str()))
            .map(|(_, path)| path.to_string()),
    }
}

/// Value of `placeholder` for `job`, if it has one.
fn lookup(job: &Job, placeholder: &Placeholder) -> Option<String> {
    match placeholder {
        Placeholder::Input(sel) => select(
            job.inputs.iter().map(|i| (i.name.as_deref(), i.path.as_str())),
            sel,
        ),
        Placeholder::Output(sel) => select(
            job.outputs.iter().map(|o| (o.name.as_deref(), o.path.as_str())),
            sel,
        ),
        Placeholder::Log => job.log.clone(),
        Placeholder::Threads => Some(job.threads.to_string()),
        Placeholder::Memory => job.memory.clone(),
        Placeholder::Param(key) => job.params.get(key).cloned(),
        Placeholder::Wildcard(name) => job.binding.get(name).cloned(),
        Placeholder::Rule => Some(job.rule.clone()),
    }
}

fn unbound(job: &Job, context: String) -> impl FnOnce(Unbound) -> FlowError + '_ {
    move |Unbound(name)| FlowError::UnboundPlaceholder {
        rule: job.rule.clone(),
        name,
        context,
    }
}

/// Render the rule's parameter templates for `job`.
///
/// Parameters may reference anything a command can except other parameters.
pub fn render_params(rule: &RuleTemplate, job: &Job) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for (key, template) in &rule.params {
        let value = template
            .render(|p| match p {
                Placeholder::Param(_) => None,
                other => lookup(job, other),
            })
            .map_err(unbound(job, format!("param '{key}' of {}", job.label())))?;
        params.insert(key.clone(), value);
    }
    Ok(params)
}

/// Render `template` against `job`.
pub fn render_template(template: &CommandTemplate, job: &Job) -> Result<String> {
    template
        .render(|p| lookup(job, p))
        .map_err(unbound(job, format!("command of {}", job.label())))
}

/// Render the rule's command for `job`. `Ok(None)` when the rule has none.
pub fn render(rule: &RuleTemplate, job: &Job) -> Result<Option<String>> {
    rule.command
        .as_ref()
        .map(|template| render_template(template, job))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobInput, JobOutput};
    use ruleflow_rules::{ProjectConfig, Registry, WildcardBinding};

    fn job() -> Job {
        let mut binding = WildcardBinding::new();
        binding.insert("s".into(), "A".into());
        Job {
            id: JobId(0),
            rule: "trim".into(),
            binding,
            inputs: vec![
                JobInput {
                    name: Some("reads".into()),
                    path: "temp/A.fastq".into(),
                },
                JobInput {
                    name: None,
                    path: "adapters.fa".into(),
                },
            ],
            outputs: vec![JobOutput {
                name: None,
                path: "out/A.trim".into(),
                temp: false,
            }],
            log: Some("logs/A.log".into()),
            threads: 4,
            memory: Some("2G".into()),
            timeout: None,
            params: BTreeMap::new(),
            command: None,
        }
    }

    fn template(raw: &str) -> CommandTemplate {
        CommandTemplate::parse(raw).unwrap()
    }

    #[test]
    fn renders_paths_and_resources() {
        let out = render_template(
            &template("trim -j {threads} -m {resources.memory} {input.reads} {input[1]} > {output} 2> {log}"),
            &job(),
        )
        .unwrap();
        assert_eq!(
            out,
            "trim -j 4 -m 2G temp/A.fastq adapters.fa > out/A.trim 2> logs/A.log"
        );
    }

    #[test]
    fn all_inputs_are_space_joined() {
        let out = render_template(&template("cat {input}"), &job()).unwrap();
        assert_eq!(out, "cat temp/A.fastq adapters.fa");
    }

    #[test]
    fn wildcards_and_rule_name() {
        let out = render_template(&template("echo {rule} {s} {wildcards.s}"), &job()).unwrap();
        assert_eq!(out, "echo trim A A");
    }

    #[test]
    fn out_of_range_index_is_unbound() {
        let err = render_template(&template("cat {input.5}"), &job()).unwrap_err();
        match err {
            FlowError::UnboundPlaceholder { rule, name, .. } => {
                assert_eq!(rule, "trim");
                assert_eq!(name, "input.5");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn missing_memory_is_unbound() {
        let mut j = job();
        j.memory = None;
        assert!(render_template(&template("-m {resources.memory}"), &j).is_err());
    }

    #[test]
    fn params_render_against_binding() {
        let reg = Registry::from_toml(
            r#"
[[rule]]
name = "trim"
output = ["out/{s}.trim"]
shell = "trim {params.tag}"
params = { tag = "ID:{s}-t{threads}" }
"#,
            &ProjectConfig::default(),
        )
        .unwrap();
        let rule = reg.rule("trim").unwrap();
        let mut j = job();
        j.params = render_params(rule, &j).unwrap();
        assert_eq!(j.params["tag"], "ID:A-t4");
        assert_eq!(render(rule, &j).unwrap().as_deref(), Some("trim ID:A-t4"));
    }
}
