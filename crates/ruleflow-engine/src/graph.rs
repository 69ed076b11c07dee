//! Job graph construction.
//!
//! [`GraphBuilder`] materializes jobs on demand, starting from the requested
//! targets and walking inputs depth first. Jobs are deduplicated by their
//! (rule, binding) identity, and ids are handed out only once every input is
//! resolved, so id order is a topological order of the finished graph.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use ruleflow_rules::{Pattern, Registry, RuleTemplate, WildcardBinding};
use ruleflow_types::{FlowError, Result};

use crate::job::{Job, JobId, JobInput, JobOutput};
use crate::render::{render, render_params};
use crate::resolve::{job_label, resolve, Resolution};
use crate::storage::{normalize_path, Storage};

type JobKey = (String, WildcardBinding);

/// Nesting limit for materialization.
const MAX_DEPTH: usize = 256;

/// Immutable DAG of jobs for one invocation.
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<Job>,
    producers: Vec<Vec<JobId>>,
    dependents: Vec<Vec<JobId>>,
    by_output: HashMap<String, JobId>,
    targets: Vec<JobId>,
    requested: BTreeSet<String>,
    externals: BTreeSet<String>,
}

impl JobGraph {
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs whose outputs `id` consumes.
    pub fn producers(&self, id: JobId) -> &[JobId] {
        &self.producers[id.0]
    }

    /// Jobs consuming an output of `id`.
    pub fn dependents(&self, id: JobId) -> &[JobId] {
        &self.dependents[id.0]
    }

    pub fn producer_of(&self, path: &str) -> Option<JobId> {
        self.by_output.get(path).copied()
    }

    /// Jobs materialized directly for a requested target.
    pub fn targets(&self) -> &[JobId] {
        &self.targets
    }

    /// Whether `path` was requested as a target.
    pub fn is_requested(&self, path: &str) -> bool {
        self.requested.contains(path)
    }

    /// Existing files no rule produces.
    pub fn externals(&self) -> &BTreeSet<String> {
        &self.externals
    }

    pub fn topological_order(&self) -> impl Iterator<Item = JobId> {
        (0..self.jobs.len()).map(JobId)
    }

    /// Render the graph in Graphviz DOT syntax.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph jobs {\n    rankdir=LR;\n    node [shape=box];\n");
        for job in &self.jobs {
            let _ = writeln!(
                out,
                "    j{} [label=\"{}\"];",
                job.id.0,
                job.label().replace('"', "\\\"")
            );
        }
        for job in &self.jobs {
            for producer in self.producers(job.id) {
                let _ = writeln!(out, "    j{} -> j{};", producer.0, job.id.0);
            }
        }
        out.push_str("}\n");
        out
    }
}

pub struct GraphBuilder<'a> {
    registry: &'a Registry,
    storage: &'a dyn Storage,
    capacity: usize,
    jobs: Vec<Job>,
    producers: Vec<Vec<JobId>>,
    by_key: HashMap<JobKey, JobId>,
    by_output: HashMap<String, JobId>,
    /// Keys currently being materialized, outermost first.
    resolving: Vec<JobKey>,
    externals: BTreeSet<String>,
    /// Externals in insertion order, for rollback.
    external_log: Vec<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a Registry, storage: &'a dyn Storage, capacity: usize) -> Self {
        Self {
            registry,
            storage,
            capacity,
            jobs: Vec::new(),
            producers: Vec::new(),
            by_key: HashMap::new(),
            by_output: HashMap::new(),
            resolving: Vec::new(),
            externals: BTreeSet::new(),
            external_log: Vec::new(),
        }
    }

    /// Build the graph needed to produce `targets`.
    ///
    /// A target naming a rule without wildcards materializes that rule's job;
    /// anything else is a path.
    pub fn build(mut self, targets: &[String]) -> Result<JobGraph> {
        let registry = self.registry;
        let mut target_jobs = Vec::new();
        let mut requested = BTreeSet::new();

        for target in targets {
            if let Some(rule) = registry.rule(target) {
                if rule.wildcards().is_empty() {
                    let id = self.materialize(rule, WildcardBinding::new())?;
                    if !target_jobs.contains(&id) {
                        target_jobs.push(id);
                    }
                    continue;
                }
            }

            let path = normalize_path(target);
            requested.insert(path.clone());
            match self.resolve_path(&path)? {
                Some(id) => {
                    if !target_jobs.contains(&id) {
                        target_jobs.push(id);
                    }
                }
                None => {
                    tracing::info!(target = %path, "Target exists and no rule produces it");
                }
            }
        }

        let mut dependents = vec![Vec::new(); self.jobs.len()];
        for (consumer, producers) in self.producers.iter().enumerate() {
            for p in producers {
                dependents[p.0].push(JobId(consumer));
            }
        }

        tracing::debug!(
            jobs = self.jobs.len(),
            targets = target_jobs.len(),
            externals = self.externals.len(),
            "Job graph built"
        );

        Ok(JobGraph {
            jobs: self.jobs,
            producers: self.producers,
            dependents,
            by_output: self.by_output,
            targets: target_jobs,
            requested,
            externals: self.externals,
        })
    }

    /// Producer job of `path`, or `None` for an existing external file.
    fn resolve_path(&mut self, path: &str) -> Result<Option<JobId>> {
        if let Some(&id) = self.by_output.get(path) {
            return Ok(Some(id));
        }
        let registry = self.registry;
        match resolve(registry, self.storage, path)? {
            Resolution::Produced(m) if !self.storage.exists(path) => self.materialize(m.rule, m.binding).map(Some),
            Resolution::Produced(m) => {
                // An existing file stands in for a producer that cannot be built.
                let mark = self.mark();
                match self.materialize(m.rule, m.binding) {
                    Ok(id) => Ok(Some(id)),
                    Err(e) if falls_back_to_file(&e) => {
                        tracing::debug!(path = %path, error = %e, "Using existing file, its producer cannot be built");
                        self.rollback(mark);
                        self.add_external(path);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Resolution::External => {
                self.add_external(path);
                Ok(None)
            }
        }
    }

    fn materialize(&mut self, rule: &'a RuleTemplate, binding: WildcardBinding) -> Result<JobId> {
        let key = (rule.name.clone(), binding);
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(id);
        }
        if let Some(pos) = self.resolving.iter().position(|k| *k == key) {
            let mut cycle: Vec<String> = self.resolving[pos..]
                .iter()
                .map(|(r, b)| job_label(r, b))
                .collect();
            cycle.push(job_label(&key.0, &key.1));
            return Err(FlowError::CyclicDependency { cycle });
        }
        if let Some(pos) = self
            .resolving
            .iter()
            .position(|(r, b)| *r == key.0 && extends(b, &key.1))
        {
            let mut chain: Vec<String> = self.resolving[pos..]
                .iter()
                .map(|(r, b)| job_label(r, b))
                .collect();
            chain.push(job_label(&key.0, &key.1));
            return Err(FlowError::PeriodicWildcard {
                rule: key.0.clone(),
                chain,
            });
        }
        if self.resolving.len() >= MAX_DEPTH {
            return Err(FlowError::DependencyTooDeep {
                job: job_label(&key.0, &key.1),
                limit: MAX_DEPTH,
            });
        }

        self.resolving.push(key.clone());
        let built = self.build_job(rule, &key.1);
        self.resolving.pop();
        let (mut job, producers) = built?;

        let id = JobId(self.jobs.len());
        job.id = id;
        for out in &job.outputs {
            if let Some(&other) = self.by_output.get(&out.path) {
                return Err(FlowError::DuplicateOutput {
                    path: out.path.clone(),
                    first: self.jobs[other.0].label(),
                    second: job.label(),
                });
            }
        }
        for out in &job.outputs {
            self.by_output.insert(out.path.clone(), id);
        }
        tracing::trace!(job = %job.label(), id = id.0, "Materialized job");

        self.by_key.insert(key, id);
        self.jobs.push(job);
        self.producers.push(producers);
        Ok(id)
    }

    fn add_external(&mut self, path: &str) {
        if self.externals.insert(path.to_string()) {
            self.external_log.push(path.to_string());
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            jobs: self.jobs.len(),
            externals: self.external_log.len(),
        }
    }

    /// Forget every job materialized since `mark`.
    fn rollback(&mut self, mark: Mark) {
        let len = mark.jobs;
        self.jobs.truncate(len);
        self.producers.truncate(len);
        self.by_key.retain(|_, id| id.0 < len);
        self.by_output.retain(|_, id| id.0 < len);
        for path in self.external_log.drain(mark.externals..) {
            self.externals.remove(&path);
        }
    }

    fn render_path(rule: &RuleTemplate, pattern: &Pattern, binding: &WildcardBinding, what: &str) -> Result<String> {
        pattern
            .render(binding)
            .map(|p| normalize_path(&p))
            .map_err(|u| FlowError::UnboundPlaceholder {
                rule: rule.name.clone(),
                name: u.0,
                context: format!("{what} '{pattern}'"),
            })
    }

    fn build_job(
        &mut self,
        rule: &'a RuleTemplate,
        binding: &WildcardBinding,
    ) -> Result<(Job, Vec<JobId>)> {
        let label = job_label(&rule.name, binding);

        if rule.resources.threads > self.capacity {
            return Err(FlowError::ThreadsExceedCapacity {
                job: label,
                threads: rule.resources.threads,
                capacity: self.capacity,
            });
        }

        let mut outputs = Vec::with_capacity(rule.outputs.len());
        for out in &rule.outputs {
            outputs.push(JobOutput {
                name: out.name.clone(),
                path: Self::render_path(rule, &out.pattern, binding, "output")?,
                temp: out.temp,
            });
        }
        let log = rule
            .log
            .as_ref()
            .map(|l| Self::render_path(rule, l, binding, "log"))
            .transpose()?;

        let mut inputs = Vec::with_capacity(rule.inputs.len());
        let mut producers: Vec<JobId> = Vec::new();
        for input in &rule.inputs {
            let path = Self::render_path(rule, &input.pattern, binding, "input")?;

            let producer = match &input.producer {
                Some(reference) => {
                    let registry = self.registry;
                    let producer_rule = registry.rule(&reference.rule).ok_or_else(|| {
                        FlowError::Other(format!("rule '{}' vanished from the registry", reference.rule))
                    })?;
                    let producer_binding = producer_rule.outputs[reference.output]
                        .pattern
                        .matches(&path)
                        .ok_or_else(|| FlowError::UnresolvableInput {
                            path: path.clone(),
                            rule: rule.name.clone(),
                        })?;
                    Some(self.materialize(producer_rule, producer_binding)?)
                }
                None => match self.resolve_path(&path) {
                    Ok(id) => id,
                    Err(FlowError::NoProducer { path }) => {
                        return Err(FlowError::UnresolvableInput {
                            path,
                            rule: rule.name.clone(),
                        })
                    }
                    Err(e) => return Err(e),
                },
            };
            if let Some(id) = producer {
                if !producers.contains(&id) {
                    producers.push(id);
                }
            }
            inputs.push(JobInput {
                name: input.name.clone(),
                path,
            });
        }

        let mut job = Job {
            id: JobId(usize::MAX),
            rule: rule.name.clone(),
            binding: binding.clone(),
            inputs,
            outputs,
            log,
            threads: rule.resources.threads,
            memory: rule.resources.memory.clone(),
            timeout: rule.timeout,
            params: Default::default(),
            command: None,
        };
        job.params = render_params(rule, &job)?;
        job.command = render(rule, &job)?;
        Ok((job, producers))
    }
}

/// Builder state to return to when a speculative materialization fails.
struct Mark {
    jobs: usize,
    externals: usize,
}

/// Errors after which an existing file is used instead of its producer.
fn falls_back_to_file(e: &FlowError) -> bool {
    matches!(
        e,
        FlowError::UnresolvableInput { .. }
            | FlowError::NoProducer { .. }
            | FlowError::PeriodicWildcard { .. }
            | FlowError::DependencyTooDeep { .. }
    )
}

/// `later` binds the same wildcards as `earlier`, every value contains the
/// earlier one, and at least one grew.
fn extends(earlier: &WildcardBinding, later: &WildcardBinding) -> bool {
    earlier != later
        && earlier.len() == later.len()
        && earlier
            .iter()
            .all(|(name, value)| later.get(name).is_some_and(|v| v.contains(value.as_str())))
}
