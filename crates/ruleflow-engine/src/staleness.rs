//! Staleness checker.
//!
//! Decides, once per invocation, which jobs must run. A job runs when it has
//! no outputs, an output is missing, an output is older than an input, or a
//! job it depends on runs. Temp outputs that were reaped by an earlier run do
//! not count as missing on their own; their producer reruns only when some
//! consumer needs the file again.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::graph::JobGraph;
use crate::job::JobId;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    NoOutputs,
    Forced,
    MissingOutput,
    OlderThanInput,
    UpstreamRerun,
    NeededByConsumer,
}

impl std::fmt::Display for RunReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunReason::NoOutputs => "job has no outputs",
            RunReason::Forced => "forced",
            RunReason::MissingOutput => "missing output",
            RunReason::OlderThanInput => "output older than input",
            RunReason::UpstreamRerun => "an upstream job runs",
            RunReason::NeededByConsumer => "temp output needed by a consumer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceMode {
    #[default]
    None,
    /// Rerun the jobs of the requested targets.
    Targets,
    /// Rerun every job in the graph.
    All,
}

/// Which jobs must run, and why.
#[derive(Debug, Clone)]
pub struct Plan {
    reasons: Vec<Option<RunReason>>,
}

impl Plan {
    pub fn compute(graph: &JobGraph, storage: &dyn Storage, force: ForceMode) -> Self {
        let n = graph.len();
        let mut reasons: Vec<Option<RunReason>> = vec![None; n];

        // Newest input per job. A reaped temp input stands in for the inputs of
        // its producer, so editing a file upstream of a temp still shows up.
        let mut newest_input: Vec<Option<SystemTime>> = vec![None; n];

        let reaped_temp = |path: &str| -> bool {
            !graph.is_requested(path)
                && graph.producer_of(path).is_some_and(|p| {
                    graph
                        .job(p)
                        .outputs
                        .iter()
                        .any(|o| o.temp && o.path == path)
                })
                && !storage.exists(path)
        };

        for id in graph.topological_order() {
            let job = graph.job(id);

            let mut newest: Option<SystemTime> = None;
            for input in job.input_paths() {
                let mtime = match storage.modified(input) {
                    Some(t) => Some(t),
                    None if reaped_temp(input) => graph
                        .producer_of(input)
                        .and_then(|p| newest_input[p.0]),
                    None => None,
                };
                newest = newest.max(mtime);
            }
            newest_input[id.0] = newest;

            let forced = match force {
                ForceMode::All => true,
                ForceMode::Targets => graph.targets().contains(&id),
                ForceMode::None => false,
            };
            reasons[id.0] = if forced {
                Some(RunReason::Forced)
            } else if job.outputs.is_empty() {
                Some(RunReason::NoOutputs)
            } else {
                own_reason(graph, storage, id, newest, &reaped_temp)
            };
        }

        let mut queue: VecDeque<JobId> = graph
            .topological_order()
            .filter(|id| reasons[id.0].is_some())
            .collect();
        while let Some(id) = queue.pop_front() {
            for &dependent in graph.dependents(id) {
                if reasons[dependent.0].is_none() {
                    reasons[dependent.0] = Some(RunReason::UpstreamRerun);
                    queue.push_back(dependent);
                }
            }
            for input in graph.job(id).input_paths() {
                if storage.exists(input) {
                    continue;
                }
                if let Some(producer) = graph.producer_of(input) {
                    if reasons[producer.0].is_none() {
                        reasons[producer.0] = Some(RunReason::NeededByConsumer);
                        queue.push_back(producer);
                    }
                }
            }
        }

        let plan = Self { reasons };
        tracing::debug!(jobs = n, to_run = plan.run_count(), "Staleness plan computed");
        plan
    }

    pub fn needs_run(&self, id: JobId) -> bool {
        self.reasons[id.0].is_some()
    }

    pub fn reason(&self, id: JobId) -> Option<RunReason> {
        self.reasons[id.0]
    }

    pub fn to_run(&self) -> impl Iterator<Item = JobId> + '_ {
        self.reasons
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .map(|(i, _)| JobId(i))
    }

    pub fn run_count(&self) -> usize {
        self.reasons.iter().filter(|r| r.is_some()).count()
    }
}

fn own_reason(
    graph: &JobGraph,
    storage: &dyn Storage,
    id: JobId,
    newest_input: Option<SystemTime>,
    reaped_temp: &dyn Fn(&str) -> bool,
) -> Option<RunReason> {
    let job = graph.job(id);
    let mut oldest_output: Option<SystemTime> = None;
    for out in &job.outputs {
        match storage.modified(&out.path) {
            Some(t) => oldest_output = Some(oldest_output.map_or(t, |o| o.min(t))),
            None if reaped_temp(&out.path) => {}
            None => return Some(RunReason::MissingOutput),
        }
    }
    match (oldest_output, newest_input) {
        (Some(out), Some(input)) if out < input => Some(RunReason::OlderThanInput),
        _ => None,
    }
}
