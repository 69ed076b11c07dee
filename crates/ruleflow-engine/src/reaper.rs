//! Temp-file reaper.
//!
//! Tracks, per temp output, which consumers still have to run. A temp file is
//! released for deletion exactly once: after its producer finished and every
//! waiting consumer reached a terminal state. Temp outputs that were
//! requested as targets are never tracked.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ruleflow_types::JobStatus;

use crate::graph::JobGraph;
use crate::job::JobId;
use crate::staleness::Plan;

#[derive(Debug)]
struct Entry {
    waiting: BTreeSet<JobId>,
    produced: bool,
}

#[derive(Debug, Default)]
pub struct TempReaper {
    entries: BTreeMap<String, Entry>,
    by_producer: HashMap<JobId, Vec<String>>,
    by_consumer: HashMap<JobId, Vec<String>>,
}

impl TempReaper {
    pub fn new(graph: &JobGraph, plan: &Plan) -> Self {
        let mut reaper = Self::default();
        for job in graph.jobs() {
            for out in job.outputs.iter().filter(|o| o.temp) {
                if graph.is_requested(&out.path) {
                    continue;
                }
                let waiting: BTreeSet<JobId> = graph
                    .dependents(job.id)
                    .iter()
                    .copied()
                    .filter(|&c| plan.needs_run(c) && graph.job(c).consumes(&out.path))
                    .collect();
                for &consumer in &waiting {
                    reaper
                        .by_consumer
                        .entry(consumer)
                        .or_default()
                        .push(out.path.clone());
                }
                reaper
                    .by_producer
                    .entry(job.id)
                    .or_default()
                    .push(out.path.clone());
                reaper.entries.insert(
                    out.path.clone(),
                    Entry {
                        waiting,
                        produced: false,
                    },
                );
            }
        }
        reaper
    }

    /// Number of temp files still tracked.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Record that `id` reached terminal `status`; return the temp paths that
    /// are now safe to delete.
    ///
    /// A producer that did not succeed or skip leaves nothing to reap, so its
    /// entries are dropped.
    pub fn job_finished(&mut self, id: JobId, status: JobStatus) -> Vec<String> {
        let mut touched = Vec::new();

        if let Some(paths) = self.by_producer.remove(&id) {
            for path in paths {
                if status.satisfies_dependents() {
                    if let Some(entry) = self.entries.get_mut(&path) {
                        entry.produced = true;
                    }
                    touched.push(path);
                } else {
                    self.entries.remove(&path);
                }
            }
        }

        if let Some(paths) = self.by_consumer.remove(&id) {
            for path in paths {
                if let Some(entry) = self.entries.get_mut(&path) {
                    entry.waiting.remove(&id);
                }
                touched.push(path);
            }
        }

        let mut released = Vec::new();
        for path in touched {
            let done = self
                .entries
                .get(&path)
                .is_some_and(|e| e.produced && e.waiting.is_empty());
            if done {
                self.entries.remove(&path);
                released.push(path);
            }
        }
        released
    }
}
