//! Scheduler and executor.
//!
//! A single loop owns all job state. Running jobs live in a [`JoinSet`]; the
//! loop only waits on their completion. Ready jobs are dispatched strictly in
//! readiness order: when the head of the queue needs more slots than are
//! free, later jobs wait behind it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ruleflow_types::{JobOutcome, JobStatus};
use tokio::task::{self, JoinSet};
use tracing::Instrument;

use crate::events::{EventEmitter, JobEvent};
use crate::graph::JobGraph;
use crate::job::JobId;
use crate::reaper::TempReaper;
use crate::runner::{DynRunner, RunRequest};
use crate::staleness::Plan;
use crate::storage::Storage;
use crate::summary::{JobReport, RunSummary};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total execution slots.
    pub capacity: usize,
    /// Keep dispatching independent jobs after a failure.
    pub keep_going: bool,
    /// Leave the outputs of failed jobs in place.
    pub keep_incomplete: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            keep_going: true,
            keep_incomplete: false,
        }
    }
}

pub struct Scheduler<'g> {
    graph: &'g JobGraph,
    plan: &'g Plan,
    storage: Arc<dyn Storage>,
    runner: DynRunner,
    events: EventEmitter,
    config: SchedulerConfig,
}

/// Mutable state of one run.
struct RunState {
    status: Vec<JobStatus>,
    outcomes: Vec<Option<JobOutcome>>,
    root_cause: Vec<Option<JobId>>,
    waiting_on: Vec<usize>,
    ready: VecDeque<JobId>,
    settled: VecDeque<JobId>,
    free: usize,
    halted: bool,
    /// Job behind each running task.
    tasks: HashMap<task::Id, JobId>,
    reaper: TempReaper,
    deleted: Vec<String>,
}

impl<'g> Scheduler<'g> {
    pub fn new(
        graph: &'g JobGraph,
        plan: &'g Plan,
        storage: Arc<dyn Storage>,
        runner: DynRunner,
        events: EventEmitter,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            plan,
            storage,
            runner,
            events,
            config,
        }
    }

    /// Execute the plan. Job failures are reported in the summary, never as
    /// an error.
    pub async fn run(&self, run_id: String) -> RunSummary {
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String) -> RunSummary {
        let started_at = chrono::Utc::now();
        let graph = self.graph;
        let n = graph.len();

        self.events.emit(JobEvent::RunStarted {
            run_id: run_id.clone(),
            job_count: n,
            to_run: self.plan.run_count(),
            capacity: self.config.capacity,
        });
        tracing::info!(
            jobs = n,
            to_run = self.plan.run_count(),
            capacity = self.config.capacity,
            "Starting run"
        );

        let mut state = RunState {
            status: vec![JobStatus::Pending; n],
            outcomes: vec![None; n],
            root_cause: vec![None; n],
            waiting_on: graph.topological_order().map(|id| graph.producers(id).len()).collect(),
            ready: VecDeque::new(),
            settled: VecDeque::new(),
            free: self.config.capacity,
            halted: false,
            tasks: HashMap::new(),
            reaper: TempReaper::new(graph, self.plan),
            deleted: Vec::new(),
        };

        for id in graph.topological_order() {
            if state.waiting_on[id.0] == 0 {
                self.unblock(&mut state, id);
            }
        }

        let mut running: JoinSet<JobOutcome> = JoinSet::new();
        loop {
            self.settle(&mut state);

            while !state.halted {
                let Some(&head) = state.ready.front() else {
                    break;
                };
                if graph.job(head).threads > state.free {
                    break;
                }
                state.ready.pop_front();
                self.dispatch(&mut state, &mut running, head);
            }
            // Jobs finished synchronously during dispatch may unblock more.
            if !state.settled.is_empty() {
                continue;
            }

            match running.join_next_with_id().await {
                Some(Ok((task_id, outcome))) => self.task_finished(&mut state, task_id, outcome),
                Some(Err(e)) => {
                    let outcome = JobOutcome::fail(format!("runner task failed: {e}"));
                    self.task_finished(&mut state, e.id(), outcome);
                }
                None => break,
            }
        }

        for id in graph.topological_order() {
            if !state.status[id.0].is_terminal() {
                state.status[id.0] = JobStatus::Cancelled;
            }
        }

        let jobs: Vec<JobReport> = graph
            .topological_order()
            .map(|id| {
                let mut report = JobReport::new(graph, self.plan, id, state.status[id.0]);
                if let Some(ref outcome) = state.outcomes[id.0] {
                    report = report.with_outcome(outcome);
                }
                report.root_cause = state.root_cause[id.0].map(|r| graph.job(r).label());
                report
            })
            .collect();

        let summary = RunSummary {
            run_id: run_id.clone(),
            dry_run: false,
            started_at,
            finished_at: chrono::Utc::now(),
            jobs,
            deleted_temps: state.deleted,
        };

        self.events.emit(JobEvent::RunCompleted {
            run_id,
            succeeded: summary.count(JobStatus::Succeeded),
            failed: summary.count(JobStatus::Failed),
            duration_ms: summary.duration_ms(),
        });
        tracing::info!(
            succeeded = summary.count(JobStatus::Succeeded),
            skipped = summary.count(JobStatus::Skipped),
            failed = summary.count(JobStatus::Failed),
            upstream_failed = summary.count(JobStatus::UpstreamFailed),
            cancelled = summary.count(JobStatus::Cancelled),
            "Run finished"
        );
        summary
    }

    /// All producers of `id` finished successfully or were skipped.
    fn unblock(&self, state: &mut RunState, id: JobId) {
        if self.plan.needs_run(id) {
            state.status[id.0] = JobStatus::Ready;
            state.ready.push_back(id);
        } else {
            let label = self.graph.job(id).label();
            tracing::debug!(job = %label, "Up to date, skipping");
            self.events.emit(JobEvent::JobSkipped { job: label });
            state.status[id.0] = JobStatus::Skipped;
            state.settled.push_back(id);
        }
    }

    /// Propagate every newly terminal job to its dependents and the reaper.
    fn settle(&self, state: &mut RunState) {
        while let Some(id) = state.settled.pop_front() {
            let status = state.status[id.0];

            for path in state.reaper.job_finished(id, status) {
                // Already reaped by an earlier run.
                if !self.storage.exists(&path) {
                    continue;
                }
                match self.storage.remove(&path) {
                    Ok(()) => {
                        tracing::info!(path = %path, "Deleted temp file");
                        self.events.emit(JobEvent::TempDeleted { path: path.clone() });
                        state.deleted.push(path);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Failed to delete temp file");
                    }
                }
            }

            for &dependent in self.graph.dependents(id) {
                if state.status[dependent.0] != JobStatus::Pending {
                    continue;
                }
                if status.satisfies_dependents() {
                    state.waiting_on[dependent.0] -= 1;
                    if state.waiting_on[dependent.0] == 0 {
                        self.unblock(state, dependent);
                    }
                } else {
                    let root = match status {
                        JobStatus::Failed => Some(id),
                        _ => state.root_cause[id.0],
                    };
                    state.status[dependent.0] = JobStatus::UpstreamFailed;
                    state.root_cause[dependent.0] = root;
                    let label = self.graph.job(dependent).label();
                    let root_label = root.map(|r| self.graph.job(r).label()).unwrap_or_default();
                    tracing::warn!(job = %label, root_cause = %root_label, "Not running, upstream job failed");
                    self.events.emit(JobEvent::JobUpstreamFailed {
                        job: label,
                        root_cause: root_label,
                    });
                    state.settled.push_back(dependent);
                }
            }
        }
    }

    fn dispatch(&self, state: &mut RunState, running: &mut JoinSet<JobOutcome>, id: JobId) {
        let job = self.graph.job(id);
        let label = job.label();

        for path in job.output_paths().chain(job.log.as_deref()) {
            if let Err(e) = self.storage.create_parent_dirs(path) {
                let outcome = JobOutcome::fail(format!("cannot create directory for '{path}': {e}"));
                self.complete(state, id, outcome);
                return;
            }
        }

        let Some(request) = RunRequest::for_job(job) else {
            tracing::debug!(job = %label, "No command, nothing to execute");
            self.complete(state, id, JobOutcome::success());
            return;
        };

        tracing::info!(job = %label, threads = job.threads, "Starting job");
        self.events.emit(JobEvent::JobStarted {
            job: label,
            rule: job.rule.clone(),
            threads: job.threads,
        });

        state.free -= job.threads;
        state.status[id.0] = JobStatus::Running;

        let runner = Arc::clone(&self.runner);
        let handle = running.spawn(
            async move {
                match runner.run(&request).await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome::fail(format!("runner error: {e}")),
                }
            }
            .in_current_span(),
        );
        state.tasks.insert(handle.id(), id);
    }

    /// Release the slots of a finished task and record its job.
    fn task_finished(&self, state: &mut RunState, task_id: task::Id, outcome: JobOutcome) {
        let Some(id) = state.tasks.remove(&task_id) else {
            tracing::error!(task = %task_id, "Finished task has no job");
            return;
        };
        state.free += self.graph.job(id).threads;
        self.complete(state, id, outcome);
    }

    /// Record a finished job. Slots must already be released by the caller.
    fn complete(&self, state: &mut RunState, id: JobId, outcome: JobOutcome) {
        let job = self.graph.job(id);
        let label = job.label();

        let outcome = if outcome.is_success() {
            let missing: Vec<&str> = job
                .output_paths()
                .filter(|p| !self.storage.exists(p))
                .collect();
            if missing.is_empty() {
                outcome
            } else {
                JobOutcome::fail(format!("missing output after success: {}", missing.join(", ")))
                    .with_duration_ms(outcome.duration_ms)
            }
        } else {
            outcome
        };

        if outcome.is_success() {
            tracing::info!(job = %label, duration_ms = outcome.duration_ms, "Job succeeded");
            self.events.emit(JobEvent::JobSucceeded {
                job: label,
                duration_ms: outcome.duration_ms,
            });
            state.status[id.0] = JobStatus::Succeeded;
        } else {
            let reason = outcome
                .failure_reason
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            tracing::error!(job = %label, reason = %reason, log = ?job.log, "Job failed");
            self.events.emit(JobEvent::JobFailed {
                job: label,
                reason,
            });
            state.status[id.0] = JobStatus::Failed;

            if !self.config.keep_incomplete {
                for path in job.output_paths() {
                    if self.storage.exists(path) {
                        match self.storage.remove(path) {
                            Ok(()) => tracing::info!(path = %path, "Removed output of failed job"),
                            Err(e) => {
                                tracing::warn!(path = %path, error = %e, "Failed to remove output of failed job")
                            }
                        }
                    }
                }
            }
            if !self.config.keep_going && !state.halted {
                tracing::warn!("Stopping after first failure; running jobs will finish");
                state.halted = true;
            }
        }

        state.outcomes[id.0] = Some(outcome);
        state.settled.push_back(id);
    }
}
