//! Engine facade: registry in, run summary out.
//!
//! Implements the invocation lifecycle: build the job graph, compute the
//! staleness plan, then either report the plan (dry run) or hand it to the
//! scheduler.

use std::path::PathBuf;
use std::sync::Arc;

use ruleflow_rules::Registry;
use ruleflow_types::Result;

use crate::events::EventEmitter;
use crate::graph::{GraphBuilder, JobGraph};
use crate::runner::{DynRunner, ShellRunner};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::staleness::{ForceMode, Plan};
use crate::storage::{LocalStorage, Storage};
use crate::summary::RunSummary;

/// Configuration for one invocation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory that workflow paths are relative to and commands run in.
    pub workdir: PathBuf,
    pub capacity: usize,
    pub dry_run: bool,
    pub keep_going: bool,
    pub keep_incomplete: bool,
    pub force: ForceMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            capacity: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dry_run: false,
            keep_going: true,
            keep_incomplete: false,
            force: ForceMode::None,
        }
    }
}

pub struct Engine {
    registry: Registry,
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    runner: DynRunner,
    events: EventEmitter,
}

impl Engine {
    /// Engine over the local filesystem, running commands with `bash`.
    pub fn new(registry: Registry, config: EngineConfig) -> Self {
        let storage = Arc::new(LocalStorage::new(config.workdir.clone()));
        let runner = Arc::new(ShellRunner::new(config.workdir.clone()));
        Self {
            registry,
            config,
            storage,
            runner,
            events: EventEmitter::default(),
        }
    }

    pub fn with_runner(mut self, runner: DynRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// `targets`, or the workflow's default targets when empty.
    fn effective_targets(&self, targets: &[String]) -> Vec<String> {
        if targets.is_empty() {
            self.registry.default_targets().to_vec()
        } else {
            targets.to_vec()
        }
    }

    pub fn build_graph(&self, targets: &[String]) -> Result<JobGraph> {
        let targets = self.effective_targets(targets);
        if targets.is_empty() {
            tracing::warn!("No targets requested and the workflow declares no default targets");
        }
        GraphBuilder::new(&self.registry, self.storage.as_ref(), self.config.capacity).build(&targets)
    }

    pub fn plan(&self, graph: &JobGraph) -> Plan {
        Plan::compute(graph, self.storage.as_ref(), self.config.force)
    }

    /// Build, plan and (unless dry run) execute.
    ///
    /// Configuration and resource errors are returned before any job starts.
    /// Job failures are reported in the summary.
    pub async fn run(&self, targets: &[String]) -> Result<RunSummary> {
        let graph = self.build_graph(targets)?;
        let plan = self.plan(&graph);
        Ok(self.execute(&graph, &plan).await)
    }

    pub async fn execute(&self, graph: &JobGraph, plan: &Plan) -> RunSummary {
        let run_id = uuid::Uuid::new_v4().to_string();
        if self.config.dry_run {
            tracing::info!(run_id = %run_id, to_run = plan.run_count(), "Dry run, nothing executed");
            return RunSummary::planned(run_id, graph, plan);
        }
        let scheduler = Scheduler::new(
            graph,
            plan,
            Arc::clone(&self.storage),
            Arc::clone(&self.runner),
            self.events.clone(),
            SchedulerConfig {
                capacity: self.config.capacity,
                keep_going: self.config.keep_going,
                keep_incomplete: self.config.keep_incomplete,
            },
        );
        scheduler.run(run_id).await
    }
}
