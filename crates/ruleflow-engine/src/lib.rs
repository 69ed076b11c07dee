//! Job graph construction, staleness planning, and parallel execution.
//!
//! This crate turns a [`ruleflow_rules::Registry`] and a set of requested
//! targets into a DAG of concrete jobs, decides which jobs are stale, runs
//! them under a thread budget, and reaps temp files once every consumer is
//! done.

pub mod engine;
pub mod events;
pub mod graph;
pub mod job;
pub mod reaper;
pub mod render;
pub mod resolve;
pub mod runner;
pub mod scheduler;
pub mod staleness;
pub mod storage;
pub mod summary;

pub use engine::{Engine, EngineConfig};
pub use events::{EventEmitter, JobEvent};
pub use graph::{GraphBuilder, JobGraph};
pub use job::{Job, JobId, JobInput, JobOutput};
pub use reaper::TempReaper;
pub use render::{render, render_params, render_template};
pub use resolve::{job_label, resolve, Resolution};
pub use runner::{CommandRunner, DynRunner, RunRequest, ShellRunner};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use staleness::{ForceMode, Plan, RunReason};
pub use storage::{normalize_path, LocalStorage, Storage};
pub use summary::{JobReport, RunSummary};
