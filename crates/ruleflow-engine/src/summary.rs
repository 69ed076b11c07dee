//! Per-run summary and JSON report.

use std::path::Path;

use chrono::{DateTime, Utc};
use ruleflow_types::{JobOutcome, JobStatus, Result};
use serde::Serialize;

use crate::graph::JobGraph;
use crate::job::JobId;
use crate::staleness::{Plan, RunReason};

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub label: String,
    pub rule: String,
    pub status: JobStatus,
    /// Why the job was scheduled; `None` when it was up to date.
    pub reason: Option<RunReason>,
    pub command: Option<String>,
    pub log: Option<String>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub stderr_tail: Option<String>,
    /// Label of the directly failed job behind an upstream failure.
    pub root_cause: Option<String>,
    pub duration_ms: u64,
}

impl JobReport {
    pub(crate) fn new(graph: &JobGraph, plan: &Plan, id: JobId, status: JobStatus) -> Self {
        let job = graph.job(id);
        Self {
            id,
            label: job.label(),
            rule: job.rule.clone(),
            status,
            reason: plan.reason(id),
            command: job.command.clone(),
            log: job.log.clone(),
            exit_code: None,
            failure_reason: None,
            stderr_tail: None,
            root_cause: None,
            duration_ms: 0,
        }
    }

    pub(crate) fn with_outcome(mut self, outcome: &JobOutcome) -> Self {
        self.status = outcome.status;
        self.exit_code = outcome.exit_code;
        self.failure_reason = outcome.failure_reason.clone();
        self.stderr_tail = outcome.stderr_tail.clone();
        self.duration_ms = outcome.duration_ms;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
    pub deleted_temps: Vec<String>,
}

impl RunSummary {
    /// Summary of a dry run: scheduled jobs stay `Pending`, the rest are
    /// `Skipped`.
    pub fn planned(run_id: String, graph: &JobGraph, plan: &Plan) -> Self {
        let now = Utc::now();
        let jobs = graph
            .topological_order()
            .map(|id| {
                let status = if plan.needs_run(id) {
                    JobStatus::Pending
                } else {
                    JobStatus::Skipped
                };
                JobReport::new(graph, plan, id, status)
            })
            .collect();
        Self {
            run_id,
            dry_run: true,
            started_at: now,
            finished_at: now,
            jobs,
            deleted_temps: Vec::new(),
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn with_status(&self, status: JobStatus) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(move |j| j.status == status)
    }

    /// `true` when no job failed, directly or by propagation, and none was
    /// cancelled.
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|j| {
            !matches!(
                j.status,
                JobStatus::Failed | JobStatus::UpstreamFailed | JobStatus::Cancelled
            )
        })
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dry_run {
            let pending: Vec<&JobReport> = self.with_status(JobStatus::Pending).collect();
            writeln!(
                f,
                "Dry run: {} of {} jobs would run",
                pending.len(),
                self.jobs.len()
            )?;
            for job in pending {
                let reason = job.reason.map(|r| r.to_string()).unwrap_or_default();
                writeln!(f, "  {} ({reason})", job.label)?;
                if let Some(ref cmd) = job.command {
                    writeln!(f, "    $ {cmd}")?;
                }
            }
            return Ok(());
        }

        writeln!(
            f,
            "Run {}: {} succeeded, {} up to date, {} failed, {} failed upstream, {} cancelled ({} ms)",
            self.run_id,
            self.count(JobStatus::Succeeded),
            self.count(JobStatus::Skipped),
            self.count(JobStatus::Failed),
            self.count(JobStatus::UpstreamFailed),
            self.count(JobStatus::Cancelled),
            self.duration_ms()
        )?;
        for job in self.with_status(JobStatus::Failed) {
            write!(
                f,
                "  FAILED {}: {}",
                job.label,
                job.failure_reason.as_deref().unwrap_or("unknown error")
            )?;
            if let Some(ref log) = job.log {
                write!(f, " (log: {log})")?;
            }
            writeln!(f)?;
            if let Some(ref stderr) = job.stderr_tail {
                for line in stderr.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
                    writeln!(f, "    | {line}")?;
                }
            }
        }
        for job in self.with_status(JobStatus::UpstreamFailed) {
            writeln!(
                f,
                "  UPSTREAM FAILED {} (caused by {})",
                job.label,
                job.root_cause.as_deref().unwrap_or("?")
            )?;
        }
        for job in self.with_status(JobStatus::Cancelled) {
            writeln!(f, "  CANCELLED {}", job.label)?;
        }
        Ok(())
    }
}
