//! Shared types and errors for the ruleflow workflow engine.
//!
//! This crate provides the foundational types used across all other ruleflow crates:
//! - `FlowError`: unified error taxonomy
//! - `JobStatus`: lifecycle state of a scheduled job
//! - `JobOutcome`: result of executing one job's command

use serde::{Deserialize, Serialize};

/// Unified error type for all ruleflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // === Configuration Errors ===
    #[error("Ambiguous producer for '{path}': matched by {}", candidates.join(", "))]
    AmbiguousProducer {
        path: String,
        candidates: Vec<String>,
    },

    #[error("No rule produces '{path}' and the file does not exist")]
    NoProducer { path: String },

    #[error("Missing input '{path}' for rule '{rule}': no rule produces it and the file does not exist")]
    UnresolvableInput { path: String, rule: String },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Rule '{rule}' keeps matching its own output: {}", chain.join(" -> "))]
    PeriodicWildcard { rule: String, chain: Vec<String> },

    #[error("Dependency chain deeper than {limit} jobs at '{job}'")]
    DependencyTooDeep { job: String, limit: usize },

    #[error("Unbound placeholder '{{{name}}}' in rule '{rule}' ({context})")]
    UnboundPlaceholder {
        rule: String,
        name: String,
        context: String,
    },

    #[error("Output '{path}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    // === Resource Errors ===
    #[error("Job '{job}' requires {threads} threads but total capacity is {capacity}")]
    ThreadsExceedCapacity {
        job: String,
        threads: usize,
        capacity: usize,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Returns `true` for errors caused by the workflow definition or config.
    ///
    /// These are always raised before any job starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlowError::AmbiguousProducer { .. }
                | FlowError::NoProducer { .. }
                | FlowError::UnresolvableInput { .. }
                | FlowError::CyclicDependency { .. }
                | FlowError::PeriodicWildcard { .. }
                | FlowError::DependencyTooDeep { .. }
                | FlowError::UnboundPlaceholder { .. }
                | FlowError::DuplicateOutput { .. }
                | FlowError::InvalidPattern { .. }
                | FlowError::InvalidRule { .. }
                | FlowError::InvalidConfig(_)
                | FlowError::Toml(_)
        )
    }

    /// Returns `true` when a job's resource request can never be satisfied.
    pub fn is_resource(&self) -> bool {
        matches!(self, FlowError::ThreadsExceedCapacity { .. })
    }
}

/// A convenience alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// JobStatus: lifecycle state of a job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Never executed because a job it depends on failed.
    UpstreamFailed,
    /// Outputs were already up to date.
    Skipped,
    /// Never started because the run stopped at the first failure.
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::UpstreamFailed
                | JobStatus::Skipped
                | JobStatus::Cancelled
        )
    }

    /// Whether dependents of a job in this state may proceed.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::UpstreamFailed => "upstream_failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JobOutcome: result of executing a job's command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    /// Tail of the captured stderr when no log file was declared.
    pub stderr_tail: Option<String>,
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Create a successful outcome.
    pub fn success() -> Self {
        Self {
            status: JobStatus::Succeeded,
            exit_code: Some(0),
            failure_reason: None,
            stderr_tail: None,
            duration_ms: 0,
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code: None,
            failure_reason: Some(reason.into()),
            stderr_tail: None,
            duration_ms: 0,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_stderr_tail(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.is_empty() {
            self.stderr_tail = Some(stderr);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}
