//! Run event system for observability.
//!
//! Emits [`JobEvent`]s via a [`tokio::sync::broadcast`] channel so observers
//! (progress printers, tests, report writers) can follow a run without
//! coupling to the scheduler.

use serde::{Deserialize, Serialize};

/// Events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    RunStarted {
        run_id: String,
        job_count: usize,
        to_run: usize,
        capacity: usize,
    },
    RunCompleted {
        run_id: String,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    JobStarted {
        job: String,
        rule: String,
        threads: usize,
    },
    JobSucceeded {
        job: String,
        duration_ms: u64,
    },
    JobFailed {
        job: String,
        reason: String,
    },
    JobSkipped {
        job: String,
    },
    JobUpstreamFailed {
        job: String,
        root_cause: String,
    },
    TempDeleted {
        path: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<JobEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to all current subscribers; dropped when there are none.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}
