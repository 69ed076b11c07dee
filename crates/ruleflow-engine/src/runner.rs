//! Command runners.
//!
//! The scheduler hands each job to a [`CommandRunner`]. [`ShellRunner`] runs
//! the rendered command under `bash` in its own process group; tests plug in
//! their own runners.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ruleflow_types::{JobOutcome, Result};
use tokio::io::AsyncReadExt;

use crate::job::{Job, JobId};

/// Bytes of captured stderr kept when the job has no log file.
const STDERR_TAIL_BYTES: usize = 4096;

/// Everything a runner needs to execute one job.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job: JobId,
    pub label: String,
    pub rule: String,
    pub command: String,
    pub outputs: Vec<String>,
    pub log: Option<String>,
    pub threads: usize,
    pub timeout: Option<Duration>,
}

impl RunRequest {
    /// `None` for jobs without a command.
    pub fn for_job(job: &Job) -> Option<Self> {
        let command = job.command.clone()?;
        Some(Self {
            job: job.id,
            label: job.label(),
            rule: job.rule.clone(),
            command,
            outputs: job.outputs.iter().map(|o| o.path.clone()).collect(),
            log: job.log.clone(),
            threads: job.threads,
            timeout: job.timeout,
        })
    }
}

/// Executes a job's command.
///
/// Command failures are reported in the returned [`JobOutcome`]. An `Err` is
/// reserved for the runner itself breaking and is treated as a job failure.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &RunRequest) -> Result<JobOutcome>;
}

pub type DynRunner = Arc<dyn CommandRunner>;

pub struct ShellRunner {
    workdir: PathBuf,
    shell: String,
    kill_grace: Duration,
}

impl ShellRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            shell: "bash".to_string(),
            kill_grace: Duration::from_secs(2),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn open_log(&self, log: &str) -> std::io::Result<std::fs::File> {
        let path = self.workdir.join(log);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).append(true).open(path)
    }
}

/// Keep the last `max` bytes of `text`, cut at a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...(truncated){}", &text[start..])
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: &RunRequest) -> Result<JobOutcome> {
        let start = tokio::time::Instant::now();

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(format!("set -euo pipefail; {}", request.command))
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit());

        match &request.log {
            Some(log) => match self.open_log(log) {
                Ok(file) => {
                    cmd.stderr(Stdio::from(file));
                }
                Err(e) => {
                    return Ok(JobOutcome::fail(format!("cannot open log '{log}': {e}")));
                }
            },
            None => {
                cmd.stderr(Stdio::piped());
            }
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        tracing::debug!(job = %request.label, command = %request.command, "Spawning command");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(JobOutcome::fail(format!(
                    "failed to spawn '{}': {e}",
                    self.shell
                )))
            }
        };

        // Drain stderr concurrently so a chatty command never blocks on the pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = match request.timeout {
            Some(limit) => {
                tokio::select! {
                    status = child.wait() => Some(status?),
                    _ = tokio::time::sleep(limit) => {
                        #[cfg(unix)]
                        {
                            let group = child.id().map(|pid| -(pid as i32));
                            if let Some(group) = group {
                                // SAFETY: signalling our own child's process group.
                                unsafe { libc::kill(group, libc::SIGTERM); }
                            }
                            tokio::select! {
                                _ = child.wait() => {}
                                _ = tokio::time::sleep(self.kill_grace) => {}
                            }
                            // Members that ignored SIGTERM would hold the stderr pipe open.
                            if let Some(group) = group {
                                // SAFETY: as above; ESRCH once the group is gone.
                                unsafe { libc::kill(group, libc::SIGKILL); }
                            }
                            let _ = child.wait().await;
                        }
                        #[cfg(not(unix))]
                        {
                            let _ = child.kill().await;
                        }
                        None
                    }
                }
            }
            None => Some(child.wait().await?),
        };

        let stderr = match stderr_reader {
            Some(handle) => {
                let bytes = handle.await.unwrap_or_default();
                tail(&String::from_utf8_lossy(&bytes), STDERR_TAIL_BYTES)
            }
            None => String::new(),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match status {
            None => {
                let limit = request.timeout.unwrap_or_default();
                JobOutcome::fail(format!("timed out after {limit:?}"))
            }
            Some(status) if status.success() => JobOutcome::success(),
            Some(status) => match status.code() {
                Some(code) => JobOutcome::fail(format!("exit status {code}")).with_exit_code(code),
                None => JobOutcome::fail("terminated by signal"),
            },
        };

        tracing::debug!(
            job = %request.label,
            success = outcome.is_success(),
            duration_ms,
            "Command finished"
        );

        Ok(outcome.with_duration_ms(duration_ms).with_stderr_tail(stderr))
    }
}
