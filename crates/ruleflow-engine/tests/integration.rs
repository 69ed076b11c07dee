//! End-to-end tests for the ruleflow engine.
//!
//! Each test exercises the full invocation: load registry -> build graph ->
//! plan -> schedule -> verify files and summary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use ruleflow_engine::{
    CommandRunner, Engine, EngineConfig, ForceMode, JobEvent, RunRequest, RunSummary,
};
use ruleflow_rules::{ProjectConfig, Registry};
use ruleflow_types::{FlowError, JobOutcome, JobStatus, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TWO_SAMPLES: &str = r#"
[workflow]
targets = ["out/{sample}.trim"]

[[rule]]
name = "concat"
input = ["input/{s}"]
output = [{ path = "temp/{s}.fastq", temp = true }]
shell = "cat {input} {input} > {output}"

[[rule]]
name = "trim"
input = ["temp/{s}.fastq"]
output = ["out/{s}.trim"]
log = "logs/trim/{s}.log"
shell = "tr a-z A-Z < {input} > {output}"
"#;

const CONFIG: &str = "samples = [\"A\", \"B\"]\n";

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("input")).unwrap();
    std::fs::write(dir.path().join("input/A"), "aaa\n").unwrap();
    std::fs::write(dir.path().join("input/B"), "bbb\n").unwrap();
    dir
}

fn registry(workflow: &str) -> Registry {
    let config = ProjectConfig::from_toml(CONFIG).unwrap();
    Registry::from_toml(workflow, &config).unwrap()
}

fn config(dir: &Path, capacity: usize) -> EngineConfig {
    EngineConfig {
        workdir: dir.to_path_buf(),
        capacity,
        ..EngineConfig::default()
    }
}

fn statuses(summary: &RunSummary) -> Vec<(String, JobStatus)> {
    summary
        .jobs
        .iter()
        .map(|j| (j.label.clone(), j.status))
        .collect()
}

fn status_of(summary: &RunSummary, label: &str) -> JobStatus {
    summary
        .jobs
        .iter()
        .find(|j| j.label == label)
        .unwrap_or_else(|| panic!("no job {label}"))
        .status
}

/// Runner that writes every declared output and tracks concurrency.
struct FakeRunner {
    workdir: PathBuf,
    delay: Duration,
    fail: Vec<String>,
    write_outputs: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            delay: Duration::from_millis(50),
            fail: Vec::new(),
            write_outputs: true,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, label: &str) -> Self {
        self.fail.push(label.to_string());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, request: &RunRequest) -> Result<JobOutcome> {
        self.calls.lock().unwrap().push(request.label.clone());
        let now = self.in_flight.fetch_add(request.threads, Ordering::SeqCst) + request.threads;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        if self.write_outputs {
            for out in &request.outputs {
                std::fs::write(self.workdir.join(out), &request.label)?;
            }
        }

        self.in_flight.fetch_sub(request.threads, Ordering::SeqCst);
        if self.fail.contains(&request.label) {
            Ok(JobOutcome::fail("exit status 1").with_exit_code(1))
        } else {
            Ok(JobOutcome::success())
        }
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

// ---------------------------------------------------------------------------
// Two samples, two chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_sample_workflow_runs_with_real_shell() {
    let dir = workspace();
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2));

    let summary = engine.run(&[]).await.expect("run should start");
    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.jobs.len(), 4);
    assert_eq!(summary.count(JobStatus::Succeeded), 4);

    assert_eq!(
        std::fs::read_to_string(dir.path().join("out/A.trim")).unwrap(),
        "AAA\nAAA\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out/B.trim")).unwrap(),
        "BBB\nBBB\n"
    );
    // Temps are gone once their consumer finished; logs were created.
    assert!(!dir.path().join("temp/A.fastq").exists());
    assert!(!dir.path().join("temp/B.fastq").exists());
    assert!(dir.path().join("logs/trim/A.log").exists());
    let mut deleted = summary.deleted_temps.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["temp/A.fastq", "temp/B.fastq"]);
}

#[tokio::test]
async fn capacity_two_runs_both_chains_concurrently() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner.clone());

    let summary = engine.run(&[]).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(runner.calls().len(), 4);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn running_threads_never_exceed_capacity() {
    let dir = workspace();
    for s in ["C", "D", "E"] {
        std::fs::write(dir.path().join("input").join(s), "x").unwrap();
    }
    let workflow = r#"
[[rule]]
name = "heavy"
input = ["input/{s}"]
output = ["out/{s}.heavy"]
threads = 2
"#;
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(workflow), config(dir.path(), 3)).with_runner(runner.clone());

    let targets: Vec<String> = ["A", "B", "C", "D", "E"]
        .iter()
        .map(|s| format!("out/{s}.heavy"))
        .collect();
    let summary = engine.run(&targets).await.unwrap();
    assert_eq!(summary.count(JobStatus::Succeeded), 5);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn second_run_does_no_work() {
    let dir = workspace();
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2));
    assert!(engine.run(&[]).await.unwrap().is_success());

    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner.clone());
    let summary = engine.run(&[]).await.unwrap();

    assert!(runner.calls().is_empty(), "ran: {:?}", runner.calls());
    assert_eq!(summary.count(JobStatus::Skipped), 4);
    assert!(summary.deleted_temps.is_empty());
}

#[tokio::test]
async fn touching_one_input_reruns_only_its_chain() {
    let dir = workspace();
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2));
    assert!(engine.run(&[]).await.unwrap().is_success());

    set_mtime(
        &dir.path().join("input/A"),
        SystemTime::now() + Duration::from_secs(60),
    );

    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner.clone());
    let summary = engine.run(&[]).await.unwrap();

    let mut calls = runner.calls();
    calls.sort();
    assert_eq!(calls, vec!["concat[s=A]", "trim[s=A]"]);
    assert_eq!(status_of(&summary, "concat[s=B]"), JobStatus::Skipped);
    assert_eq!(status_of(&summary, "trim[s=B]"), JobStatus::Skipped);
    assert_eq!(summary.deleted_temps, vec!["temp/A.fastq"]);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_propagates_downstream_and_spares_other_chains() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()).failing("concat[s=A]"));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner.clone());

    let summary = engine.run(&[]).await.unwrap();
    assert!(!summary.is_success());
    assert_eq!(status_of(&summary, "concat[s=A]"), JobStatus::Failed);
    assert_eq!(status_of(&summary, "trim[s=A]"), JobStatus::UpstreamFailed);
    assert_eq!(status_of(&summary, "concat[s=B]"), JobStatus::Succeeded);
    assert_eq!(status_of(&summary, "trim[s=B]"), JobStatus::Succeeded);

    let trim_a = summary.jobs.iter().find(|j| j.label == "trim[s=A]").unwrap();
    assert_eq!(trim_a.root_cause.as_deref(), Some("concat[s=A]"));
    assert!(!runner.calls().contains(&"trim[s=A]".to_string()));

    // The partial output of the failed job is removed.
    assert!(!dir.path().join("temp/A.fastq").exists());
    assert!(dir.path().join("out/B.trim").exists());
}

#[tokio::test]
async fn keep_incomplete_leaves_failed_outputs() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()).failing("concat[s=A]"));
    let mut cfg = config(dir.path(), 2);
    cfg.keep_incomplete = true;
    let engine = Engine::new(registry(TWO_SAMPLES), cfg).with_runner(runner);

    let summary = engine.run(&["out/A.trim".to_string()]).await.unwrap();
    assert_eq!(summary.count(JobStatus::Failed), 1);
    assert!(dir.path().join("temp/A.fastq").exists());
}

#[tokio::test]
async fn stop_on_failure_cancels_unstarted_jobs() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()).failing("concat[s=A]"));
    let mut cfg = config(dir.path(), 1);
    cfg.keep_going = false;
    let engine = Engine::new(registry(TWO_SAMPLES), cfg).with_runner(runner.clone());

    let summary = engine.run(&[]).await.unwrap();
    assert_eq!(runner.calls(), vec!["concat[s=A]"]);
    assert_eq!(
        statuses(&summary),
        vec![
            ("concat[s=A]".to_string(), JobStatus::Failed),
            ("trim[s=A]".to_string(), JobStatus::UpstreamFailed),
            ("concat[s=B]".to_string(), JobStatus::Cancelled),
            ("trim[s=B]".to_string(), JobStatus::Cancelled),
        ]
    );
}

#[tokio::test]
async fn missing_output_after_success_fails_the_job() {
    let dir = workspace();
    let mut runner = FakeRunner::new(dir.path());
    runner.write_outputs = false;
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(Arc::new(runner));

    let summary = engine.run(&["out/A.trim".to_string()]).await.unwrap();
    let concat = summary.jobs.iter().find(|j| j.label == "concat[s=A]").unwrap();
    assert_eq!(concat.status, JobStatus::Failed);
    assert!(concat.failure_reason.as_deref().unwrap().contains("missing output"));
}

#[tokio::test]
async fn shell_failure_is_reported_with_exit_code() {
    let dir = workspace();
    let workflow = r#"
[[rule]]
name = "broken"
input = ["input/{s}"]
output = ["out/{s}.txt"]
shell = "echo partial > {output}; exit 3"
"#;
    let engine = Engine::new(registry(workflow), config(dir.path(), 1));
    let summary = engine.run(&["out/A.txt".to_string()]).await.unwrap();
    let job = &summary.jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, Some(3));
    assert!(!dir.path().join("out/A.txt").exists());
}

// ---------------------------------------------------------------------------
// Configuration errors surface before anything runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unbound_placeholder_is_caught_before_execution() {
    let dir = workspace();
    let workflow = r#"
[[rule]]
name = "sort"
input = ["input/{s}"]
output = ["sorted/{s}.bam"]
shell = "samtools sort {x}.bam -o {output}"
"#;
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(workflow), config(dir.path(), 2)).with_runner(runner.clone());

    let err = engine.run(&["sorted/A.bam".to_string()]).await.unwrap_err();
    assert!(matches!(err, FlowError::UnboundPlaceholder { ref name, .. } if name == "x"));
    assert!(err.is_configuration());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn cycle_is_a_configuration_error() {
    let dir = workspace();
    let workflow = r#"
[[rule]]
name = "a"
input = ["{s}.b"]
output = ["{s}.a"]
[[rule]]
name = "b"
input = ["{s}.a"]
output = ["{s}.b"]
"#;
    let engine = Engine::new(registry(workflow), config(dir.path(), 1));
    let err = engine.run(&["x.a".to_string()]).await.unwrap_err();
    assert!(matches!(err, FlowError::CyclicDependency { .. }));
}

#[tokio::test]
async fn ambiguous_target_is_rejected() {
    let dir = workspace();
    let workflow = r#"
[[rule]]
name = "a"
output = ["{x}.bam"]
[[rule]]
name = "b"
output = ["sorted.{y}"]
"#;
    let engine = Engine::new(registry(workflow), config(dir.path(), 1));
    let err = engine.run(&["sorted.bam".to_string()]).await.unwrap_err();
    assert!(matches!(err, FlowError::AmbiguousProducer { .. }));
}

// ---------------------------------------------------------------------------
// Dry run, forcing, aggregates, events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_executes_nothing() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let mut cfg = config(dir.path(), 2);
    cfg.dry_run = true;
    let engine = Engine::new(registry(TWO_SAMPLES), cfg).with_runner(runner.clone());

    let summary = engine.run(&[]).await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.count(JobStatus::Pending), 4);
    assert!(runner.calls().is_empty());
    assert!(!dir.path().join("out").exists());

    let text = summary.to_string();
    assert!(text.contains("4 of 4 jobs would run"));
    assert!(text.contains("$ tr a-z A-Z < temp/A.fastq > out/A.trim"));
}

#[tokio::test]
async fn force_targets_reruns_only_requested_jobs() {
    let dir = workspace();
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2));
    assert!(engine.run(&[]).await.unwrap().is_success());

    let runner = Arc::new(FakeRunner::new(dir.path()));
    let mut cfg = config(dir.path(), 2);
    cfg.force = ForceMode::Targets;
    let engine = Engine::new(registry(TWO_SAMPLES), cfg).with_runner(runner.clone());
    let summary = engine.run(&["out/B.trim".to_string()]).await.unwrap();

    // The reaped temp input is needed again, so its producer reruns too.
    let mut calls = runner.calls();
    calls.sort();
    assert_eq!(calls, vec!["concat[s=B]", "trim[s=B]"]);
    assert!(summary.is_success());
}

#[tokio::test]
async fn aggregate_rule_without_command_succeeds() {
    let dir = workspace();
    let workflow = format!(
        "{TWO_SAMPLES}\n[[rule]]\nname = \"all\"\ninput = [\"out/A.trim\", \"out/B.trim\"]\n"
    );
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(&workflow), config(dir.path(), 2)).with_runner(runner.clone());

    let summary = engine.run(&["all".to_string()]).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(status_of(&summary, "all"), JobStatus::Succeeded);
    assert_eq!(runner.calls().len(), 4);
}

#[tokio::test]
async fn events_follow_the_run() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner);
    let mut rx = engine.events().subscribe();

    engine.run(&[]).await.unwrap();

    let mut started = 0;
    let mut deleted = 0;
    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            JobEvent::JobStarted { .. } => started += 1,
            JobEvent::TempDeleted { .. } => deleted += 1,
            JobEvent::RunCompleted { succeeded, .. } => {
                assert_eq!(succeeded, 4);
                completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(started, 4);
    assert_eq!(deleted, 2);
    assert!(completed);
}

#[tokio::test]
async fn report_is_written_as_json() {
    let dir = workspace();
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let engine = Engine::new(registry(TWO_SAMPLES), config(dir.path(), 2)).with_runner(runner);
    let summary = engine.run(&[]).await.unwrap();

    let path = dir.path().join("report.json");
    summary.write_json(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["jobs"].as_array().unwrap().len(), 4);
    assert_eq!(json["jobs"][0]["status"], "succeeded");
}
