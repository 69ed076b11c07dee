//! CLI binary for running and inspecting ruleflow workflows.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ruleflow_engine::{Engine, EngineConfig, ForceMode};
use ruleflow_rules::{ProjectConfig, Registry, WorkflowFile};
use ruleflow_types::FlowError;

/// Jobs ran and at least one failed.
const EXIT_JOBS_FAILED: u8 = 1;
/// Configuration or resource error; nothing ran.
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "ruleflow", version, about = "File-based rule workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workflow file
    #[arg(short = 'f', long, global = true, default_value = "Ruleflow.toml")]
    workflow: PathBuf,

    /// Project config file (default: config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory that workflow paths are relative to
    #[arg(short = 'd', long, global = true, default_value = ".")]
    workdir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Build targets (default: the workflow's targets)
    Run {
        targets: Vec<String>,

        /// Print the jobs that would run without executing anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Total execution slots (default: available CPUs)
        #[arg(short = 'j', long)]
        cores: Option<usize>,

        /// Stop dispatching new jobs after the first failure
        #[arg(long)]
        stop_on_failure: bool,

        /// Keep outputs of failed jobs
        #[arg(long)]
        keep_incomplete: bool,

        /// Rerun the jobs of the requested targets
        #[arg(long, conflicts_with = "force_all")]
        force: bool,

        /// Rerun every job
        #[arg(long)]
        force_all: bool,

        /// Write a JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Load the workflow and build the job graph without running anything
    Validate {
        targets: Vec<String>,

        #[arg(short = 'j', long)]
        cores: Option<usize>,
    },

    /// List rules with their patterns and resources
    Info,

    /// Print the job graph in Graphviz DOT format
    Dag { targets: Vec<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(flow) = e.downcast_ref::<FlowError>() {
                if flow.is_resource() {
                    eprintln!("Hint: raise --cores or lower the rule's threads");
                }
            }
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let registry = load_registry(&cli.workflow, cli.config.as_deref(), &cli.workdir)?;

    match cli.command {
        Commands::Run {
            targets,
            dry_run,
            cores,
            stop_on_failure,
            keep_incomplete,
            force,
            force_all,
            report,
        } => {
            let force = if force_all {
                ForceMode::All
            } else if force {
                ForceMode::Targets
            } else {
                ForceMode::None
            };
            let config = EngineConfig {
                workdir: cli.workdir,
                capacity: cores.unwrap_or(EngineConfig::default().capacity),
                dry_run,
                keep_going: !stop_on_failure,
                keep_incomplete,
                force,
            };
            cmd_run(registry, config, &targets, report.as_deref()).await
        }
        Commands::Validate { targets, cores } => {
            let mut config = EngineConfig {
                workdir: cli.workdir,
                ..EngineConfig::default()
            };
            if let Some(cores) = cores {
                config.capacity = cores;
            }
            cmd_validate(registry, config, &targets)
        }
        Commands::Info => {
            cmd_info(&registry);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dag { targets } => {
            let config = EngineConfig {
                workdir: cli.workdir,
                ..EngineConfig::default()
            };
            let engine = Engine::new(registry, config);
            let graph = engine.build_graph(&targets)?;
            print!("{}", graph.to_dot());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_registry(workflow: &Path, config: Option<&Path>, workdir: &Path) -> anyhow::Result<Registry> {
    let workflow_file = WorkflowFile::load(workflow)
        .with_context(|| format!("failed to load workflow {}", workflow.display()))?;

    let config_path = match config {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = workdir.join("config.toml");
            default.exists().then_some(default)
        }
    };
    let project = match config_path {
        Some(ref path) => ProjectConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ProjectConfig::default(),
    };

    Ok(Registry::load(workflow_file, &project)?)
}

async fn cmd_run(
    registry: Registry,
    config: EngineConfig,
    targets: &[String],
    report: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(registry, config);
    let summary = engine.run(targets).await?;

    println!("{summary}");
    if let Some(path) = report {
        summary
            .write_json(path)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        tracing::info!(path = %path.display(), "Run report written");
    }

    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_JOBS_FAILED))
    }
}

fn cmd_validate(registry: Registry, config: EngineConfig, targets: &[String]) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(registry, config);
    let graph = engine.build_graph(targets)?;
    let plan = engine.plan(&graph);
    println!(
        "Workflow is valid: {} rules, {} jobs, {} would run",
        engine.registry().len(),
        graph.len(),
        plan.run_count()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_info(registry: &Registry) {
    println!("Rules: {}", registry.len());
    if !registry.default_targets().is_empty() {
        println!("Default targets: {}", registry.default_targets().join(" "));
    }
    for rule in registry.rules() {
        println!("\n{}", rule.name);
        for input in &rule.inputs {
            let from = input
                .producer
                .as_ref()
                .map(|p| format!(" (from {})", p.rule))
                .unwrap_or_default();
            println!("  input:  {}{from}", input.pattern);
        }
        for output in &rule.outputs {
            let temp = if output.temp { " (temp)" } else { "" };
            println!("  output: {}{temp}", output.pattern);
        }
        if let Some(ref log) = rule.log {
            println!("  log:    {log}");
        }
        let memory = rule.resources.memory.as_deref().unwrap_or("-");
        println!("  threads={} memory={memory}", rule.resources.threads);
        if let Some(ref command) = rule.command {
            println!("  shell:  {command}");
        }
    }
}
