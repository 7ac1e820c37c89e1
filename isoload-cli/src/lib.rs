#![warn(missing_docs)]
//! isoload CLI Library
//!
//! Command-line driver for load tests whose tasks run in isolated worker
//! processes. Call `isoload::run()` (or `isoload_cli::run()`) from `main` of
//! the binary that declares your task definitions; the same binary serves as
//! the worker when re-executed with the hidden worker flag.
//!
//! # Example
//!
//! ```ignore
//! use isoload::prelude::*;
//!
//! #[derive(Default)]
//! struct MyTasks;
//!
//! #[load_tasks]
//! impl MyTasks {
//!     #[load_task]
//!     fn small_query(&self) -> anyhow::Result<Spec> {
//!         build_spec()
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     isoload::run()
//! }
//! ```

mod binding;
mod config;
mod external;
mod load;
mod process;
mod supervisor;

pub use binding::*;
pub use config::*;
pub use external::HelperExecutor;
pub use load::*;
pub use process::ExitKind;
pub use supervisor::*;

use clap::{Parser, Subcommand, ValueEnum};
use isoload_core::{DeliveryFactory, EXIT_TRANSPORT, LocalDelivery, Registry, WorkerMain};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Plain-text table
    Human,
    /// Pretty-printed JSON
    Json,
}

/// isoload CLI arguments
#[derive(Parser, Debug)]
#[command(name = "isoload")]
#[command(author, version, about = "isoload - load testing with process-isolated tasks")]
pub struct Cli {
    /// Optional subcommand (List, Run, Exec, Init); defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (default: ISOLOAD_CONFIG, then isoload.toml found upwards)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub format: ReportFormat,

    /// Output file (stdout if not specified)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Only bind operations whose name matches this regex
    #[arg(long, global = true)]
    pub filter: Option<String>,

    /// Number of virtual users (overrides config)
    #[arg(short, long, global = true)]
    pub users: Option<usize>,

    /// Run time, e.g. "60s" or "5m" (overrides config)
    #[arg(long, global = true)]
    pub run_time: Option<String>,

    /// Tasks per user before stopping (overrides config)
    #[arg(long, global = true)]
    pub iterations: Option<u64>,

    /// Per-invocation timeout, e.g. "300s" (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<String>,

    /// Isolation transport (overrides config)
    #[arg(long, value_enum, global = true)]
    pub transport: Option<TransportArg>,

    /// Internal: run one operation as a worker process (used by the executor)
    #[arg(long = "isoload-worker", hide = true, value_name = "OPERATION")]
    pub isoload_worker: Option<String>,
}

/// CLI spelling of [`Transport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// Re-executed worker with one-shot channels
    Worker,
    /// External helper program with a spec file
    Helper,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Worker => Transport::Worker,
            TransportArg::Helper => Transport::Helper,
        }
    }
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered operations and the tasks they bind to
    List,
    /// Run the load test (default)
    Run,
    /// Run a single operation once in isolation and print its payload
    Exec {
        /// Operation name
        operation: String,
    },
    /// Print a default isoload.toml
    Init,
}

/// Run the isoload CLI with the process arguments, delivering through
/// [`LocalDelivery`].
pub fn run() -> anyhow::Result<()> {
    run_with_delivery(Cli::parse(), LocalDelivery::boxed)
}

/// Run the isoload CLI with pre-parsed arguments and a custom delivery
/// backend for worker mode.
pub fn run_with_delivery(cli: Cli, factory: DeliveryFactory) -> anyhow::Result<()> {
    // Worker mode comes first and never returns
    if let Some(operation) = cli.isoload_worker.as_deref() {
        run_worker_mode(operation, factory);
    }

    if let Some(Commands::Init) = cli.command {
        print!("{}", LoadConfig::default_toml());
        return Ok(());
    }

    let mut config = LoadConfig::resolve(cli.config.as_deref())?;
    apply_overrides(&cli, &mut config);
    init_logging(if cli.verbose { "debug" } else { config.tracing_level() });

    let registry = Arc::new(Registry::discover());
    match cli.command {
        Some(Commands::List) => list_operations(&cli, &registry),
        Some(Commands::Exec { ref operation }) => exec_operation(&cli, &config, registry, operation),
        Some(Commands::Run) | None => run_load_test(&cli, &config, registry),
        Some(Commands::Init) => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run as a worker process (IPC mode)
fn run_worker_mode(operation: &str, factory: DeliveryFactory) -> ! {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    let worker = match WorkerMain::from_env() {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(target: "isoload::worker", operation, "worker error: {e}");
            std::process::exit(EXIT_TRANSPORT);
        }
    };
    let code = worker.run(operation, &Registry::discover(), factory);
    std::process::exit(code);
}

/// Layer CLI flags over the resolved configuration
fn apply_overrides(cli: &Cli, config: &mut LoadConfig) {
    if let Some(users) = cli.users {
        config.load_testing.concurrent_users = users as i64;
    }
    if let Some(run_time) = &cli.run_time {
        config.load_testing.run_time = run_time.clone();
    }
    if let Some(iterations) = cli.iterations {
        config.load_testing.iterations = Some(iterations);
    }
    if let Some(timeout) = &cli.timeout {
        config.runner.timeout = timeout.clone();
    }
    if let Some(transport) = cli.transport {
        config.runner.transport = transport.into();
    }
}

/// Resolve a bare helper name next to the current executable when present;
/// otherwise leave it to `PATH` lookup
fn resolve_helper(helper: &str) -> PathBuf {
    let path = Path::new(helper);
    if path.components().count() == 1 {
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(helper)))
            .filter(|candidate| candidate.is_file())
        {
            return sibling;
        }
    }
    path.to_path_buf()
}

/// Build the configured transport
pub fn build_executor(config: &LoadConfig, registry: Arc<Registry>) -> anyhow::Result<Arc<dyn Isolate>> {
    let grace = parse_duration(&config.runner.grace_period)?;
    let executor: Arc<dyn Isolate> = match config.runner.transport {
        Transport::Worker => Arc::new(
            IsolatedExecutor::new(config.worker_config())
                .with_registry(registry)
                .with_grace_period(grace),
        ),
        Transport::Helper => Arc::new(
            HelperExecutor::new(registry, resolve_helper(&config.runner.helper), config.worker_config())
                .with_grace_period(grace),
        ),
    };
    Ok(executor)
}

fn binder(cli: &Cli) -> anyhow::Result<TaskBinder> {
    let mut binder = TaskBinder::new().all();
    if let Some(pattern) = &cli.filter {
        binder = binder.filter(Regex::new(pattern)?);
    }
    Ok(binder)
}

fn write_output(cli: &Cli, output: &str) -> anyhow::Result<()> {
    if let Some(ref path) = cli.output {
        let mut file = std::fs::File::create(path)?;
        file.write_all(output.as_bytes())?;
        println!("Report written to: {}", path.display());
    } else {
        print!("{}", output);
    }
    Ok(())
}

fn list_operations(cli: &Cli, registry: &Registry) -> anyhow::Result<()> {
    let table = binder(cli)?.bind(registry, Arc::new(IsolatedExecutor::new(Default::default())));

    let mut owners: BTreeMap<&str, Vec<&BoundTask>> = BTreeMap::new();
    for task in table.tasks() {
        owners.entry(task.owner).or_default().push(task);
    }

    println!("isoload Tasks:");
    for (owner, tasks) in &owners {
        println!("├── {}", owner);
        for task in tasks {
            let weight = if task.weight == 1 {
                String::new()
            } else {
                format!(" [weight {}]", task.weight)
            };
            match registry.resolve(task.operation) {
                Ok(def) => println!(
                    "│   ├── {} -> {}{} ({}:{})",
                    task.name, task.operation, weight, def.file, def.line
                ),
                Err(_) => println!("│   ├── {} -> {}{}", task.name, task.operation, weight),
            }
        }
    }
    println!("{} tasks found.", table.len());
    Ok(())
}

fn exec_operation(
    cli: &Cli,
    config: &LoadConfig,
    registry: Arc<Registry>,
    operation: &str,
) -> anyhow::Result<()> {
    let timeout = parse_duration(&config.runner.timeout)?;
    let executor = build_executor(config, registry)?;

    match executor.execute(operation, timeout) {
        Ok(payload) => {
            let output = match cli.format {
                ReportFormat::Json => format!(
                    "{}\n",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "success": payload.success,
                        "summary_keys": payload.summary_keys,
                        "message": payload.message,
                        "delivered": payload.delivered_map(),
                    }))?
                ),
                ReportFormat::Human => {
                    let mut text = format!("{}\n", payload.message);
                    for (sample, files) in payload.delivered_map() {
                        text.push_str(&format!("  {}: {} file(s)\n", sample, files.len()));
                        for file in files {
                            text.push_str(&format!("    {}\n", file));
                        }
                    }
                    text
                }
            };
            write_output(cli, &output)
        }
        Err(e) => {
            if cli.format == ReportFormat::Json {
                let mut body = serde_json::json!({
                    "success": false,
                    "kind": e.kind(),
                    "error": e.to_string(),
                });
                if let Some(payload) = e.payload() {
                    body["traceback"] = payload.traceback.clone().into();
                }
                write_output(cli, &format!("{}\n", serde_json::to_string_pretty(&body)?))?;
            }
            Err(anyhow::Error::new(e).context(format!("operation '{operation}' failed")))
        }
    }
}

fn run_load_test(cli: &Cli, config: &LoadConfig, registry: Arc<Registry>) -> anyhow::Result<()> {
    config.validate()?;
    let settings = LoadSettings::from_config(config)?;
    let executor = build_executor(config, Arc::clone(&registry))?;
    let table = binder(cli)?.bind(&registry, executor);

    if table.is_empty() {
        println!("No load tasks found.");
        return Ok(());
    }

    let transport = match config.runner.transport {
        Transport::Worker => "worker",
        Transport::Helper => "helper",
    };
    println!(
        "Running {} task(s) with {} user(s) for {:?} ({} transport)...\n",
        table.len(),
        settings.users,
        settings.run_time,
        transport
    );

    let report = LoadRunner::new(table, settings).run(config)?;

    let output = match cli.format {
        ReportFormat::Json => format!("{}\n", report.to_json()?),
        ReportFormat::Human => report.format_human(),
    };
    write_output(cli, &output)?;

    if report.has_failures() {
        eprintln!(
            "\n{} of {} request(s) failed",
            report.total_failures, report.total_requests
        );
        std::process::exit(1);
    }

    Ok(())
}
