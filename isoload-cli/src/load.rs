//! Load Generation
//!
//! Virtual users run on a dedicated rayon pool, one thread each, so every
//! user performs at most one isolated invocation at a time while all users
//! run concurrently. Each invocation is timed and collected into a
//! [`LoadReport`].

use crate::binding::TaskTable;
use crate::config::{LoadConfig, parse_duration};
use crate::supervisor::DEFAULT_TIMEOUT;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

/// Per-user lifecycle hooks.
///
/// The defaults log the user's start and stop and validate the
/// configuration; a user whose `on_start` fails runs no tasks.
pub trait User: Send + Sync {
    /// Called once before the user's first task
    fn on_start(&self, user_id: usize, config: &LoadConfig) -> anyhow::Result<()> {
        tracing::info!(target: "isoload::load", user_id, "ServiceX user starting (isolated mode)");
        tracing::info!(target: "isoload::load", user_id, "ServiceX endpoint: {}", config.servicex.endpoint);
        if let Err(e) = config.validate() {
            tracing::error!(target: "isoload::load", user_id, "{e}");
            return Err(e);
        }
        Ok(())
    }

    /// Called once after the user's last task
    fn on_stop(&self, user_id: usize) {
        tracing::info!(target: "isoload::load", user_id, "ServiceX user stopping");
    }
}

/// User with the default hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUser;

impl User for DefaultUser {}

/// Resolved load-generation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    /// Number of virtual users
    pub users: usize,
    /// Users started per second
    pub spawn_rate: f64,
    /// Wall-clock bound for the whole run
    pub run_time: Duration,
    /// Shortest pause between a user's tasks
    pub wait_min: Duration,
    /// Longest pause between a user's tasks
    pub wait_max: Duration,
    /// Tasks per user, unbounded when `None`
    pub iterations: Option<u64>,
    /// Per-invocation timeout
    pub timeout: Duration,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            users: 1,
            spawn_rate: 1.0,
            run_time: Duration::from_secs(60),
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(5),
            iterations: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LoadSettings {
    /// Read the load-testing and runner sections
    pub fn from_config(config: &LoadConfig) -> anyhow::Result<Self> {
        let load = &config.load_testing;
        Ok(Self {
            users: load.concurrent_users.max(1) as usize,
            spawn_rate: load.spawn_rate,
            run_time: parse_duration(&load.run_time)?,
            wait_min: parse_duration(&load.wait_min)?,
            wait_max: parse_duration(&load.wait_max)?,
            iterations: load.iterations,
            timeout: parse_duration(&config.runner.timeout)?,
        })
    }

    fn spawn_interval(&self) -> Duration {
        if self.spawn_rate > 0.0 && self.spawn_rate.is_finite() {
            Duration::from_secs_f64(1.0 / self.spawn_rate)
        } else {
            Duration::ZERO
        }
    }

    fn pause<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.wait_max > self.wait_min {
            rng.gen_range(self.wait_min..=self.wait_max)
        } else {
            self.wait_min
        }
    }
}

/// One timed invocation
#[derive(Debug, Clone)]
pub struct TaskSample {
    /// Task name
    pub task: String,
    /// User that ran it
    pub user_id: usize,
    /// Wall-clock time of the invocation
    pub elapsed: Duration,
    /// Failure message, if the invocation failed
    pub error: Option<String>,
}

/// Drives virtual users against a task table
pub struct LoadRunner {
    tasks: TaskTable,
    settings: LoadSettings,
    user: Arc<dyn User>,
}

impl LoadRunner {
    /// Runner with [`DefaultUser`] hooks
    pub fn new(tasks: TaskTable, settings: LoadSettings) -> Self {
        Self {
            tasks,
            settings,
            user: Arc::new(DefaultUser),
        }
    }

    /// Use custom lifecycle hooks
    pub fn with_user(mut self, user: Arc<dyn User>) -> Self {
        self.user = user;
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    /// Run every user to completion and summarize
    pub fn run(&self, config: &LoadConfig) -> anyhow::Result<LoadReport> {
        if self.tasks.is_empty() {
            anyhow::bail!("No load tasks bound; nothing to run");
        }

        let users = self.settings.users.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(users)
            .thread_name(|i| format!("isoload-user-{i}"))
            .build()?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} requests {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));

        let (tx, rx) = mpsc::channel::<TaskSample>();
        let collector_pb = pb.clone();
        let collector = std::thread::Builder::new()
            .name("isoload-collector".to_string())
            .spawn(move || {
                let mut samples = Vec::new();
                let mut failures = 0u64;
                for sample in rx {
                    if sample.error.is_some() {
                        failures += 1;
                        collector_pb.set_message(format!("({failures} failed)"));
                    }
                    collector_pb.inc(1);
                    samples.push(sample);
                }
                samples
            })?;

        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + self.settings.run_time;
        let interval = self.settings.spawn_interval();

        tracing::info!(
            target: "isoload::load",
            users,
            spawn_rate = self.settings.spawn_rate,
            run_time = ?self.settings.run_time,
            tasks = ?self.tasks.names(),
            "starting load test"
        );

        pool.scope(|s| {
            for user_id in 0..users {
                if user_id > 0 && !interval.is_zero() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(interval.min(deadline - now));
                }
                let tx = tx.clone();
                s.spawn(move |_| self.run_user(user_id, config, deadline, tx));
            }
        });
        drop(tx);

        let samples = collector
            .join()
            .map_err(|_| anyhow::anyhow!("result collector panicked"))?;
        pb.finish_with_message("done");

        Ok(LoadReport::from_samples(
            started_at,
            start.elapsed(),
            users,
            &samples,
        ))
    }

    fn run_user(&self, user_id: usize, config: &LoadConfig, deadline: Instant, tx: Sender<TaskSample>) {
        if self.user.on_start(user_id, config).is_err() {
            return;
        }

        let mut rng = rand::thread_rng();
        let mut completed = 0u64;
        while Instant::now() < deadline {
            let Some(task) = self.tasks.choose(&mut rng) else {
                break;
            };

            let start = Instant::now();
            let outcome = task.run(self.settings.timeout);
            let elapsed = start.elapsed();
            completed += 1;

            let error = outcome.err().map(|e| e.to_string());
            if let Some(message) = &error {
                tracing::error!(target: "isoload::load", user_id, task = %task.name, "task failed: {message}");
            }
            if tx
                .send(TaskSample {
                    task: task.name.clone(),
                    user_id,
                    elapsed,
                    error,
                })
                .is_err()
            {
                break;
            }

            if self.settings.iterations.is_some_and(|n| completed >= n) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(self.settings.pause(&mut rng).min(deadline - now));
        }

        self.user.on_stop(user_id);
    }
}

/// Linearly interpolated percentile of unsorted values
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let rank = (p / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let fraction = rank - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// Latency and failure summary for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Task name
    pub name: String,
    /// Invocations started
    pub requests: u64,
    /// Invocations that failed
    pub failures: u64,
    /// Fastest invocation (ms)
    pub min_ms: f64,
    /// Mean invocation time (ms)
    pub avg_ms: f64,
    /// Median invocation time (ms)
    pub median_ms: f64,
    /// 95th percentile (ms)
    pub p95_ms: f64,
    /// Slowest invocation (ms)
    pub max_ms: f64,
    /// Distinct failure messages and their counts
    pub failure_messages: BTreeMap<String, u64>,
}

impl TaskStats {
    fn from_samples(name: &str, samples: &[&TaskSample]) -> Self {
        let latencies: Vec<f64> = samples
            .iter()
            .map(|s| s.elapsed.as_secs_f64() * 1000.0)
            .collect();
        let mut failure_messages = BTreeMap::new();
        for message in samples.iter().filter_map(|s| s.error.as_ref()) {
            *failure_messages.entry(message.clone()).or_insert(0) += 1;
        }

        let (min_ms, max_ms, avg_ms) = if latencies.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                latencies.iter().copied().fold(f64::INFINITY, f64::min),
                latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                latencies.iter().sum::<f64>() / latencies.len() as f64,
            )
        };

        Self {
            name: name.to_string(),
            requests: samples.len() as u64,
            failures: failure_messages.values().sum(),
            min_ms,
            avg_ms,
            median_ms: percentile(&latencies, 50.0),
            p95_ms: percentile(&latencies, 95.0),
            max_ms,
            failure_messages,
        }
    }
}

/// Outcome of a load-test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration (seconds)
    pub duration_secs: f64,
    /// Virtual users
    pub users: usize,
    /// All invocations
    pub total_requests: u64,
    /// All failed invocations
    pub total_failures: u64,
    /// Per-task summaries, ordered by task name
    pub tasks: Vec<TaskStats>,
}

impl LoadReport {
    /// Summarize collected samples
    pub fn from_samples(
        started_at: DateTime<Utc>,
        duration: Duration,
        users: usize,
        samples: &[TaskSample],
    ) -> Self {
        let mut by_task: BTreeMap<&str, Vec<&TaskSample>> = BTreeMap::new();
        for sample in samples {
            by_task.entry(sample.task.as_str()).or_default().push(sample);
        }
        let tasks: Vec<TaskStats> = by_task
            .iter()
            .map(|(name, samples)| TaskStats::from_samples(name, samples))
            .collect();

        Self {
            started_at,
            duration_secs: duration.as_secs_f64(),
            users,
            total_requests: tasks.iter().map(|t| t.requests).sum(),
            total_failures: tasks.iter().map(|t| t.failures).sum(),
            tasks,
        }
    }

    /// Whether any invocation failed
    pub fn has_failures(&self) -> bool {
        self.total_failures > 0
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text table
    pub fn format_human(&self) -> String {
        let mut output = String::new();
        output.push('\n');
        output.push_str("isoload Results\n");
        output.push_str(&"=".repeat(92));
        output.push('\n');
        output.push_str(&format!(
            "Started {} | {:.1}s | {} user(s)\n\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.duration_secs,
            self.users
        ));
        output.push_str(&format!(
            "{:<32} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
            "Task", "Reqs", "Fails", "Min", "Avg", "Median", "p95", "Max"
        ));
        output.push_str(&"-".repeat(92));
        output.push('\n');

        for task in &self.tasks {
            output.push_str(&format!(
                "{:<32} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
                task.name,
                task.requests,
                task.failures,
                format_ms(task.min_ms),
                format_ms(task.avg_ms),
                format_ms(task.median_ms),
                format_ms(task.p95_ms),
                format_ms(task.max_ms),
            ));
        }
        output.push_str(&"-".repeat(92));
        output.push('\n');
        output.push_str(&format!(
            "{:<32} {:>8} {:>8}\n",
            "Total", self.total_requests, self.total_failures
        ));

        let failures: Vec<_> = self
            .tasks
            .iter()
            .flat_map(|t| t.failure_messages.iter().map(move |(m, c)| (&t.name, m, c)))
            .collect();
        if !failures.is_empty() {
            output.push_str("\nFailures\n");
            for (task, message, count) in failures {
                output.push_str(&format!("  {count:>5}x {task}: {message}\n"));
            }
        }
        output
    }
}

fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.0}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::TaskBinder;
    use crate::supervisor::{ExecutionError, Isolate};
    use isoload_core::{OperationDef, OperationError, Registry, Spec};
    use isoload_ipc::ResultPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample(task: &str, ms: u64, error: Option<&str>) -> TaskSample {
        TaskSample {
            task: task.to_string(),
            user_id: 0,
            elapsed: Duration::from_millis(ms),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn percentile_interpolates() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 50.0), 30.0);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 50.0);
        assert!((percentile(&values, 95.0) - 48.0).abs() < 1e-9);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn report_groups_samples_per_task() {
        let samples = vec![
            sample("a_task", 100, None),
            sample("a_task", 300, Some("timed out")),
            sample("a_task", 200, Some("timed out")),
            sample("b_task", 50, None),
        ];
        let report = LoadReport::from_samples(Utc::now(), Duration::from_secs(2), 2, &samples);

        assert_eq!(report.total_requests, 4);
        assert_eq!(report.total_failures, 2);
        assert!(report.has_failures());

        let a = &report.tasks[0];
        assert_eq!(a.name, "a_task");
        assert_eq!(a.requests, 3);
        assert_eq!(a.failures, 2);
        assert_eq!(a.min_ms, 100.0);
        assert_eq!(a.max_ms, 300.0);
        assert_eq!(a.median_ms, 200.0);
        assert_eq!(a.failure_messages.get("timed out"), Some(&2));

        let text = report.format_human();
        assert!(text.contains("a_task"));
        assert!(text.contains("2x a_task: timed out"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["tasks"][1]["name"], "b_task");
    }

    #[test]
    fn settings_come_from_config() {
        let mut config = LoadConfig::default();
        config.load_testing.concurrent_users = 4;
        config.load_testing.run_time = "2m".to_string();
        config.load_testing.iterations = Some(3);
        config.runner.timeout = "30s".to_string();

        let settings = LoadSettings::from_config(&config).unwrap();
        assert_eq!(settings.users, 4);
        assert_eq!(settings.run_time, Duration::from_secs(120));
        assert_eq!(settings.iterations, Some(3));
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.wait_min, Duration::from_secs(1));
    }

    struct Counting {
        calls: AtomicUsize,
    }

    impl Isolate for Counting {
        fn execute(&self, operation: &str, _timeout: Duration) -> Result<ResultPayload, ExecutionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Ok(ResultPayload::new(Vec::new(), BTreeMap::new()))
            } else {
                Err(ExecutionError::MissingPayload {
                    operation: operation.to_string(),
                })
            }
        }
    }

    fn noop() -> Result<Spec, OperationError> {
        Ok(Spec::new(Vec::new()))
    }

    fn table(executor: Arc<dyn Isolate>) -> TaskTable {
        let mut registry = Registry::new();
        registry.register(OperationDef {
            name: "scan",
            owner: "Scanner",
            load_task: true,
            weight: 1,
            run_fn: noop,
            file: file!(),
            line: line!(),
            module_path: module_path!(),
        });
        TaskBinder::new().all().bind(&registry, executor)
    }

    fn quick_settings(users: usize) -> LoadSettings {
        LoadSettings {
            users,
            spawn_rate: 1000.0,
            run_time: Duration::from_secs(30),
            wait_min: Duration::ZERO,
            wait_max: Duration::ZERO,
            iterations: Some(3),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn runner_stops_after_iterations() {
        let executor = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let runner = LoadRunner::new(table(executor.clone()), quick_settings(2));

        let report = runner.run(&LoadConfig::default()).unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
        assert_eq!(report.total_requests, 6);
        assert_eq!(report.total_failures, 3);
        assert_eq!(report.tasks[0].name, "scan_task");
    }

    struct Refusing;
    impl User for Refusing {
        fn on_start(&self, _user_id: usize, _config: &LoadConfig) -> anyhow::Result<()> {
            anyhow::bail!("not today")
        }
    }

    #[test]
    fn failed_start_runs_nothing() {
        let executor = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let runner = LoadRunner::new(table(executor.clone()), quick_settings(2)).with_user(Arc::new(Refusing));

        let report = runner.run(&LoadConfig::default()).unwrap();
        assert_eq!(report.total_requests, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_start_rejects_invalid_config() {
        let mut config = LoadConfig::default();
        config.servicex.endpoint.clear();
        assert!(DefaultUser.on_start(0, &config).is_err());
        assert!(DefaultUser.on_start(0, &LoadConfig::default()).is_ok());
    }

    #[test]
    fn empty_table_is_an_error() {
        let runner = LoadRunner::new(TaskTable::default(), quick_settings(1));
        assert!(runner.run(&LoadConfig::default()).is_err());
    }
}
