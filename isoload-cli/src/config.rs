//! Configuration loading from isoload.toml
//!
//! Configuration can be specified in an `isoload.toml` file in the project
//! root, discovered by walking up from the current directory, or named
//! explicitly with `--config` / `ISOLOAD_CONFIG`. String values may reference
//! environment variables as `${VAR}` or `${VAR:-default}`, and a fixed set of
//! environment variables overrides the file.

use anyhow::Context;
use isoload_core::{DeliverOptions, DeliveryConfig, ProgressMode, WorkerConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// File name looked for during discovery
pub const CONFIG_FILE: &str = "isoload.toml";

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "ISOLOAD_CONFIG";

/// Log levels accepted in `log_level`
pub const LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL"];

/// isoload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Delivery service connection
    #[serde(default)]
    pub servicex: ServiceXConfig,
    /// Load generation parameters
    #[serde(default)]
    pub load_testing: LoadTestConfig,
    /// File lists available to task definitions
    #[serde(default)]
    pub test_data: TestDataConfig,
    /// Isolation settings
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Log level: DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Local result cache directory
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            servicex: ServiceXConfig::default(),
            load_testing: LoadTestConfig::default(),
            test_data: TestDataConfig::default(),
            runner: RunnerConfig::default(),
            log_level: default_log_level(),
            cache_path: default_cache_path(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_cache_path() -> String {
    "/tmp/servicex_cache".to_string()
}

/// Delivery service connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceXConfig {
    /// Service endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_servicex_timeout")]
    pub timeout: i64,
    /// Retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Authentication token
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Authentication scheme
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
}

impl Default for ServiceXConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout: default_servicex_timeout(),
            max_retries: default_max_retries(),
            auth_token: None,
            auth_type: default_auth_type(),
        }
    }
}

fn default_endpoint() -> String {
    "https://servicex.example.com".to_string()
}
fn default_servicex_timeout() -> i64 {
    60
}
fn default_max_retries() -> i64 {
    3
}
fn default_auth_type() -> String {
    "token".to_string()
}

/// Load generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    /// Number of virtual users
    #[serde(default = "default_users")]
    pub concurrent_users: i64,
    /// Users started per second
    #[serde(default = "default_spawn_rate")]
    pub spawn_rate: f64,
    /// Total run time (e.g., "60s", "5m")
    #[serde(default = "default_run_time")]
    pub run_time: String,
    /// Target host, reported only
    #[serde(default = "default_host")]
    pub host: String,
    /// Lower bound of the pause between tasks
    #[serde(default = "default_wait_min")]
    pub wait_min: String,
    /// Upper bound of the pause between tasks
    #[serde(default = "default_wait_max")]
    pub wait_max: String,
    /// Stop each user after this many tasks
    #[serde(default)]
    pub iterations: Option<u64>,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            concurrent_users: default_users(),
            spawn_rate: default_spawn_rate(),
            run_time: default_run_time(),
            host: default_host(),
            wait_min: default_wait_min(),
            wait_max: default_wait_max(),
            iterations: None,
        }
    }
}

fn default_users() -> i64 {
    10
}
fn default_spawn_rate() -> f64 {
    1.0
}
fn default_run_time() -> String {
    "60s".to_string()
}
fn default_host() -> String {
    "http://localhost:8089".to_string()
}
fn default_wait_min() -> String {
    "1s".to_string()
}
fn default_wait_max() -> String {
    "5s".to_string()
}

/// File lists available to task definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestDataConfig {
    /// ATLAS input files
    #[serde(default)]
    pub atlas_files: Vec<String>,
    /// CMS input files
    #[serde(default)]
    pub cms_files: Vec<String>,
}

/// Isolation transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Re-execute this binary as a worker with one-shot channels (default)
    #[default]
    Worker,
    /// Run the external helper program with a temporary spec file
    Helper,
}

/// Isolation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Bound on a single invocation (e.g., "300s", "5m")
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Wait between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period")]
    pub grace_period: String,
    /// "worker" or "helper"
    #[serde(default)]
    pub transport: Transport,
    /// Helper program for the helper transport
    #[serde(default = "default_helper")]
    pub helper: String,
    /// Skip cached delivery results
    #[serde(default = "default_ignore_local_cache")]
    pub ignore_local_cache: bool,
    /// Progress display inside workers: "none" or "default"
    #[serde(default)]
    pub progress_bar: ProgressMode,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            grace_period: default_grace_period(),
            transport: Transport::default(),
            helper: default_helper(),
            ignore_local_cache: default_ignore_local_cache(),
            progress_bar: ProgressMode::default(),
        }
    }
}

fn default_timeout() -> String {
    "300s".to_string()
}
fn default_grace_period() -> String {
    "5s".to_string()
}
fn default_helper() -> String {
    "isoload-helper".to_string()
}
fn default_ignore_local_cache() -> bool {
    true
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap_or_else(|e| unreachable!("{e}"))
    })
}

/// Replace `${VAR}` and `${VAR:-default}` using `lookup`. Unset variables
/// without a default become empty.
pub fn substitute_env_vars<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            lookup(name)
                .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{name}={value:?} is not a valid number"))
}

impl LoadConfig {
    /// Load configuration from a TOML file, substituting environment variables
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        Self::parse(&content, |name| std::env::var(name).ok())
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Parse TOML text with `${VAR}` references resolved through `lookup`
    pub fn parse<F>(content: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = substitute_env_vars(content, lookup);
        Ok(toml::from_str(&content)?)
    }

    /// Find `isoload.toml` by walking up from the current directory
    pub fn discover_path() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Load the explicit file, else `ISOLOAD_CONFIG`, else a discovered file,
    /// else defaults; then apply environment overrides
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(Self::discover_path);

        let mut config = match &path {
            Some(path) => {
                tracing::debug!("loading configuration from {}", path.display());
                Self::load(path)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Override fields from environment variables resolved through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVICEX_ENDPOINT") {
            self.servicex.endpoint = v;
        }
        if let Some(v) = lookup("SERVICEX_TIMEOUT") {
            self.servicex.timeout = parse_env("SERVICEX_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SERVICEX_MAX_RETRIES") {
            self.servicex.max_retries = parse_env("SERVICEX_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("SERVICEX_TOKEN") {
            self.servicex.auth_token = Some(v);
        }
        if let Some(v) = lookup("SERVICEX_AUTH_TYPE") {
            self.servicex.auth_type = v;
        }
        if let Some(v) = lookup("LOCUST_USERS") {
            self.load_testing.concurrent_users = parse_env("LOCUST_USERS", &v)?;
        }
        if let Some(v) = lookup("LOCUST_SPAWN_RATE") {
            self.load_testing.spawn_rate = parse_env("LOCUST_SPAWN_RATE", &v)?;
        }
        if let Some(v) = lookup("LOCUST_RUN_TIME") {
            self.load_testing.run_time = v;
        }
        if let Some(v) = lookup("LOCUST_HOST") {
            self.load_testing.host = v;
        }
        if let Some(v) = lookup("ATLAS_TEST_FILES") {
            self.test_data.atlas_files = split_list(&v);
        }
        if let Some(v) = lookup("CMS_TEST_FILES") {
            self.test_data.cms_files = split_list(&v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("SERVICEX_CACHE_PATH") {
            self.cache_path = v;
        }
        Ok(())
    }

    /// Check every value, reporting all problems at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.servicex.endpoint.trim().is_empty() {
            errors.push("ServiceX endpoint is required".to_string());
        }
        if self.servicex.timeout <= 0 {
            errors.push("ServiceX timeout must be positive".to_string());
        }
        if self.servicex.max_retries < 0 {
            errors.push("ServiceX max_retries must be non-negative".to_string());
        } else if u32::try_from(self.servicex.max_retries).is_err() {
            errors.push(format!("ServiceX max_retries must be at most {}", u32::MAX));
        }
        if self.load_testing.concurrent_users <= 0 {
            errors.push("Concurrent users must be positive".to_string());
        }
        if self.load_testing.spawn_rate <= 0.0 {
            errors.push("Spawn rate must be positive".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.to_uppercase().as_str()) {
            errors.push(format!("Log level must be one of: {}", LOG_LEVELS.join(", ")));
        }

        for (name, value) in [
            ("load_testing.run_time", &self.load_testing.run_time),
            ("load_testing.wait_min", &self.load_testing.wait_min),
            ("load_testing.wait_max", &self.load_testing.wait_max),
            ("runner.timeout", &self.runner.timeout),
            ("runner.grace_period", &self.runner.grace_period),
        ] {
            if let Err(e) = parse_duration(value) {
                errors.push(format!("{name}: {e}"));
            }
        }
        if let (Ok(min), Ok(max)) = (
            parse_duration(&self.load_testing.wait_min),
            parse_duration(&self.load_testing.wait_max),
        ) {
            if min > max {
                errors.push("load_testing.wait_min must not exceed wait_max".to_string());
            }
        }
        if matches!(parse_duration(&self.runner.timeout), Ok(d) if d.is_zero()) {
            errors.push("runner.timeout must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Configuration validation failed: {}",
                errors.join("; ")
            ))
        }
    }

    /// `tracing` filter directive equivalent to `log_level`
    pub fn tracing_level(&self) -> &'static str {
        match self.log_level.to_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }

    /// Delivery settings handed to workers and the helper
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            endpoint: self.servicex.endpoint.clone(),
            timeout_secs: self.servicex.timeout.max(1) as u64,
            max_retries: u32::try_from(self.servicex.max_retries.max(0)).unwrap_or(u32::MAX),
            auth_token: self.servicex.auth_token.clone(),
            auth_type: self.servicex.auth_type.clone(),
            cache_path: PathBuf::from(&self.cache_path),
        }
    }

    /// Delivery call options
    pub fn deliver_options(&self) -> DeliverOptions {
        DeliverOptions {
            ignore_local_cache: self.runner.ignore_local_cache,
            progress: self.runner.progress_bar,
        }
    }

    /// Everything a worker needs
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            delivery: self.delivery_config(),
            options: self.deliver_options(),
        }
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# isoload Configuration

# Log level: DEBUG, INFO, WARNING, ERROR, CRITICAL
log_level = "INFO"
# Local result cache
cache_path = "/tmp/servicex_cache"

[servicex]
endpoint = "${SERVICEX_ENDPOINT:-https://servicex.example.com}"
# Request timeout in seconds
timeout = 60
max_retries = 3
# auth_token = "${SERVICEX_TOKEN}"
auth_type = "token"

[load_testing]
concurrent_users = 10
# Users started per second
spawn_rate = 1
run_time = "60s"
host = "http://localhost:8089"
# Pause between tasks, drawn uniformly from [wait_min, wait_max]
wait_min = "1s"
wait_max = "5s"
# Stop each user after N tasks (uncomment to enable)
# iterations = 10

[test_data]
atlas_files = []
cms_files = []

[runner]
# Bound on a single isolated invocation
timeout = "300s"
# Wait between SIGTERM and SIGKILL
grace_period = "5s"
# Isolation transport: "worker" or "helper"
transport = "worker"
# Helper program for the helper transport
helper = "isoload-helper"
ignore_local_cache = true
# Progress display inside workers: "none" or "default"
progress_bar = "none"
"#
        .to_string()
    }
}

/// Parse duration string (e.g., "3s", "500ms", "2m", "1h")
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Empty duration string"));
    }

    // Find where the number ends and unit begins
    let (num_part, unit_part) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| s.split_at(i))
        .unwrap_or((s, "s"));

    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow::anyhow!("Invalid duration number: {}", num_part));
    }

    let seconds_per_unit = match unit_part.to_lowercase().as_str() {
        "ms" => 0.001,
        "s" | "" => 1.0,
        "m" | "min" => 60.0,
        "h" => 3600.0,
        _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
    };

    Ok(Duration::from_secs_f64(value * seconds_per_unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LoadConfig::default();
        assert_eq!(config.servicex.timeout, 60);
        assert_eq!(config.load_testing.concurrent_users, 10);
        assert_eq!(config.runner.timeout, "300s");
        assert_eq!(config.runner.transport, Transport::Worker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3 fortnights").is_err());
    }

    #[test]
    fn test_substitution() {
        let lookup = vars(&[("HOST", "sx.cern.ch")]);
        assert_eq!(substitute_env_vars("https://${HOST}/api", &lookup), "https://sx.cern.ch/api");
        assert_eq!(substitute_env_vars("${MISSING:-fallback}", &lookup), "fallback");
        assert_eq!(substitute_env_vars("${HOST:-fallback}", &lookup), "sx.cern.ch");
        assert_eq!(substitute_env_vars("[${MISSING}]", &lookup), "[]");
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            log_level = "DEBUG"

            [servicex]
            endpoint = "${SX:-https://default}"

            [load_testing]
            concurrent_users = 3

            [runner]
            transport = "helper"
        "#;

        let config = LoadConfig::parse(toml_str, vars(&[])).unwrap();
        assert_eq!(config.servicex.endpoint, "https://default");
        assert_eq!(config.load_testing.concurrent_users, 3);
        assert_eq!(config.runner.transport, Transport::Helper);
        assert_eq!(config.tracing_level(), "debug");
        // Defaults should still apply
        assert_eq!(config.servicex.max_retries, 3);
        assert_eq!(config.runner.grace_period, "5s");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LoadConfig::default();
        config
            .apply_env(vars(&[
                ("SERVICEX_ENDPOINT", "https://sx.example.org"),
                ("LOCUST_USERS", "25"),
                ("ATLAS_TEST_FILES", " a.root, ,b.root "),
                ("SERVICEX_CACHE_PATH", "/scratch/cache"),
            ]))
            .unwrap();

        assert_eq!(config.servicex.endpoint, "https://sx.example.org");
        assert_eq!(config.load_testing.concurrent_users, 25);
        assert_eq!(config.test_data.atlas_files, ["a.root", "b.root"]);
        assert_eq!(config.delivery_config().cache_path, PathBuf::from("/scratch/cache"));

        assert!(config.apply_env(vars(&[("SERVICEX_TIMEOUT", "soon")])).is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = LoadConfig::default();
        config.servicex.endpoint.clear();
        config.servicex.timeout = 0;
        config.load_testing.concurrent_users = 0;
        config.log_level = "LOUD".to_string();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.starts_with("Configuration validation failed: "));
        assert!(message.contains("ServiceX endpoint is required"));
        assert!(message.contains("ServiceX timeout must be positive"));
        assert!(message.contains("Concurrent users must be positive"));
        assert!(message.contains("Log level must be one of"));
        assert_eq!(message.matches("; ").count(), 3);
    }

    #[test]
    fn test_max_retries_out_of_range() {
        let mut config = LoadConfig::default();
        config.servicex.max_retries = i64::from(u32::MAX) + 1;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_retries must be at most"));
        assert_eq!(config.delivery_config().max_retries, u32::MAX);

        config.servicex.max_retries = -4;
        assert_eq!(config.delivery_config().max_retries, 0);
    }

    #[test]
    fn test_default_toml_parses() {
        let config = LoadConfig::parse(&LoadConfig::default_toml(), vars(&[])).unwrap();
        assert_eq!(config.servicex.endpoint, "https://servicex.example.com");
        assert_eq!(config.runner.timeout, "300s");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovered_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[load_testing]\nrun_time = \"2m\"\n").unwrap();

        let config = LoadConfig::load(&path).unwrap();
        assert_eq!(config.load_testing.run_time, "2m");
        assert!(LoadConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
