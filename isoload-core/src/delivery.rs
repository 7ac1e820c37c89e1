//! Delivery Collaborator
//!
//! Delivery turns a specification into named result sets. It is an opaque,
//! possibly slow and possibly failing call that manages its own async
//! runtime, which is why it only ever runs inside an isolated worker.

use crate::spec::{Dataset, Sample, Spec, SpecError};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Delivered files by sample name
pub type DeliveryResult = BTreeMap<String, Vec<String>>;

/// Builds the deliverer a worker uses from the configuration it was handed
pub type DeliveryFactory = fn(&DeliveryConfig) -> Box<dyn Deliver>;

/// Errors raised by a delivery call
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The specification was rejected before any work started
    #[error("invalid specification: {0}")]
    InvalidSpec(#[from] SpecError),

    /// The dataset kind cannot be served by this deliverer
    #[error("sample {sample}: {reason}")]
    Unsupported {
        /// Sample name
        sample: String,
        /// Why it cannot be served
        reason: String,
    },

    /// An input file does not exist
    #[error("sample {sample}: input file not found: {path}")]
    MissingFile {
        /// Sample name
        sample: String,
        /// Offending path
        path: String,
    },

    /// Resolving a sample took longer than the configured timeout
    #[error("sample {sample}: timed out after {timeout:?}")]
    Timeout {
        /// Sample name
        sample: String,
        /// Configured limit
        timeout: Duration,
    },

    /// Any other I/O failure
    #[error("delivery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The async runtime could not be started or a task died
    #[error("delivery runtime error: {0}")]
    Runtime(String),
}

/// How progress is shown while delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// No progress output
    #[default]
    None,
    /// A progress bar on stderr
    Default,
}

impl ProgressMode {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressMode::None => "none",
            ProgressMode::Default => "default",
        }
    }
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ProgressMode::None),
            "default" => Ok(ProgressMode::Default),
            other => Err(format!("unknown progress mode: {other} (expected none or default)")),
        }
    }
}

/// Per-call delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverOptions {
    /// Skip results cached by earlier calls
    pub ignore_local_cache: bool,
    /// Progress display
    pub progress: ProgressMode,
}

impl Default for DeliverOptions {
    fn default() -> Self {
        Self {
            ignore_local_cache: true,
            progress: ProgressMode::None,
        }
    }
}

/// Connection settings for the delivery service, built once and passed
/// explicitly (including across the process boundary)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Service endpoint
    pub endpoint: String,
    /// Per-sample timeout in seconds
    pub timeout_secs: u64,
    /// Retries for transient failures
    pub max_retries: u32,
    /// Authentication token
    pub auth_token: Option<String>,
    /// Authentication scheme
    pub auth_type: String,
    /// Local result cache directory
    pub cache_path: PathBuf,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://servicex.example.com".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            auth_token: None,
            auth_type: "token".to_string(),
            cache_path: PathBuf::from("/tmp/servicex_cache"),
        }
    }
}

/// The delivery call
pub trait Deliver: Send + Sync {
    /// Deliver every sample of `spec`
    fn deliver(&self, spec: &Spec, options: &DeliverOptions)
    -> Result<DeliveryResult, DeliveryError>;
}

/// Built-in deliverer resolving file-list datasets on the local machine.
///
/// Local paths are checked and canonicalized, remote URLs are passed through
/// untouched, and Rucio datasets are rejected. Samples are resolved
/// concurrently on a private tokio runtime.
#[derive(Debug, Clone)]
pub struct LocalDelivery {
    config: DeliveryConfig,
}

const REMOTE_SCHEMES: &[&str] = &["root://", "http://", "https://", "s3://", "davs://"];

fn is_remote(file: &str) -> bool {
    REMOTE_SCHEMES.iter().any(|scheme| file.starts_with(scheme))
}

impl LocalDelivery {
    /// A deliverer using `config`
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    /// Factory suitable for [`DeliveryFactory`]
    pub fn boxed(config: &DeliveryConfig) -> Box<dyn Deliver> {
        Box::new(Self::new(config.clone()))
    }

    fn cache_file(&self, sample: &str) -> PathBuf {
        let safe: String = sample
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config.cache_path.join(format!("{safe}.json"))
    }

    fn read_cache(&self, sample: &str) -> Option<Vec<String>> {
        let path = self.cache_file(sample);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(files) => Some(files),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring corrupt cache entry: {e}");
                None
            }
        }
    }

    fn write_cache(&self, sample: &str, files: &[String]) {
        let path = self.cache_file(sample);
        let result = std::fs::create_dir_all(&self.config.cache_path).and_then(|_| {
            let json = serde_json::to_string(files).map_err(std::io::Error::other)?;
            std::fs::write(&path, json)
        });
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), "could not write cache entry: {e}");
        }
    }
}

async fn canonicalize_with_retry(
    sample: &str,
    file: &str,
    max_retries: u32,
) -> Result<String, DeliveryError> {
    let mut attempt = 0;
    loop {
        match tokio::fs::canonicalize(Path::new(file)).await {
            Ok(path) => return Ok(path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeliveryError::MissingFile {
                    sample: sample.to_string(),
                    path: file.to_string(),
                });
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(sample, file, attempt, "retrying after: {e}");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn resolve_sample(sample: Sample, max_retries: u32) -> Result<(String, Vec<String>), DeliveryError> {
    let files = match &sample.dataset {
        Dataset::FileList { files } => files,
        Dataset::Rucio { did } => {
            return Err(DeliveryError::Unsupported {
                sample: sample.name.clone(),
                reason: format!("Rucio dataset {did} cannot be resolved locally"),
            });
        }
    };

    let limit = sample.n_files.unwrap_or(files.len());
    let mut delivered = Vec::with_capacity(limit.min(files.len()));
    for file in files.iter().take(limit) {
        if is_remote(file) {
            delivered.push(file.clone());
        } else {
            delivered.push(canonicalize_with_retry(&sample.name, file, max_retries).await?);
        }
    }
    Ok((sample.name, delivered))
}

impl Deliver for LocalDelivery {
    fn deliver(
        &self,
        spec: &Spec,
        options: &DeliverOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        spec.validate()?;
        tracing::info!(
            endpoint = %self.config.endpoint,
            samples = spec.sample.len(),
            "delivering"
        );

        let mut result = DeliveryResult::new();
        let mut pending = Vec::new();
        for sample in &spec.sample {
            match (!options.ignore_local_cache)
                .then(|| self.read_cache(&sample.name))
                .flatten()
            {
                Some(files) => {
                    tracing::debug!(sample = %sample.name, "cache hit");
                    result.insert(sample.name.clone(), files);
                }
                None => pending.push(sample.clone()),
            }
        }

        let pb = match options.progress {
            ProgressMode::Default => {
                let pb = ProgressBar::new(pending.len() as u64);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
                pb
            }
            ProgressMode::None => ProgressBar::hidden(),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DeliveryError::Runtime(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let max_retries = self.config.max_retries;

        let fresh = runtime.block_on(async {
            let mut set = JoinSet::new();
            for sample in pending {
                set.spawn(async move {
                    let name = sample.name.clone();
                    match tokio::time::timeout(timeout, resolve_sample(sample, max_retries)).await {
                        Ok(resolved) => resolved,
                        Err(_) => Err(DeliveryError::Timeout { sample: name, timeout }),
                    }
                });
            }

            let mut fresh = Vec::new();
            while let Some(joined) = set.join_next().await {
                let resolved = joined.map_err(|e| DeliveryError::Runtime(e.to_string()))??;
                pb.set_message(resolved.0.clone());
                pb.inc(1);
                fresh.push(resolved);
            }
            Ok::<_, DeliveryError>(fresh)
        });
        pb.finish_and_clear();

        for (name, files) in fresh? {
            self.write_cache(&name, &files);
            result.insert(name, files);
        }
        Ok(result)
    }
}
