//! Helper Program Entry Point
//!
//! The external-process transport runs a separate program with the path of a
//! JSON spec file as its only argument. The program rebuilds the tagged
//! specification, delivers it, and prints exactly one sentinel-delimited
//! result block on stdout. Logging goes to stderr so stdout stays parseable.

use crate::delivery::{DeliverOptions, DeliveryConfig, DeliveryFactory, ProgressMode};
use crate::registry::error_chain;
use crate::spec::{Spec, SpecError};
use isoload_ipc::{FailureKind, HelperOutput, render_block};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::Path;

fn default_ignore_local_cache() -> bool {
    true
}

/// Contents of the temporary spec file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecFile {
    /// Specification in tagged form
    pub spec: serde_json::Value,
    /// Delivery service settings
    #[serde(default)]
    pub config: DeliveryConfig,
    /// Skip cached results
    #[serde(default = "default_ignore_local_cache")]
    pub ignore_local_cache: bool,
    /// Progress display mode
    #[serde(default)]
    pub progress_bar: ProgressMode,
}

impl SpecFile {
    /// Describe one delivery call
    pub fn new(spec: &Spec, config: DeliveryConfig, options: DeliverOptions) -> Result<Self, SpecError> {
        Ok(Self {
            spec: spec.to_tagged()?,
            config,
            ignore_local_cache: options.ignore_local_cache,
            progress_bar: options.progress,
        })
    }

    /// Read and decode a spec file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read spec file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse spec file {}", path.display()))
    }

    /// Delivery options carried by the file
    pub fn options(&self) -> DeliverOptions {
        DeliverOptions {
            ignore_local_cache: self.ignore_local_cache,
            progress: self.progress_bar,
        }
    }
}

fn fail(kind: FailureKind, error: anyhow::Error) -> HelperOutput {
    HelperOutput::failure(kind.as_str(), error.to_string(), error_chain(&error))
}

fn deliver_file(args: &[String], factory: DeliveryFactory) -> Result<HelperOutput, HelperOutput> {
    let [path] = args else {
        return Err(fail(
            FailureKind::TransportError,
            anyhow::anyhow!("Expected exactly one argument: JSON spec file path"),
        ));
    };

    let file = SpecFile::load(Path::new(path)).map_err(|e| fail(FailureKind::TransportError, e))?;
    tracing::info!(target: "isoload::helper", path = %path, "helper started");

    let spec = Spec::from_tagged(file.spec.clone())
        .and_then(|spec| spec.validate().map(|_| spec))
        .map_err(|e| fail(FailureKind::InvalidSpec, e.into()))?;
    tracing::info!(target: "isoload::helper", samples = spec.sample.len(), "delivering specification");

    let deliverer = factory(&file.config);
    let result = deliverer
        .deliver(&spec, &file.options())
        .map_err(|e| fail(FailureKind::DeliveryError, e.into()))?;

    tracing::info!(target: "isoload::helper", "delivery completed");
    Ok(HelperOutput::success(result))
}

/// Run the helper with `args` (program name excluded) and print the result
/// block. Returns the process exit code.
pub fn run(args: &[String], factory: DeliveryFactory) -> i32 {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| deliver_file(args, factory)))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "Unknown panic".to_string());
            Err(HelperOutput::failure(FailureKind::Panic.as_str(), message.clone(), message))
        });

    let (output, code) = match outcome {
        Ok(output) => (output, 0),
        Err(output) => {
            if let Some(error) = &output.error {
                tracing::error!(target: "isoload::helper", kind = %error.kind, "{}", error.message);
            }
            (output, 1)
        }
    };

    let block = match render_block(&output) {
        Ok(block) => block,
        Err(e) => {
            tracing::error!(target: "isoload::helper", "could not encode result: {e}");
            return 1;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if stdout.write_all(block.as_bytes()).and_then(|_| stdout.flush()).is_err() {
        return 1;
    }
    code
}
