//! External-Process Transport
//!
//! Isolation through a separate helper program instead of a re-executed
//! worker. The operation's specification is built in-process (operation
//! bodies only describe work), written to a temporary JSON file, and handed
//! to the helper as its only argument. The helper's verdict comes back as a
//! sentinel-delimited block on stdout.

use crate::process::{ExitKind, Termination, terminate, wait_until};
use crate::supervisor::{DEFAULT_GRACE_PERIOD, ExecutionError, Isolate, log_outcome};
use isoload_core::helper::SpecFile;
use isoload_core::{DeliverOptions, DeliveryConfig, OperationError, Registry, Spec, WorkerConfig};
use isoload_ipc::{
    ErrorPayload, FailureKind, HelperOutput, ResultPayload, SentinelError, parse_output,
    strip_block,
};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Helper process owned for the duration of one invocation; terminated and
/// reaped on drop
struct HelperProcess {
    child: Child,
    grace: Duration,
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if terminate(&mut self.child, self.grace) != Termination::AlreadyExited {
            tracing::warn!(target: "isoload::helper", pid = self.child.id(), "helper was still running at cleanup");
        }
    }
}

fn collect<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    let mut stream = stream?;
    std::thread::Builder::new()
        .name("isoload-helper-output".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = stream.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .ok()
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Runs operations through an external helper program
#[derive(Debug, Clone)]
pub struct HelperExecutor {
    registry: Arc<Registry>,
    program: PathBuf,
    args: Vec<OsString>,
    delivery: DeliveryConfig,
    options: DeliverOptions,
    grace: Duration,
}

impl HelperExecutor {
    /// Executor running `program` with the settings in `worker_config`
    pub fn new(registry: Arc<Registry>, program: impl Into<PathBuf>, worker_config: WorkerConfig) -> Self {
        Self {
            registry,
            program: program.into(),
            args: Vec::new(),
            delivery: worker_config.delivery,
            options: worker_config.options,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Arguments placed before the spec file path
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Wait between SIGTERM and SIGKILL
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Resolve the operation and build its specification in-process
    fn build_spec(&self, operation: &str) -> Result<Spec, ExecutionError> {
        let built = std::panic::catch_unwind(AssertUnwindSafe(|| self.registry.invoke(operation)))
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());
                Err(OperationError::Failed {
                    name: operation.to_string(),
                    traceback: format!("panicked: {message}"),
                    error: message,
                })
            });

        let spec = built.map_err(|e| match e {
            OperationError::Failed { error, traceback, .. } => ExecutionError::WorkerException {
                operation: operation.to_string(),
                payload: Box::new(ErrorPayload::new(FailureKind::OperationError, error, traceback)),
            },
            OperationError::Unknown(_) | OperationError::NotLoadTask(_) => ExecutionError::UnknownOperation {
                operation: operation.to_string(),
            },
        })?;

        spec.validate().map_err(|source| ExecutionError::InvalidSpec {
            operation: operation.to_string(),
            source,
        })?;
        Ok(spec)
    }

    fn write_spec_file(
        &self,
        operation: &str,
        spec: &Spec,
    ) -> Result<tempfile::NamedTempFile, ExecutionError> {
        let contents = SpecFile::new(spec, self.delivery.clone(), self.options)
            .map_err(|source| ExecutionError::InvalidSpec {
                operation: operation.to_string(),
                source,
            })?;
        let json = serde_json::to_vec(&contents).map_err(std::io::Error::other)?;

        let mut file = tempfile::Builder::new()
            .prefix("isoload-spec-")
            .suffix(".json")
            .tempfile()?;
        file.write_all(&json)?;
        file.flush()?;
        Ok(file)
    }

    fn run_helper(
        &self,
        operation: &str,
        spec: &Spec,
        spec_path: &Path,
        timeout: Duration,
    ) -> Result<ResultPayload, ExecutionError> {
        let start = Instant::now();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(spec_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                operation: operation.to_string(),
                source,
            })?;
        let mut process = HelperProcess {
            child,
            grace: self.grace,
        };
        let pid = process.child.id();
        tracing::info!(target: "isoload::helper", operation, pid, program = %self.program.display(), "spawned helper");

        let stdout = collect(process.child.stdout.take());
        let stderr = collect(process.child.stderr.take());

        let waited = wait_until(&mut process.child, start + timeout).map_err(|source| ExecutionError::Wait {
            operation: operation.to_string(),
            source,
        })?;
        let Some(status) = waited else {
            let termination = terminate(&mut process.child, self.grace);
            tracing::warn!(target: "isoload::helper", operation, pid, ?termination, "helper timed out after {timeout:?}");
            return Err(ExecutionError::Timeout {
                operation: operation.to_string(),
                timeout,
                pid,
            });
        };

        let stdout = join(stdout);
        let stderr = join(stderr);
        settle(operation, spec, ExitKind::from(status), stdout, stderr)
    }
}

/// Turn the helper's exit status and output into an outcome
fn settle(
    operation: &str,
    spec: &Spec,
    exit: ExitKind,
    stdout: String,
    stderr: String,
) -> Result<ResultPayload, ExecutionError> {
    let parsed = parse_output(&stdout);
    let outside = strip_block(&stdout);

    if exit != ExitKind::Code(0) {
        // The exit code already decides; a failure block only adds detail
        return Err(match parsed {
            Ok(HelperOutput { error: Some(error), .. }) => ExecutionError::WorkerException {
                operation: operation.to_string(),
                payload: Box::new(
                    ErrorPayload::new(error.kind.parse().unwrap_or(FailureKind::Other), error.message, error.traceback)
                        .with_output(outside, stderr),
                ),
            },
            _ => match exit {
                ExitKind::Signal(signal) => ExecutionError::Killed {
                    operation: operation.to_string(),
                    signal,
                },
                ExitKind::Code(code) => ExecutionError::NonzeroExit {
                    operation: operation.to_string(),
                    code,
                },
            },
        });
    }

    let output = parsed.map_err(|e| {
        let raw = match &e {
            SentinelError::InvalidJson { raw, .. } => raw.clone(),
            _ => stdout.clone(),
        };
        ExecutionError::MalformedTransport {
            operation: operation.to_string(),
            reason: e.to_string(),
            raw,
        }
    })?;

    match output {
        HelperOutput { success: true, result, .. } => {
            Ok(ResultPayload::new(spec.keys(), result.unwrap_or_default()).with_output(outside, stderr))
        }
        HelperOutput { error, .. } => {
            let payload = match error {
                Some(error) => ErrorPayload::new(
                    error.kind.parse().unwrap_or(FailureKind::Other),
                    error.message,
                    error.traceback,
                ),
                None => ErrorPayload::new(FailureKind::Other, "helper reported failure without details", ""),
            };
            Err(ExecutionError::WorkerException {
                operation: operation.to_string(),
                payload: Box::new(payload.with_output(outside, stderr)),
            })
        }
    }
}

impl Isolate for HelperExecutor {
    fn execute(&self, operation: &str, timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        let start = Instant::now();
        let outcome = self.build_spec(operation).and_then(|spec| {
            let spec_file = self.write_spec_file(operation, &spec)?;
            let outcome = self.run_helper(operation, &spec, spec_file.path(), timeout);
            if let Err(e) = spec_file.close() {
                tracing::warn!(target: "isoload::helper", operation, "could not remove spec file: {e}");
            }
            outcome
        });
        log_outcome(operation, start.elapsed(), &outcome);
        outcome
    }
}
