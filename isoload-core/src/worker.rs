//! Worker Process Entry Point
//!
//! Runs inside a freshly spawned worker process. The supervisor hands over two
//! one-shot channels as fds 3 (result) and 4 (error), announced through
//! `ISOLOAD_IPC_FD`, and the delivery settings as JSON in
//! `ISOLOAD_WORKER_CONFIG`. Exactly one payload is sent, and the exit code
//! mirrors which channel was used.

use crate::capture::{CapturedOutput, OutputCapture};
use crate::delivery::{DeliverOptions, DeliveryConfig, DeliveryFactory};
use crate::registry::{OperationError, Registry, error_chain};
use isoload_ipc::{
    ChannelError, ERROR_FD, ErrorPayload, FailureKind, FrameError, IPC_FD_ENV, OneShotSender,
    RESULT_FD, ResultPayload,
};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, Once};
use thiserror::Error;

/// Environment variable carrying the JSON-encoded [`WorkerConfig`]
pub const WORKER_CONFIG_ENV: &str = "ISOLOAD_WORKER_CONFIG";

/// Exit code of a worker that sent a result payload
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code of a worker that sent an error payload
pub const EXIT_FAILURE: i32 = 1;

/// Exit code of a worker that could not reach its channels
pub const EXIT_TRANSPORT: i32 = 2;

/// Settings handed from the supervisor to every worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delivery service settings
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Delivery call options
    #[serde(default)]
    pub options: DeliverOptions,
}

impl WorkerConfig {
    /// Encode for [`WORKER_CONFIG_ENV`]
    pub fn to_env_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from [`WORKER_CONFIG_ENV`]; defaults when the variable is unset
    pub fn from_env() -> Result<Self, WorkerError> {
        match std::env::var(WORKER_CONFIG_ENV) {
            Ok(json) => serde_json::from_str(&json).map_err(WorkerError::Config),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Errors preventing a worker from reporting at all
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `ISOLOAD_IPC_FD` is not set
    #[error("ISOLOAD_IPC_FD is not set; not running under a supervisor")]
    NotSupervised,

    /// `ISOLOAD_IPC_FD` does not name two descriptors
    #[error("invalid ISOLOAD_IPC_FD={0:?} (expected <result_fd>,<error_fd>)")]
    InvalidDescriptors(String),

    /// A channel could not be opened
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The worker configuration could not be decoded
    #[error("invalid ISOLOAD_WORKER_CONFIG: {0}")]
    Config(serde_json::Error),
}

static PANIC_HOOK: Once = Once::new();
static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Record the location and a backtrace of every panic, then defer to the
/// previous hook
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = std::backtrace::Backtrace::force_capture();
            if let Ok(mut slot) = LAST_PANIC.lock() {
                *slot = Some(format!("{info}\n\nStack backtrace:\n{backtrace}"));
            }
            previous(info);
        }));
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Worker side of one invocation
pub struct WorkerMain {
    result_tx: OneShotSender<ResultPayload>,
    error_tx: OneShotSender<ErrorPayload>,
    config: WorkerConfig,
    capture: bool,
}

impl WorkerMain {
    /// Worker over explicit channels
    pub fn new(
        result_tx: OneShotSender<ResultPayload>,
        error_tx: OneShotSender<ErrorPayload>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            result_tx,
            error_tx,
            config,
            capture: true,
        }
    }

    /// Open the inherited channels and read the configuration from the
    /// environment
    pub fn from_env() -> Result<Self, WorkerError> {
        let value = std::env::var(IPC_FD_ENV).map_err(|_| WorkerError::NotSupervised)?;
        let (result_fd, error_fd) = value
            .split_once(',')
            .and_then(|(r, e)| Some((r.trim().parse::<i32>().ok()?, e.trim().parse::<i32>().ok()?)))
            .ok_or_else(|| WorkerError::InvalidDescriptors(value.clone()))?;

        if (result_fd, error_fd) != (RESULT_FD, ERROR_FD) {
            tracing::debug!(result_fd, error_fd, "non-standard channel descriptors");
        }

        // SAFETY: the supervisor maps these descriptors for us and nothing
        // else in this process owns them
        let result_tx = unsafe { OneShotSender::from_raw_fd(result_fd)? };
        let error_tx = unsafe { OneShotSender::from_raw_fd(error_fd)? };
        Ok(Self::new(result_tx, error_tx, WorkerConfig::from_env()?))
    }

    /// Leave the standard streams alone instead of capturing them
    pub fn without_capture(mut self) -> Self {
        self.capture = false;
        self
    }

    /// Run `operation` and report through the channels. Returns the exit code
    /// the process should terminate with.
    pub fn run(self, operation: &str, registry: &Registry, factory: DeliveryFactory) -> i32 {
        install_panic_hook();

        let capture = if self.capture {
            match OutputCapture::install() {
                Ok(capture) => Some(capture),
                Err(e) => {
                    tracing::warn!(target: "isoload::worker", "output capture unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(target: "isoload::worker", operation, pid = std::process::id(), "worker started");

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            execute(operation, registry, &self.config, factory)
        }))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            let traceback = LAST_PANIC
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or_else(|| format!("panicked: {message}"));
            Err(ErrorPayload::new(FailureKind::Panic, message, traceback))
        });

        match &outcome {
            Ok(_) => tracing::info!(target: "isoload::worker", operation, "operation completed"),
            Err(e) => {
                tracing::error!(target: "isoload::worker", operation, kind = %e.kind, "operation failed: {}", e.error)
            }
        }

        // Streams are restored before anything leaves the process
        let output = match capture.map(OutputCapture::finish).transpose() {
            Ok(output) => output.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(target: "isoload::worker", "could not collect captured output: {e}");
                CapturedOutput::default()
            }
        };

        self.report(outcome, output)
    }

    fn report(self, outcome: Result<ResultPayload, ErrorPayload>, output: CapturedOutput) -> i32 {
        let Self {
            mut result_tx,
            mut error_tx,
            ..
        } = self;

        let (sent, code) = match outcome {
            Ok(payload) => {
                let mut payload = payload.with_output(output.stdout, output.stderr);
                (result_tx.send_fitted(&mut payload), EXIT_SUCCESS)
            }
            Err(payload) => {
                let mut payload = payload.with_output(output.stdout, output.stderr);
                (error_tx.send_fitted(&mut payload), EXIT_FAILURE)
            }
        };

        match sent {
            Ok(()) => code,
            // Nothing was written, so the error channel is still free
            Err(ChannelError::Frame(FrameError::FrameTooLarge { size, max })) => {
                let message = format!(
                    "payload of {size} bytes exceeds the {max} byte channel limit even with captured output truncated"
                );
                tracing::error!(target: "isoload::worker", "{message}");
                let payload =
                    ErrorPayload::new(FailureKind::TransportError, message.clone(), format!("Error: {message}\n"));
                match error_tx.send(&payload) {
                    Ok(()) => EXIT_FAILURE,
                    Err(e) => {
                        tracing::error!(target: "isoload::worker", "could not send payload: {e}");
                        EXIT_TRANSPORT
                    }
                }
            }
            Err(e) => {
                tracing::error!(target: "isoload::worker", "could not send payload: {e}");
                EXIT_TRANSPORT
            }
        }
    }
}

/// Resolve on a fresh instance, build the specification and deliver it
fn execute(
    operation: &str,
    registry: &Registry,
    config: &WorkerConfig,
    factory: DeliveryFactory,
) -> Result<ResultPayload, ErrorPayload> {
    let def = registry.resolve(operation).map_err(|e| {
        ErrorPayload::new(FailureKind::UnknownOperation, e.to_string(), format!("Error: {e}\n"))
    })?;

    let spec = (def.run_fn)().map_err(|e| match e {
        OperationError::Failed { error, traceback, .. } => {
            ErrorPayload::new(FailureKind::OperationError, error, traceback)
        }
        other => ErrorPayload::new(FailureKind::UnknownOperation, other.to_string(), format!("Error: {other}\n")),
    })?;

    spec.validate().map_err(|e| {
        let message = e.to_string();
        ErrorPayload::new(FailureKind::InvalidSpec, message, error_chain(&anyhow::Error::new(e)))
    })?;

    tracing::info!(
        target: "isoload::worker",
        operation,
        samples = spec.sample.len(),
        ignore_local_cache = config.options.ignore_local_cache,
        "delivering specification"
    );

    let deliverer = factory(&config.delivery);
    let delivered = deliverer.deliver(&spec, &config.options).map_err(|e| {
        let message = e.to_string();
        ErrorPayload::new(FailureKind::DeliveryError, message, error_chain(&anyhow::Error::new(e)))
    })?;

    Ok(ResultPayload::new(spec.keys(), delivered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{Deliver, DeliveryError, DeliveryResult};
    use crate::registry::OperationDef;
    use crate::spec::{Dataset, Query, Sample, Spec};
    use isoload_ipc::{MAX_FRAME_SIZE, OneShotReceiver, create_pipe};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct EchoDelivery;

    impl Deliver for EchoDelivery {
        fn deliver(&self, spec: &Spec, _: &DeliverOptions) -> Result<DeliveryResult, DeliveryError> {
            Ok(spec
                .sample
                .iter()
                .map(|s| (s.name.clone(), vec![format!("{}.parquet", s.name)]))
                .collect())
        }
    }

    fn echo(_: &DeliveryConfig) -> Box<dyn Deliver> {
        Box::new(EchoDelivery)
    }

    fn good() -> Result<Spec, OperationError> {
        Ok(Spec::new(vec![Sample::new(
            "electrons",
            Dataset::file_list(["root://host//a.root"]),
            Query::uproot_raw(serde_json::json!([])),
        )]))
    }

    fn bad() -> Result<Spec, OperationError> {
        Err(OperationError::failed("bad", anyhow::anyhow!("query could not be built")))
    }

    fn exploding() -> Result<Spec, OperationError> {
        panic!("operation exploded")
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        for (name, run_fn) in [
            ("good", good as fn() -> Result<Spec, OperationError>),
            ("bad", bad),
            ("exploding", exploding),
        ] {
            registry.register(OperationDef {
                name,
                owner: "Tests",
                load_task: true,
                weight: 1,
                run_fn,
                file: file!(),
                line: line!(),
                module_path: module_path!(),
            });
        }
        registry
    }

    struct Harness {
        result_rx: OneShotReceiver<ResultPayload>,
        error_rx: OneShotReceiver<ErrorPayload>,
        worker: WorkerMain,
    }

    fn harness() -> Harness {
        let (result_read, result_write) = create_pipe().unwrap();
        let (error_read, error_write) = create_pipe().unwrap();
        Harness {
            result_rx: OneShotReceiver::new(result_read),
            error_rx: OneShotReceiver::new(error_read),
            worker: WorkerMain::new(
                OneShotSender::new(result_write),
                OneShotSender::new(error_write),
                WorkerConfig::default(),
            )
            .without_capture(),
        }
    }

    #[test]
    fn success_goes_to_result_channel_only() {
        let mut h = harness();
        assert_eq!(h.worker.run("good", &registry(), echo), EXIT_SUCCESS);

        let payload = h.result_rx.try_recv().unwrap().unwrap();
        assert!(payload.success);
        assert_eq!(payload.summary_keys, ["Sample"]);
        assert_eq!(payload.delivered_map()["electrons"], ["electrons.parquet".to_string()]);
        assert!(h.error_rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn operation_error_goes_to_error_channel() {
        let mut h = harness();
        assert_eq!(h.worker.run("bad", &registry(), echo), EXIT_FAILURE);

        let payload = h.error_rx.try_recv().unwrap().unwrap();
        assert_eq!(payload.kind, FailureKind::OperationError);
        assert_eq!(payload.error, "query could not be built");
        assert!(!payload.traceback.is_empty());
        assert!(h.result_rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn unknown_operation_is_reported() {
        let mut h = harness();
        assert_eq!(h.worker.run("nope", &registry(), echo), EXIT_FAILURE);
        let payload = h.error_rx.try_recv().unwrap().unwrap();
        assert_eq!(payload.kind, FailureKind::UnknownOperation);
    }

    #[test]
    fn panic_is_reported_with_backtrace() {
        let mut h = harness();
        assert_eq!(h.worker.run("exploding", &registry(), echo), EXIT_FAILURE);
        let payload = h.error_rx.try_recv().unwrap().unwrap();
        assert_eq!(payload.kind, FailureKind::Panic);
        assert_eq!(payload.error, "operation exploded");
        assert!(payload.traceback.contains("operation exploded"));
    }

    #[test]
    fn config_round_trips_through_env_value() {
        let config = WorkerConfig {
            options: DeliverOptions {
                ignore_local_cache: false,
                progress: crate::delivery::ProgressMode::Default,
            },
            ..WorkerConfig::default()
        };
        let json = config.to_env_value().unwrap();
        assert_eq!(serde_json::from_str::<WorkerConfig>(&json).unwrap(), config);
        assert_eq!(serde_json::from_str::<WorkerConfig>("{}").unwrap(), WorkerConfig::default());
    }

    #[test]
    fn oversized_output_is_truncated_and_still_reported_as_success() {
        let Harness {
            mut result_rx,
            mut error_rx,
            worker,
        } = harness();
        // The truncated frame is larger than a pipe buffer, so read concurrently
        let reader = std::thread::spawn(move || {
            result_rx.poll_ready(Duration::from_secs(30)).unwrap();
            result_rx.try_recv().unwrap()
        });

        let output = CapturedOutput {
            stdout: "x".repeat(MAX_FRAME_SIZE + (1 << 20)),
            stderr: "last words\n".to_string(),
        };
        let payload = ResultPayload::new(vec!["Sample".to_string()], BTreeMap::new());
        assert_eq!(worker.report(Ok(payload), output), EXIT_SUCCESS);

        let received = reader.join().unwrap().expect("result payload");
        assert!(received.success);
        assert!(received.stdout.starts_with("[truncated "));
        assert!(received.stdout.len() < MAX_FRAME_SIZE);
        assert_eq!(received.stderr, "last words\n");
        assert!(error_rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn payload_too_large_to_truncate_becomes_transport_error() {
        let Harness {
            mut result_rx,
            mut error_rx,
            worker,
        } = harness();

        let mut delivered = BTreeMap::new();
        delivered.insert("huge".to_string(), vec!["y".repeat(MAX_FRAME_SIZE)]);
        let payload = ResultPayload::new(vec!["Sample".to_string()], delivered);
        assert_eq!(worker.report(Ok(payload), CapturedOutput::default()), EXIT_FAILURE);

        let error = error_rx.try_recv().unwrap().expect("error payload");
        assert_eq!(error.kind, FailureKind::TransportError);
        assert!(error.error.contains("exceeds"));
        assert!(!error.traceback.is_empty());
        assert!(result_rx.try_recv().unwrap().is_none());
    }
}
