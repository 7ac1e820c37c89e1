//! Isolated Executor
//!
//! Runs each operation invocation in a fresh worker process and turns its
//! exit status and one-shot channel contents into a single outcome.
//!
//! ```text
//! Idle -> Starting -> Running -+-> Completed   (exit 0, result payload)
//!                              +-> Failed      (exit != 0, error payload or exit code)
//!                              +-> TimedOut -> Terminating (SIGTERM, grace, SIGKILL)
//! every path -> CleanedUp (channels drained, process reaped)
//! ```

use crate::process::{ExitKind, POLL_SLICE, Termination, terminate, try_status};
use isoload_core::{Registry, SpecError, WORKER_CONFIG_ENV, WorkerConfig};
use isoload_ipc::{
    ChannelError, ERROR_FD, ErrorPayload, IPC_FD_ENV, OneShotReceiver, PollResult, RESULT_FD,
    ResultPayload, create_pipe, poll_fds,
};
use std::ffi::OsString;
use std::fmt;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Command-line flag that switches a binary into worker mode
pub const WORKER_FLAG: &str = "--isoload-worker";

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default bound on a single invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Failure of a single invocation. Every variant is terminal: nothing is retried.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The worker process could not be started
    #[error("failed to spawn worker for {operation}: {source}")]
    Spawn {
        /// Operation name
        operation: String,
        /// Underlying spawn failure
        source: std::io::Error,
    },

    /// A channel held bytes that did not decode
    #[error("IPC error for {operation}: {source}")]
    Ipc {
        /// Operation name
        operation: String,
        /// Channel failure
        source: ChannelError,
    },

    /// The bound expired and the worker was terminated
    #[error("operation {operation} timed out after {timeout:?} (worker pid {pid} terminated)")]
    Timeout {
        /// Operation name
        operation: String,
        /// Bound that expired
        timeout: Duration,
        /// Pid of the terminated worker
        pid: u32,
    },

    /// Non-zero exit with no error payload
    #[error("worker for {operation} exited with code {code}")]
    NonzeroExit {
        /// Operation name
        operation: String,
        /// Exit code
        code: i32,
    },

    /// The worker can no longer be waited on, so its exit status is lost
    #[error("cannot wait on worker for {operation}: {source}")]
    Wait {
        /// Operation name
        operation: String,
        /// Failure from waitpid
        source: std::io::Error,
    },

    /// Death by signal with no error payload
    #[error("worker for {operation} was killed by signal {signal}")]
    Killed {
        /// Operation name
        operation: String,
        /// Terminating signal
        signal: i32,
    },

    /// Exit 0 with an empty result channel
    #[error("worker for {operation} exited cleanly but produced no payload")]
    MissingPayload {
        /// Operation name
        operation: String,
    },

    /// The worker reported a failure through its error channel
    #[error("operation {operation} failed: {}", .payload.error)]
    WorkerException {
        /// Operation name
        operation: String,
        /// Payload sent by the worker
        payload: Box<ErrorPayload>,
    },

    /// Helper output without a well-formed result block
    #[error("malformed transport output for {operation}: {reason}")]
    MalformedTransport {
        /// Operation name
        operation: String,
        /// What was wrong with the output
        reason: String,
        /// Everything the helper printed
        raw: String,
    },

    /// No operation with this name is registered
    #[error("unknown operation: {operation}")]
    UnknownOperation {
        /// Requested name
        operation: String,
    },

    /// The operation built a specification that failed validation
    #[error("invalid specification from {operation}: {source}")]
    InvalidSpec {
        /// Operation name
        operation: String,
        /// Validation failure
        source: SpecError,
    },

    /// Any other I/O failure in the supervisor
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    /// Short category name, used as the failure label in reports
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Spawn { .. } => "Spawn",
            ExecutionError::Ipc { .. } => "Ipc",
            ExecutionError::Timeout { .. } => "Timeout",
            ExecutionError::NonzeroExit { .. } => "NonzeroExit",
            ExecutionError::Wait { .. } => "Wait",
            ExecutionError::Killed { .. } => "Killed",
            ExecutionError::MissingPayload { .. } => "MissingPayload",
            ExecutionError::WorkerException { .. } => "WorkerException",
            ExecutionError::MalformedTransport { .. } => "MalformedTransport",
            ExecutionError::UnknownOperation { .. } => "UnknownOperation",
            ExecutionError::InvalidSpec { .. } => "InvalidSpec",
            ExecutionError::Io(_) => "Io",
        }
    }

    /// Error payload reported by the worker, if one arrived
    pub fn payload(&self) -> Option<&ErrorPayload> {
        match self {
            ExecutionError::WorkerException { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Runs one operation in isolation and returns its result payload
pub trait Isolate: Send + Sync {
    /// Execute `operation`, bounded by `timeout`
    fn execute(&self, operation: &str, timeout: Duration) -> Result<ResultPayload, ExecutionError>;
}

/// State of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Not started
    Idle,
    /// Channels allocated, process being spawned
    Starting,
    /// Process running, caller waiting
    Running,
    /// Bound expired with the process alive
    TimedOut,
    /// Escalating termination in progress
    Terminating,
    /// Process exited non-zero
    Failed,
    /// Process exited zero
    Completed,
    /// Channels drained, process reaped
    CleanedUp,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationState::Idle => "idle",
            InvocationState::Starting => "starting",
            InvocationState::Running => "running",
            InvocationState::TimedOut => "timed-out",
            InvocationState::Terminating => "terminating",
            InvocationState::Failed => "failed",
            InvocationState::Completed => "completed",
            InvocationState::CleanedUp => "cleaned-up",
        };
        f.write_str(name)
    }
}

/// A spawned worker and the read ends of its channels.
///
/// Owns the process exclusively; dropping the handle terminates and reaps the
/// process and drains both channels, whatever state it was left in.
pub struct WorkerHandle {
    operation: String,
    child: Child,
    result_rx: OneShotReceiver<ResultPayload>,
    error_rx: OneShotReceiver<ErrorPayload>,
    grace: Duration,
    started: Instant,
    state: InvocationState,
}

impl WorkerHandle {
    fn spawn(
        command: &mut Command,
        operation: &str,
        grace: Duration,
    ) -> Result<Self, ExecutionError> {
        let spawn_err = |source| ExecutionError::Spawn {
            operation: operation.to_string(),
            source,
        };

        let (result_read, result_write) = create_pipe().map_err(spawn_err)?;
        let (error_read, error_write) = create_pipe().map_err(spawn_err)?;

        let result_fd = result_write.as_raw_fd();
        let error_fd = error_write.as_raw_fd();

        // In the child: lift both write ends above the target range first so
        // neither dup2 can clobber the other, then map them onto 3 and 4.
        // dup2 clears close-on-exec on the targets only.
        unsafe {
            command.pre_exec(move || {
                let high_result = libc::fcntl(result_fd, libc::F_DUPFD_CLOEXEC, 10);
                let high_error = libc::fcntl(error_fd, libc::F_DUPFD_CLOEXEC, 10);
                if high_result < 0 || high_error < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(high_result, RESULT_FD) < 0 || libc::dup2(high_error, ERROR_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_err)?;

        // Close the child-side ends in the parent so a dead worker reads as EOF
        drop(result_write);
        drop(error_write);

        let mut handle = Self {
            operation: operation.to_string(),
            child,
            result_rx: OneShotReceiver::new(result_read),
            error_rx: OneShotReceiver::new(error_read),
            grace,
            started: Instant::now(),
            state: InvocationState::Starting,
        };
        handle.transition(InvocationState::Running);
        Ok(handle)
    }

    /// Process id of the worker
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Current state
    pub fn state(&self) -> InvocationState {
        self.state
    }

    fn transition(&mut self, next: InvocationState) {
        tracing::debug!(
            target: "isoload::executor",
            operation = %self.operation,
            pid = self.child.id(),
            from = %self.state,
            to = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "invocation state"
        );
        self.state = next;
    }

    /// Pull in whatever the channels hold right now, waiting at most `wait`
    fn pump_channels(&mut self, wait: Duration) {
        let fds: Vec<_> = [self.result_rx.raw_fd(), self.error_rx.raw_fd()]
            .into_iter()
            .flatten()
            .collect();

        if fds.is_empty() {
            std::thread::sleep(wait);
            return;
        }

        match poll_fds(&fds, wait) {
            PollResult::Ready(ready) => {
                if self.result_rx.raw_fd().is_some_and(|fd| ready.contains(&fd)) {
                    if let Err(e) = self.result_rx.pump() {
                        tracing::warn!(target: "isoload::executor", operation = %self.operation, "result channel: {e}");
                    }
                }
                if self.error_rx.raw_fd().is_some_and(|fd| ready.contains(&fd)) {
                    if let Err(e) = self.error_rx.pump() {
                        tracing::warn!(target: "isoload::executor", operation = %self.operation, "error channel: {e}");
                    }
                }
            }
            PollResult::Timeout => {}
            PollResult::Error(e) => {
                tracing::warn!(target: "isoload::executor", operation = %self.operation, "poll failed: {e}");
                std::thread::sleep(wait);
            }
        }
    }

    /// Wait for the worker to exit, up to `timeout`, then settle the outcome
    fn wait(&mut self, timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        let deadline = self.started + timeout;

        let status = loop {
            match try_status(&mut self.child) {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    self.transition(InvocationState::Failed);
                    return Err(ExecutionError::Wait {
                        operation: self.operation.clone(),
                        source,
                    });
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.time_out(timeout));
            }
            // Reading while waiting keeps a large payload from stalling the
            // worker on a full pipe
            self.pump_channels(remaining.min(POLL_SLICE));
        };

        match ExitKind::from(status) {
            ExitKind::Code(0) => {
                self.transition(InvocationState::Completed);
                match self.result_rx.try_recv() {
                    Ok(Some(payload)) => Ok(payload),
                    Ok(None) => Err(ExecutionError::MissingPayload {
                        operation: self.operation.clone(),
                    }),
                    Err(source) => Err(ExecutionError::Ipc {
                        operation: self.operation.clone(),
                        source,
                    }),
                }
            }
            exit => {
                self.transition(InvocationState::Failed);
                match self.error_rx.try_recv() {
                    Ok(Some(payload)) => Err(ExecutionError::WorkerException {
                        operation: self.operation.clone(),
                        payload: Box::new(payload),
                    }),
                    Ok(None) => Err(match exit {
                        ExitKind::Code(code) => ExecutionError::NonzeroExit {
                            operation: self.operation.clone(),
                            code,
                        },
                        ExitKind::Signal(signal) => ExecutionError::Killed {
                            operation: self.operation.clone(),
                            signal,
                        },
                    }),
                    Err(source) => Err(ExecutionError::Ipc {
                        operation: self.operation.clone(),
                        source,
                    }),
                }
            }
        }
    }

    fn time_out(&mut self, timeout: Duration) -> ExecutionError {
        self.transition(InvocationState::TimedOut);
        let pid = self.child.id();
        self.transition(InvocationState::Terminating);
        let termination = terminate(&mut self.child, self.grace);
        tracing::warn!(
            target: "isoload::executor",
            operation = %self.operation,
            pid,
            ?termination,
            "worker timed out after {timeout:?}"
        );
        ExecutionError::Timeout {
            operation: self.operation.clone(),
            timeout,
            pid,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if terminate(&mut self.child, self.grace) != Termination::AlreadyExited {
            tracing::warn!(
                target: "isoload::executor",
                operation = %self.operation,
                pid = self.child.id(),
                "worker was still running at cleanup"
            );
        }
        let discarded = self.result_rx.drain() + self.error_rx.drain();
        if discarded > 0 {
            tracing::debug!(target: "isoload::executor", operation = %self.operation, discarded, "discarded unread payloads");
        }
        self.transition(InvocationState::CleanedUp);
    }
}

/// Log a worker's captured streams
pub(crate) fn log_captured(operation: &str, stdout: &str, stderr: &str, failed: bool) {
    for (stream, text) in [("stdout", stdout), ("stderr", stderr)] {
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        if failed {
            tracing::error!(target: "isoload::executor", operation, stream, "captured output:\n{text}");
        } else {
            tracing::info!(target: "isoload::executor", operation, stream, "captured output:\n{text}");
        }
    }
}

/// Log the terminal state of an invocation
pub(crate) fn log_outcome(
    operation: &str,
    elapsed: Duration,
    outcome: &Result<ResultPayload, ExecutionError>,
) {
    match outcome {
        Ok(payload) => {
            tracing::info!(
                target: "isoload::executor",
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                keys = ?payload.summary_keys,
                "{}",
                payload.message
            );
            log_captured(operation, &payload.stdout, &payload.stderr, false);
        }
        Err(e) => {
            tracing::error!(
                target: "isoload::executor",
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                kind = e.kind(),
                "{e}"
            );
            match e {
                ExecutionError::WorkerException { payload, .. } => {
                    if !payload.traceback.is_empty() {
                        tracing::error!(target: "isoload::executor", operation, "traceback:\n{}", payload.traceback.trim_end());
                    }
                    log_captured(operation, &payload.stdout, &payload.stderr, true);
                }
                ExecutionError::MalformedTransport { raw, .. } if !raw.is_empty() => {
                    tracing::error!(target: "isoload::executor", operation, "raw output:\n{raw}");
                }
                _ => {}
            }
        }
    }
}

/// Spawns one worker process per invocation of the current binary (or a
/// configured worker binary) in worker mode.
#[derive(Debug, Clone)]
pub struct IsolatedExecutor {
    worker_config: WorkerConfig,
    registry: Option<Arc<Registry>>,
    grace: Duration,
    worker_binary: Option<PathBuf>,
    worker_args: Vec<OsString>,
}

impl IsolatedExecutor {
    /// Executor re-executing the current binary
    pub fn new(worker_config: WorkerConfig) -> Self {
        Self {
            worker_config,
            registry: None,
            grace: DEFAULT_GRACE_PERIOD,
            worker_binary: None,
            worker_args: Vec::new(),
        }
    }

    /// Reject unknown operations before spawning anything
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Wait between SIGTERM and SIGKILL
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Spawn this binary instead of the current executable
    pub fn with_worker_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(binary.into());
        self
    }

    /// Arguments placed before the worker flag
    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Configured grace period
    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    fn command(&self, operation: &str) -> Result<Command, ExecutionError> {
        let binary = match &self.worker_binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe().map_err(|source| ExecutionError::Spawn {
                operation: operation.to_string(),
                source,
            })?,
        };
        let config = self
            .worker_config
            .to_env_value()
            .map_err(|e| ExecutionError::Io(std::io::Error::other(e)))?;

        let mut command = Command::new(binary);
        command
            .args(&self.worker_args)
            .arg(WORKER_FLAG)
            .arg(operation)
            .env(IPC_FD_ENV, format!("{RESULT_FD},{ERROR_FD}"))
            .env(WORKER_CONFIG_ENV, config)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        Ok(command)
    }

    fn run(&self, operation: &str, timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.resolve(operation) {
                tracing::debug!(target: "isoload::executor", operation, "{e}");
                return Err(ExecutionError::UnknownOperation {
                    operation: operation.to_string(),
                });
            }
        }

        let mut command = self.command(operation)?;
        let mut worker = WorkerHandle::spawn(&mut command, operation, self.grace)?;
        tracing::info!(
            target: "isoload::executor",
            operation,
            pid = worker.pid(),
            ?timeout,
            "spawned worker"
        );
        worker.wait(timeout)
        // `worker` drops here: channels drained, process reaped
    }
}

impl Isolate for IsolatedExecutor {
    fn execute(&self, operation: &str, timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        let start = Instant::now();
        let outcome = self.run(operation, timeout);
        log_outcome(operation, start.elapsed(), &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Executor whose "worker" is a shell script; the operation name arrives as `$2`
    fn shell(script: &str) -> IsolatedExecutor {
        IsolatedExecutor::new(WorkerConfig::default())
            .with_worker_binary("/bin/sh")
            .with_worker_args(["-c", script, "worker"])
            .with_grace_period(Duration::from_millis(500))
    }

    fn is_running(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn clean_exit_without_payload_is_missing_payload() {
        let err = shell("exit 0").execute("op", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingPayload { operation } if operation == "op"));
    }

    #[test]
    fn nonzero_exit_without_payload_reports_code() {
        let err = shell("exit 7").execute("op", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ExecutionError::NonzeroExit { code: 7, .. }));
    }

    #[test]
    fn death_by_signal_is_reported() {
        let err = shell("kill -9 $$").execute("op", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ExecutionError::Killed { signal, .. } if signal == libc::SIGKILL));
    }

    #[test]
    fn worker_sees_flag_operation_and_channels() {
        let script = format!(
            "[ \"$1\" = {WORKER_FLAG} ] && [ \"$2\" = my_op ] && [ \"${IPC_FD_ENV}\" = 3,4 ] && [ -n \"${WORKER_CONFIG_ENV}\" ] && exit 0; exit 9"
        );
        let err = shell(&script).execute("my_op", Duration::from_secs(10)).unwrap_err();
        // Exit 0 proves the contract; no payload was written
        assert!(matches!(err, ExecutionError::MissingPayload { .. }));
    }

    #[test]
    fn hung_worker_is_terminated_within_bound() {
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let err = shell("sleep 30").execute("op", timeout).unwrap_err();
        let elapsed = start.elapsed();

        let ExecutionError::Timeout { pid, timeout: reported, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(reported, timeout);
        assert!(elapsed < timeout + Duration::from_millis(500) + Duration::from_secs(1));
        assert!(!is_running(pid));
    }

    #[test]
    fn sigterm_ignoring_worker_is_killed_after_grace() {
        let start = Instant::now();
        let err = shell("trap '' TERM; while true; do sleep 1; done")
            .execute("op", Duration::from_millis(300))
            .unwrap_err();
        let elapsed = start.elapsed();

        let ExecutionError::Timeout { pid, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert!(elapsed >= Duration::from_millis(800));
        assert!(!is_running(pid));
    }

    #[test]
    fn unknown_operation_is_rejected_before_spawn() {
        let executor = shell("exit 0").with_registry(Arc::new(Registry::new()));
        let err = executor.execute("nope", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownOperation { .. }));
        assert_eq!(err.kind(), "UnknownOperation");
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let executor = IsolatedExecutor::new(WorkerConfig::default())
            .with_worker_binary("/nonexistent/isoload-worker");
        let err = executor.execute("op", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }
}
