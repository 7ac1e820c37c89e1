//! Child Process Lifecycle
//!
//! Signal delivery, bounded waits and the SIGTERM, grace, SIGKILL escalation
//! shared by both isolation transports.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

/// Interval between liveness checks while waiting on a child
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(100);

const REAP_SLICE: Duration = Duration::from_millis(20);

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with this code
    Code(i32),
    /// Terminated by this signal
    Signal(i32),
}

impl From<ExitStatus> for ExitKind {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Code(code),
            (None, Some(signal)) => ExitKind::Signal(signal),
            // Neither code nor signal only happens for stopped children
            (None, None) => ExitKind::Code(-1),
        }
    }
}

/// Outcome of [`terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The child had already exited
    AlreadyExited,
    /// The child exited within the grace period after SIGTERM
    Graceful,
    /// The child had to be killed
    Killed,
}

/// Send a signal to a process. Returns `Err` if the signal could not be delivered.
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Exit status if the child has finished, without blocking.
///
/// An error means the child can no longer be waited on, e.g. it was reaped
/// by someone else (`ECHILD`); its exit status is lost.
pub(crate) fn try_status(child: &mut Child) -> io::Result<Option<ExitStatus>> {
    let status = child.try_wait();
    if let Err(e) = &status {
        tracing::warn!(target: "isoload::process", pid = child.id(), "cannot wait on child: {e}");
    }
    status
}

/// Wait until `deadline` for the child to exit. `Ok(None)` means the
/// deadline passed with the child still running.
pub(crate) fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = try_status(child)? {
            return Ok(Some(status));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        std::thread::sleep(remaining.min(REAP_SLICE));
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. The child is always reaped
/// before this returns.
pub(crate) fn terminate(child: &mut Child, grace: Duration) -> Termination {
    // A child that cannot be waited on is already gone
    if !matches!(try_status(child), Ok(None)) {
        return Termination::AlreadyExited;
    }

    // Ignore errors: the child may exit between the check and the signal
    let _ = send_signal(child.id(), libc::SIGTERM);
    if !matches!(wait_until(child, Instant::now() + grace), Ok(None)) {
        return Termination::Graceful;
    }

    let _ = child.kill();
    let _ = child.wait();
    Termination::Killed
}
