//! Output Capture
//!
//! Tees the process-wide standard output and standard error at the file
//! descriptor level: every write, whether it comes from Rust's std streams,
//! `tracing`, or native code, is copied to the original destination as it
//! happens and retained in memory for the result payload.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors raised while installing or tearing down a capture
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A descriptor operation failed
    #[error("output capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tee thread panicked
    #[error("tee thread for fd {0} panicked")]
    TeeThread(RawFd),
}

/// Text captured while the guard was installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Everything written to fd 1
    pub stdout: String,
    /// Everything written to fd 2
    pub stderr: String,
}

struct Tee {
    target: RawFd,
    saved: OwnedFd,
    thread: Option<JoinHandle<Vec<u8>>>,
}

fn dup_high(fd: RawFd) -> std::io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 10) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

fn redirect(from: RawFd, onto: RawFd) -> std::io::Result<()> {
    if unsafe { libc::dup2(from, onto) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn flush_std_streams() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

impl Tee {
    fn install(target: RawFd) -> Result<Self, CaptureError> {
        let saved = dup_high(target)?;
        let mut echo = File::from(saved.try_clone()?);
        let (read, write) = isoload_ipc::create_pipe()?;
        let mut reader = File::from(read);

        let thread = std::thread::Builder::new()
            .name(format!("isoload-tee-{target}"))
            .spawn(move || {
                let mut captured = Vec::new();
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Echo first so the console stays real-time
                            let _ = echo.write_all(&buf[..n]);
                            let _ = echo.flush();
                            captured.extend_from_slice(&buf[..n]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                captured
            })?;

        // The target now owns a copy of the write end; ours closes on drop
        redirect(write.as_raw_fd(), target)?;
        drop(write);

        Ok(Self {
            target,
            saved,
            thread: Some(thread),
        })
    }

    fn restore(&mut self) -> std::io::Result<()> {
        redirect(self.saved.as_raw_fd(), self.target)
    }

    fn finish(mut self) -> Result<String, CaptureError> {
        self.restore()?;
        let captured = match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CaptureError::TeeThread(self.target))?,
            None => Vec::new(),
        };
        Ok(String::from_utf8_lossy(&captured).into_owned())
    }
}

impl Drop for Tee {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.restore();
        }
    }
}

/// Guard holding both streams redirected.
///
/// Call [`finish`](Self::finish) to restore the streams and collect the text.
/// Dropping the guard restores the streams and discards the text.
pub struct OutputCapture {
    stdout: Option<Tee>,
    stderr: Option<Tee>,
}

impl OutputCapture {
    /// Start capturing fds 1 and 2
    pub fn install() -> Result<Self, CaptureError> {
        flush_std_streams();
        let stdout = Tee::install(libc::STDOUT_FILENO)?;
        let stderr = Tee::install(libc::STDERR_FILENO)?;
        Ok(Self {
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }

    /// Restore the original streams and return what was written
    pub fn finish(mut self) -> Result<CapturedOutput, CaptureError> {
        flush_std_streams();
        // Restore both before joining either, so a failure leaves nothing redirected
        let mut stdout = self.stdout.take();
        let mut stderr = self.stderr.take();
        for tee in stdout.iter_mut().chain(stderr.iter_mut()) {
            tee.restore()?;
        }
        let out = stdout.map(Tee::finish).transpose();
        let err = stderr.map(Tee::finish).transpose();
        Ok(CapturedOutput {
            stdout: out?.unwrap_or_default(),
            stderr: err?.unwrap_or_default(),
        })
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        flush_std_streams();
    }
}
