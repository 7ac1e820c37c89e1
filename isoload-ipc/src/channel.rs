//! One-Shot Channels
//!
//! A channel is a pipe. The worker holds the write end (inherited as a fixed
//! descriptor) and sends at most one frame before closing it; the supervisor
//! holds the read end and never blocks waiting for data that may not come.

use crate::framing::{FrameError, read_frame, write_frame};
use crate::payload::{CapturedStreams, truncate_streams};
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use thiserror::Error;

/// Room left for archive overhead and the truncation marker when shrinking
/// an oversized payload
const FIT_SLACK: usize = 4096;

/// Errors raised by channel endpoints
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Reading or writing the pipe failed
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded
    #[error("channel frame error: {0}")]
    Frame(#[from] FrameError),

    /// The descriptor handed to the channel is unusable
    #[error("invalid channel descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Result of polling for data
#[derive(Debug)]
pub enum PollResult {
    /// At least one descriptor is readable (data or end-of-stream)
    Ready(Vec<RawFd>),
    /// Nothing arrived before the timeout
    Timeout,
    /// poll(2) itself failed
    Error(std::io::Error),
}

/// Wait until any of `fds` is readable or hung up, up to `timeout`.
///
/// A zero timeout performs a non-blocking check.
pub fn poll_fds(fds: &[RawFd], timeout: Duration) -> PollResult {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let result = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return PollResult::Timeout;
        }
        PollResult::Error(err)
    } else if result == 0 {
        PollResult::Timeout
    } else {
        // Hang-up counts as readable: the next read observes end-of-stream
        let ready: Vec<RawFd> = pollfds
            .iter()
            .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|p| p.fd)
            .collect();
        if ready.is_empty() {
            PollResult::Timeout
        } else {
            PollResult::Ready(ready)
        }
    }
}

/// Create a pipe pair with close-on-exec set on both ends, returning (read, write).
///
/// Descriptors meant for a child are re-mapped explicitly at spawn time, so
/// nothing else leaks into concurrently spawned processes.
pub fn create_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(target_os = "linux")]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    let ret = unsafe {
        let ret = libc::pipe(fds.as_mut_ptr());
        if ret == 0 {
            for &fd in &fds {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
        ret
    };

    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

/// Sending half of a one-shot channel. Sending consumes it.
pub struct OneShotSender<T> {
    file: File,
    _marker: PhantomData<fn(T)>,
}

impl<T> OneShotSender<T>
where
    T: Serialize<AllocSerializer<256>>,
{
    /// Wrap an owned write end
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            _marker: PhantomData,
        }
    }

    /// Take ownership of an inherited descriptor.
    ///
    /// # Safety
    /// `fd` must be an open descriptor not owned by anything else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, ChannelError> {
        if fd < 0 {
            return Err(ChannelError::InvalidDescriptor(fd.to_string()));
        }
        // Keep the descriptor out of anything the operation itself spawns
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 {
                return Err(ChannelError::InvalidDescriptor(format!(
                    "{fd}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
        Ok(Self::new(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Send the single value and close the channel
    pub fn send(mut self, value: &T) -> Result<(), ChannelError> {
        self.try_send(value)
    }

    /// Send without giving up the sender. A value over the frame limit is
    /// rejected before anything is written, so the channel stays usable.
    pub fn try_send(&mut self, value: &T) -> Result<(), ChannelError> {
        write_frame(&mut self.file, value)?;
        Ok(())
    }
}

impl<T> OneShotSender<T>
where
    T: Serialize<AllocSerializer<256>> + CapturedStreams,
{
    /// Send `payload`; if it exceeds the frame limit, drop the oldest captured
    /// output and try once more. A payload that still does not fit yields
    /// [`FrameError::FrameTooLarge`] with nothing written.
    pub fn send_fitted(&mut self, payload: &mut T) -> Result<(), ChannelError> {
        match self.try_send(payload) {
            Err(ChannelError::Frame(FrameError::FrameTooLarge { size, max })) => {
                let (stdout, stderr) = payload.streams_mut();
                let removed = truncate_streams(stdout, stderr, size - max + FIT_SLACK);
                if removed == 0 {
                    return Err(FrameError::FrameTooLarge { size, max }.into());
                }
                self.try_send(payload)
            }
            other => other,
        }
    }
}

/// Receiving half of a one-shot channel.
///
/// Data is pulled in with [`pump`](Self::pump) while the producer is still
/// running (so a large payload never stalls on pipe capacity) and taken out
/// with [`try_recv`](Self::try_recv), which never blocks on an empty channel.
pub struct OneShotReceiver<T> {
    file: Option<File>,
    slot: Option<T>,
    extra: usize,
}

impl<T> OneShotReceiver<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    /// Wrap an owned read end
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
            slot: None,
            extra: 0,
        }
    }

    /// Raw descriptor of the read end, if the channel is still open
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    /// Whether the producer side may still deliver data
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Read whatever is available now. Call only after a poll reported the
    /// descriptor ready, or after the producer has exited.
    pub fn pump(&mut self) -> Result<(), ChannelError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        match read_frame::<_, T>(file) {
            Ok(value) => {
                if self.slot.is_none() {
                    self.slot = Some(value);
                } else {
                    self.extra += 1;
                }
                Ok(())
            }
            Err(FrameError::EndOfStream) => {
                self.file = None;
                Ok(())
            }
            Err(e) => {
                self.file = None;
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` for the channel to become readable and pull in
    /// what arrived. Returns whether a value is now held.
    pub fn poll_ready(&mut self, timeout: Duration) -> Result<bool, ChannelError> {
        if self.slot.is_none() {
            if let Some(fd) = self.raw_fd() {
                match poll_fds(&[fd], timeout) {
                    PollResult::Ready(_) => self.pump()?,
                    PollResult::Timeout => {}
                    PollResult::Error(e) => return Err(ChannelError::Io(e)),
                }
            }
        }
        Ok(self.slot.is_some())
    }

    /// Non-blocking receive: `Ok(None)` means the channel is empty right now.
    pub fn try_recv(&mut self) -> Result<Option<T>, ChannelError> {
        self.poll_ready(Duration::ZERO)?;
        Ok(self.slot.take())
    }

    /// Discard anything left and close the read end. Returns the number of
    /// values thrown away.
    pub fn drain(&mut self) -> usize {
        let mut discarded = self.extra;
        if self.slot.take().is_some() {
            discarded += 1;
        }
        self.extra = 0;
        self.file = None;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorPayload, FailureKind};

    #[test]
    fn empty_channel_is_observed_immediately() {
        let (read, _write) = create_pipe().unwrap();
        let mut rx: OneShotReceiver<ErrorPayload> = OneShotReceiver::new(read);

        let start = std::time::Instant::now();
        assert!(rx.try_recv().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(rx.is_open());
    }

    #[test]
    fn sent_value_is_received_once() {
        let (read, write) = create_pipe().unwrap();
        let mut rx: OneShotReceiver<ErrorPayload> = OneShotReceiver::new(read);
        let tx = OneShotSender::new(write);

        let payload = ErrorPayload::new(FailureKind::OperationError, "bad", "trace");
        tx.send(&payload).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Some(payload));
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn closed_without_value_reads_as_empty() {
        let (read, write) = create_pipe().unwrap();
        let mut rx: OneShotReceiver<ErrorPayload> = OneShotReceiver::new(read);
        drop(write);

        match poll_fds(&[rx.raw_fd().unwrap()], Duration::from_millis(100)) {
            PollResult::Ready(_) => rx.pump().unwrap(),
            other => panic!("expected hang-up, got {other:?}"),
        }
        assert!(!rx.is_open());
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn drain_discards_pending_value() {
        let (read, write) = create_pipe().unwrap();
        let mut rx: OneShotReceiver<ErrorPayload> = OneShotReceiver::new(read);
        OneShotSender::new(write)
            .send(&ErrorPayload::new(FailureKind::Panic, "p", "t"))
            .unwrap();

        rx.pump().unwrap();
        assert_eq!(rx.drain(), 1);
        assert!(!rx.is_open());
    }
}
