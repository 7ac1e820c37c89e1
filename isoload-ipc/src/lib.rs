#![warn(missing_docs)]
//! isoload IPC
//!
//! Everything that crosses the boundary between the process running a load
//! test and the disposable worker processes it spawns:
//! - Result and error payloads (rkyv for the pipe transport, serde for JSON)
//! - Length-prefixed framing over pipes
//! - One-shot channels backed by inherited file descriptors
//! - The sentinel text protocol used by the external helper program

mod channel;
mod framing;
mod payload;
mod sentinel;

pub use channel::{ChannelError, OneShotReceiver, OneShotSender, PollResult, create_pipe, poll_fds};
pub use framing::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use payload::{
    CapturedStreams, DeliveredSet, ErrorPayload, FailureKind, ResultPayload, truncate_streams,
};
pub use sentinel::{
    HelperError, HelperOutput, RESULT_END, RESULT_START, SentinelError, extract_block,
    parse_output, render_block, strip_block,
};

/// Environment variable announcing the inherited channel descriptors (`"<result>,<error>"`)
pub const IPC_FD_ENV: &str = "ISOLOAD_IPC_FD";

/// Descriptor number the result channel is mapped to inside a worker
pub const RESULT_FD: i32 = 3;

/// Descriptor number the error channel is mapped to inside a worker
pub const ERROR_FD: i32 = 4;
