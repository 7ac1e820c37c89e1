//! Invocation Payloads
//!
//! A worker produces exactly one payload per invocation: a [`ResultPayload`]
//! on success or an [`ErrorPayload`] on failure. Both carry whatever the worker
//! wrote to its standard streams while it ran.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Files delivered for one named sample
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct DeliveredSet {
    /// Sample name
    pub name: String,
    /// Delivered file paths or URLs
    pub files: Vec<String>,
}

/// Payload of a successful invocation
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct ResultPayload {
    /// Always `true`
    pub success: bool,
    /// Top-level keys of the specification the operation produced
    pub summary_keys: Vec<String>,
    /// Human-readable completion message
    pub message: String,
    /// Result sets returned by the delivery call, by sample name
    #[serde(default)]
    pub delivered: Vec<DeliveredSet>,
    /// Captured standard output
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error
    #[serde(default)]
    pub stderr: String,
}

impl ResultPayload {
    /// Message attached to every successful payload
    pub const COMPLETED: &'static str = "ServiceX query completed successfully";

    /// Build a success payload from the spec keys and delivered result sets.
    pub fn new(summary_keys: Vec<String>, delivered: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            success: true,
            summary_keys,
            message: Self::COMPLETED.to_string(),
            delivered: delivered
                .into_iter()
                .map(|(name, files)| DeliveredSet { name, files })
                .collect(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Attach captured output
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Delivered result sets keyed by sample name
    pub fn delivered_map(&self) -> BTreeMap<&str, &[String]> {
        self.delivered
            .iter()
            .map(|set| (set.name.as_str(), set.files.as_slice()))
            .collect()
    }
}

/// Where inside the worker a failure originated
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum FailureKind {
    /// Requested name is not a registered load-test operation
    UnknownOperation,
    /// The operation body returned an error
    OperationError,
    /// The specification failed validation or reconstruction
    InvalidSpec,
    /// The delivery call failed
    DeliveryError,
    /// The operation or delivery panicked
    Panic,
    /// The worker could not read its inputs or fit its payload on a channel
    TransportError,
    /// Anything a foreign helper reported that we do not recognise
    Other,
}

impl FailureKind {
    /// Stable name used on the wire (`error.type` in the sentinel protocol)
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownOperation => "UnknownOperation",
            FailureKind::OperationError => "OperationError",
            FailureKind::InvalidSpec => "InvalidSpec",
            FailureKind::DeliveryError => "DeliveryError",
            FailureKind::Panic => "Panic",
            FailureKind::TransportError => "TransportError",
            FailureKind::Other => "Other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UnknownOperation" => FailureKind::UnknownOperation,
            "OperationError" => FailureKind::OperationError,
            "InvalidSpec" => FailureKind::InvalidSpec,
            "DeliveryError" => FailureKind::DeliveryError,
            "Panic" => FailureKind::Panic,
            "TransportError" => FailureKind::TransportError,
            _ => FailureKind::Other,
        })
    }
}

/// Payload of a failed invocation
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct ErrorPayload {
    /// Always `false`
    pub success: bool,
    /// Failure category
    pub kind: FailureKind,
    /// Error message
    pub error: String,
    /// Error chain or panic backtrace
    pub traceback: String,
    /// Captured standard output
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error
    #[serde(default)]
    pub stderr: String,
}

impl ErrorPayload {
    /// Build an error payload without captured output
    pub fn new(kind: FailureKind, error: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            success: false,
            kind,
            error: error.into(),
            traceback: traceback.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Attach captured output
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Payloads carrying a worker's captured standard streams
pub trait CapturedStreams {
    /// Captured stdout and stderr, mutable so they can be shortened to fit a frame
    fn streams_mut(&mut self) -> (&mut String, &mut String);
}

impl CapturedStreams for ResultPayload {
    fn streams_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.stdout, &mut self.stderr)
    }
}

impl CapturedStreams for ErrorPayload {
    fn streams_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.stdout, &mut self.stderr)
    }
}

/// Replace the oldest `wanted` bytes of `text` with a `[truncated N bytes]`
/// marker. Returns the net number of bytes removed.
fn truncate_head(text: &mut String, wanted: usize) -> usize {
    if text.is_empty() || wanted == 0 {
        return 0;
    }
    let mut cut = wanted.min(text.len());
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    let marker = format!("[truncated {cut} bytes]\n");
    text.replace_range(..cut, &marker);
    cut.saturating_sub(marker.len())
}

/// Shorten captured output by at least `excess` bytes, taking from the larger
/// stream first and keeping the most recent text. Returns the net number of
/// bytes removed, which falls short of `excess` when the streams are too small.
pub fn truncate_streams(stdout: &mut String, stderr: &mut String, excess: usize) -> usize {
    let (first, second) = if stdout.len() >= stderr.len() {
        (stdout, stderr)
    } else {
        (stderr, stdout)
    };
    let removed = truncate_head(first, excess);
    removed + truncate_head(second, excess.saturating_sub(removed))
}
