//! Sentinel Text Protocol
//!
//! The external helper program prints exactly one JSON object to stdout,
//! wrapped between two marker lines:
//!
//! ```text
//! SERVICEX_RESULT_START
//! {"success": true, "result": {...}, "error": null}
//! SERVICEX_RESULT_END
//! ```
//!
//! Anything else on stdout (progress output, stray prints) is ignored by the
//! parser and surfaced separately by [`strip_block`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Marker line opening the result block
pub const RESULT_START: &str = "SERVICEX_RESULT_START";

/// Marker line closing the result block
pub const RESULT_END: &str = "SERVICEX_RESULT_END";

/// The JSON object inside the result block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperOutput {
    /// Whether the delivery call succeeded
    pub success: bool,
    /// Delivered files by sample name
    #[serde(default)]
    pub result: Option<BTreeMap<String, Vec<String>>>,
    /// Error details when `success` is false
    #[serde(default)]
    pub error: Option<HelperError>,
}

/// Error details reported by the helper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperError {
    /// Error type name
    #[serde(rename = "type")]
    pub kind: String,
    /// Error message
    pub message: String,
    /// Formatted trace, if any
    #[serde(default)]
    pub traceback: String,
}

impl HelperOutput {
    /// A successful result block
    pub fn success(result: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed result block
    pub fn failure(
        kind: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(HelperError {
                kind: kind.into(),
                message: message.into(),
                traceback: traceback.into(),
            }),
        }
    }
}

/// Errors raised while locating or decoding the result block
#[derive(Debug, Error)]
pub enum SentinelError {
    /// No start marker anywhere in the output
    #[error("missing SERVICEX_RESULT_START marker in helper output")]
    MissingStart,

    /// Start marker present but never closed
    #[error("missing SERVICEX_RESULT_END marker after SERVICEX_RESULT_START")]
    MissingEnd,

    /// The block is not a valid result object
    #[error("invalid JSON between result markers: {source}")]
    InvalidJson {
        /// Underlying decode error
        source: serde_json::Error,
        /// Text found between the markers
        raw: String,
    },
}

/// Render a result block, trailing newline included
pub fn render_block(output: &HelperOutput) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(output)?;
    Ok(format!("{RESULT_START}\n{json}\n{RESULT_END}\n"))
}

/// Byte range of the text between the first start marker and the first end
/// marker following it, plus the range of the whole block.
fn locate(stdout: &str) -> Result<(std::ops::Range<usize>, std::ops::Range<usize>), SentinelError> {
    let mut offset = 0;
    let mut inner_start = None;
    let mut block_start = 0;

    for line in stdout.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let line_end = offset + line.len();
        match inner_start {
            None if trimmed.trim() == RESULT_START => {
                block_start = offset;
                inner_start = Some(line_end);
            }
            Some(start) if trimmed.trim() == RESULT_END => {
                return Ok((start..offset, block_start..line_end));
            }
            _ => {}
        }
        offset = line_end;
    }

    match inner_start {
        None => Err(SentinelError::MissingStart),
        Some(_) => Err(SentinelError::MissingEnd),
    }
}

/// Text between the markers, untrimmed
pub fn extract_block(stdout: &str) -> Result<&str, SentinelError> {
    let (inner, _) = locate(stdout)?;
    Ok(&stdout[inner])
}

/// Locate and decode the result block
pub fn parse_output(stdout: &str) -> Result<HelperOutput, SentinelError> {
    let raw = extract_block(stdout)?.trim();
    serde_json::from_str(raw).map_err(|source| SentinelError::InvalidJson {
        source,
        raw: raw.to_string(),
    })
}

/// Output with the result block removed; returned unchanged when no complete
/// block is present.
pub fn strip_block(stdout: &str) -> String {
    match locate(stdout) {
        Ok((_, block)) => {
            let mut rest = String::with_capacity(stdout.len() - block.len());
            rest.push_str(&stdout[..block.start]);
            rest.push_str(&stdout[block.end..]);
            rest
        }
        Err(_) => stdout.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_found_among_noise() {
        let mut result = BTreeMap::new();
        result.insert("sample".to_string(), vec!["/tmp/a.parquet".to_string()]);
        let block = render_block(&HelperOutput::success(result.clone())).unwrap();

        let stdout = format!("progress 10%\nprogress 100%\n{block}trailing line\n");
        let parsed = parse_output(&stdout).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.result, Some(result));
        assert_eq!(strip_block(&stdout), "progress 10%\nprogress 100%\ntrailing line\n");
    }

    #[test]
    fn failure_block_carries_error_details() {
        let stdout = format!(
            "{RESULT_START}\n{{\"success\": false, \"error\": {{\"type\": \"ValueError\", \"message\": \"Unknown dataset type: Rucio\"}}}}\n{RESULT_END}\n"
        );
        let parsed = parse_output(&stdout).unwrap();
        assert!(!parsed.success);
        assert!(parsed.result.is_none());
        let error = parsed.error.unwrap();
        assert_eq!(error.kind, "ValueError");
        assert_eq!(error.message, "Unknown dataset type: Rucio");
        assert!(error.traceback.is_empty());
    }

    #[test]
    fn missing_markers_are_explicit_errors() {
        assert!(matches!(
            parse_output("just some text\n"),
            Err(SentinelError::MissingStart)
        ));
        assert!(matches!(
            parse_output(&format!("{RESULT_START}\n{{}}\n")),
            Err(SentinelError::MissingEnd)
        ));
        assert_eq!(strip_block("no block\n"), "no block\n");
    }

    #[test]
    fn garbage_between_markers_is_reported_with_raw_text() {
        let stdout = format!("{RESULT_START}\nnot json\n{RESULT_END}\n");
        match parse_output(&stdout) {
            Err(SentinelError::InvalidJson { raw, .. }) => assert_eq!(raw, "not json"),
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn end_marker_before_start_is_ignored() {
        let stdout = format!(
            "{RESULT_END}\n{RESULT_START}\n{{\"success\": true, \"result\": {{}}}}\n{RESULT_END}\n"
        );
        let parsed = parse_output(&stdout).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.result, Some(BTreeMap::new()));
    }
}
