//! Payload framing for the one-shot channels

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{ErrorKind, Read, Write};
use thiserror::Error;

/// Largest payload a channel accepts (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Failure to move one payload across a pipe
#[derive(Debug, Error)]
pub enum FrameError {
    /// The pipe itself failed
    #[error("pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The payload could not be archived
    #[error("cannot encode payload: {0}")]
    Encode(String),

    /// The bytes received are not a valid archived payload
    #[error("cannot decode payload: {0}")]
    Decode(String),

    /// The length prefix exceeds [`MAX_FRAME_SIZE`]
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced or encoded size
        size: usize,
        /// Limit in force
        max: usize,
    },

    /// The writer went away mid-frame or announced an empty frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The pipe closed before a new frame started
    #[error("end of stream")]
    EndOfStream,
}

fn check_size(size: usize) -> Result<(), FrameError> {
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Archive `payload` and write it behind a little-endian `u32` length.
///
/// ```text
/// | len: u32 LE | rkyv archive (len bytes) |
/// ```
///
/// Prefix and archive go out in a single `write_all`, so a reader never
/// observes a bare prefix from a writer that died in between.
pub fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let archived =
        rkyv::to_bytes::<_, 256>(payload).map_err(|e| FrameError::Encode(e.to_string()))?;
    check_size(archived.len())?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + archived.len());
    frame.extend_from_slice(&(archived.len() as u32).to_le_bytes());
    frame.extend_from_slice(&archived);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and validate it as an archived `T`.
///
/// A stream that closes before the first prefix byte yields
/// [`FrameError::EndOfStream`]; one that closes later is an invalid frame.
pub fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut prefix = [0u8; PREFIX_LEN];
    if let Err(e) = reader.read_exact(&mut prefix) {
        return Err(match e.kind() {
            ErrorKind::UnexpectedEof => FrameError::EndOfStream,
            _ => FrameError::Io(e),
        });
    }

    let len = u32::from_le_bytes(prefix) as usize;
    check_size(len)?;
    if len == 0 {
        return Err(FrameError::InvalidFrame("empty frame".to_string()));
    }

    let mut body = rkyv::AlignedVec::with_capacity(len);
    body.resize(len, 0);
    if let Err(e) = reader.read_exact(&mut body) {
        return Err(match e.kind() {
            ErrorKind::UnexpectedEof => {
                FrameError::InvalidFrame(format!("writer closed before {len} bytes arrived"))
            }
            _ => FrameError::Io(e),
        });
    }

    rkyv::check_archived_root::<T>(&body)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .deserialize(&mut Infallible)
        .map_err(|e| FrameError::Decode(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorPayload, FailureKind, ResultPayload};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    #[test]
    fn result_payload_survives_the_pipe_format() {
        let mut delivered = BTreeMap::new();
        delivered.insert("sample".to_string(), vec!["root://a/b.root".to_string()]);
        let original = ResultPayload::new(vec!["Sample".to_string()], delivered)
            .with_output("hello\n".to_string(), String::new());

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &original).unwrap();

        let decoded: ResultPayload = read_frame(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn closed_stream_is_end_of_stream() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let result: Result<ErrorPayload, _> = read_frame(&mut reader);
        assert!(matches!(result, Err(FrameError::EndOfStream)));
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let payload = ErrorPayload::new(FailureKind::Panic, "boom", "trace");
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &payload).unwrap();
        buffer.truncate(buffer.len() - 3);

        let result: Result<ErrorPayload, _> = read_frame(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(FrameError::InvalidFrame(_))));
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let buffer = ((MAX_FRAME_SIZE as u32) + 1).to_le_bytes().to_vec();
        let result: Result<ErrorPayload, _> = read_frame(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }
}
