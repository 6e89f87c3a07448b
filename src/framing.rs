//! Incremental framing for the agent's streaming responses.
//!
//! The agent writes a run of JSON objects back to back with no delimiter,
//! followed by a final JSON *string* that holds the full response encoded a
//! second time. Frames are cut by naive brace matching: from the first `{`
//! to the first `}` after it. An object whose string values contain braces
//! never parses with that rule and stays in the buffer, which is exactly how
//! the trailing double-encoded payload survives until the stream closes.

use crate::constants::MAX_FRAME_BUFFER_BYTES;
use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unparsed upstream data exceeded {0} bytes")]
    BufferOverflow(usize),
}

#[derive(Debug, Clone)]
pub struct BraceFrameCodec {
    max_buffer: usize,
}

impl Default for BraceFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BraceFrameCodec {
    pub fn new() -> Self {
        Self {
            max_buffer: MAX_FRAME_BUFFER_BYTES,
        }
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self { max_buffer }
    }

    fn check_capacity(&self, buf: &BytesMut) -> Result<(), FrameError> {
        if buf.len() > self.max_buffer {
            return Err(FrameError::BufferOverflow(self.max_buffer));
        }
        Ok(())
    }
}

impl Decoder for BraceFrameCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        let start = match buf.iter().position(|b| *b == b'{') {
            Some(i) => i,
            None => {
                self.check_capacity(buf)?;
                return Ok(None);
            }
        };
        let end = match buf[start..].iter().position(|b| *b == b'}') {
            Some(i) => start + i,
            None => {
                self.check_capacity(buf)?;
                return Ok(None);
            }
        };

        // Brace bytes never occur inside a multi-byte sequence, so the
        // candidate slice always starts and ends on a character boundary.
        let candidate = std::str::from_utf8(&buf[start..=end])?;

        match serde_json::from_str::<Value>(candidate) {
            Ok(frame) => {
                buf.advance(end + 1);
                let leading_ws = buf
                    .iter()
                    .take_while(|b| b.is_ascii_whitespace())
                    .count();
                buf.advance(leading_ws);
                Ok(Some(frame))
            }
            Err(e) => {
                tracing::trace!("[☁️  -> ⚙️ ] Incomplete frame, waiting for more bytes: {}", e);
                self.check_capacity(buf)?;
                Ok(None)
            }
        }
    }

    /// Flushes whatever frames are complete and leaves the rest in the
    /// buffer so the caller can read it back as the stream residue.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        self.decode(buf)
    }
}

/// Decodes the bytes left behind once the upstream has closed.
pub fn residue_text(buf: &[u8]) -> Result<String, FrameError> {
    Ok(std::str::from_utf8(buf)?.trim().to_string())
}
