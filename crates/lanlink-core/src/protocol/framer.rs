//! Newline framing for TCP streams and UDP datagrams.
//!
//! TCP is a *stream* protocol: a single `read()` may return half a packet or
//! three packets at once.  [`LineFramer`] buffers incoming bytes and yields one
//! item per `\n`-terminated line, with the delimiter stripped.  Only `\n` is a
//! delimiter; a preceding `\r` stays part of the line.
//!
//! The framer implements the `tokio_util::codec` traits so it plugs straight
//! into `FramedRead` / `FramedWrite`.  A fresh framer is created for every
//! session, and whatever partial line is buffered when the session ends is
//! discarded by [`Decoder::decode_eof`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

const DELIMITER: u8 = b'\n';

/// Errors produced while framing.
#[derive(Debug, Error)]
pub enum FramerError {
    /// A line grew past the configured limit without a delimiter.
    #[error("line exceeds the maximum length of {limit} bytes")]
    LineTooLong { limit: usize },

    /// An outgoing text contained the delimiter and would split into two packets.
    #[error("outgoing text contains a raw newline")]
    EmbeddedDelimiter,

    /// The underlying transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits a byte stream into lines on `\n`.
#[derive(Debug, Clone, Default)]
pub struct LineFramer {
    max_length: Option<usize>,
    /// Index in the buffer up to which we already know there is no delimiter.
    next_index: usize,
}

impl LineFramer {
    /// Creates a framer without a line-length bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer that fails with [`FramerError::LineTooLong`] once a
    /// line (excluding the delimiter) exceeds `max_length` bytes.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Frames a single UDP datagram.
    ///
    /// The datagram boundary terminates the last line, so trailing bytes
    /// without a `\n` are returned as a complete line.  Empty lines are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FramerError::LineTooLong`] if any line exceeds the limit.
    pub fn frame_datagram(&mut self, datagram: &[u8]) -> Result<Vec<Bytes>, FramerError> {
        let mut buf = BytesMut::from(datagram);
        let mut lines = Vec::new();
        while let Some(line) = self.decode(&mut buf)? {
            if !line.is_empty() {
                lines.push(line);
            }
        }
        self.next_index = 0;
        if !buf.is_empty() {
            lines.push(buf.freeze());
        }
        Ok(lines)
    }

    fn check_length(&self, len: usize) -> Result<(), FramerError> {
        match self.max_length {
            Some(limit) if len > limit => Err(FramerError::LineTooLong { limit }),
            _ => Ok(()),
        }
    }
}

impl Decoder for LineFramer {
    type Item = Bytes;
    type Error = FramerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramerError> {
        let start = self.next_index.min(buf.len());
        match buf[start..].iter().position(|b| *b == DELIMITER) {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;
                self.check_length(end)?;
                let mut line = buf.split_to(end + 1);
                line.truncate(end);
                Ok(Some(line.freeze()))
            }
            None => {
                self.check_length(buf.len())?;
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramerError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if !buf.is_empty() {
            debug!(bytes = buf.len(), "discarding unterminated data at end of stream");
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<&str> for LineFramer {
    type Error = FramerError;

    fn encode(&mut self, text: &str, dst: &mut BytesMut) -> Result<(), FramerError> {
        if text.as_bytes().contains(&DELIMITER) {
            return Err(FramerError::EmbeddedDelimiter);
        }
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

impl Encoder<String> for LineFramer {
    type Error = FramerError;

    fn encode(&mut self, text: String, dst: &mut BytesMut) -> Result<(), FramerError> {
        Encoder::<&str>::encode(self, text.as_str(), dst)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
