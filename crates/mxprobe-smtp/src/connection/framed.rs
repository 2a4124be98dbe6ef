//! Line framing for SMTP replies.
//!
//! Replies are CRLF-terminated lines; a multi-line reply continues while
//! the fourth byte is `-`.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::Reply;

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Longest accepted reply line (RFC 5321 allows 512 octets).
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Most lines accepted in one multi-line reply.
const MAX_REPLY_LINES: usize = 256;

/// Buffered reader that yields whole SMTP replies.
#[derive(Debug)]
pub struct ReplyReader<R> {
    reader: BufReader<R>,
    line: BytesMut,
}

impl<R> ReplyReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps a readable stream.
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            line: BytesMut::with_capacity(512),
        }
    }

    /// Reads one complete (possibly multi-line) reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] on EOF and [`Error::Protocol`] for
    /// oversized or malformed replies.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if !has_reply_code(&line) {
                return Err(Error::Protocol(format!("malformed reply line: {line}")));
            }
            let last = is_last_reply_line(&line);
            lines.push(line);
            if last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol(format!(
                    "reply exceeds {MAX_REPLY_LINES} lines"
                )));
            }
        }
        tracing::trace!(?lines, "S:");
        parse_reply(&lines)
    }

    async fn read_line(&mut self) -> Result<String> {
        self.line.clear();

        loop {
            let buf = match self.reader.fill_buf().await {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(Error::ConnectionClosed);
                }
                Err(e) => return Err(e.into()),
            };
            if buf.is_empty() {
                return Err(Error::ConnectionClosed);
            }

            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                self.line.extend_from_slice(&buf[..=pos]);
                self.reader.consume(pos + 1);
                break;
            }

            let len = buf.len();
            self.line.extend_from_slice(buf);
            self.reader.consume(len);

            if self.line.len() > MAX_LINE_LENGTH {
                return Err(Error::Protocol("line too long".to_string()));
            }
        }

        let text = String::from_utf8_lossy(&self.line);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Returns true if bytes are buffered but not yet consumed.
    #[must_use]
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Gets a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        self.reader.get_mut()
    }

    /// Consumes the reader, returning the underlying stream.
    ///
    /// Buffered bytes are discarded; check [`Self::has_buffered_data`] first.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }
}

fn has_reply_code(line: &str) -> bool {
    line.as_bytes()
        .get(..3)
        .is_some_and(|code| code.iter().all(u8::is_ascii_digit))
}
