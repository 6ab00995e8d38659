//! DAP message framing
//!
//! Frames and parses DAP messages over any async byte stream:
//!
//! ```text
//! Content-Length: <N>\r\n\r\n<N bytes of UTF-8 JSON>
//! ```
//!
//! The reader and writer halves are separate types so the dispatcher can
//! keep a single reader task while writes come from callers.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::dap::error::TransportError;
use crate::dap::types::Message;

/// Header key carrying the body length (matched case-sensitively)
const CONTENT_LENGTH_HEADER: &str = "Content-Length:";

/// Maximum accepted body size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Maximum length of one header line, terminator included
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Encode a message into one complete frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(message).map_err(TransportError::Encode)?;
    let mut frame = format!("{CONTENT_LENGTH_HEADER} {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ============================================================================
// Reader Half
// ============================================================================

/// Reads one framed message per call from the adapter's output stream
pub struct TransportReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> TransportReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read exactly one message.
    ///
    /// Returns `EndOfStream` if the stream closes anywhere inside a frame,
    /// `Framing` for a bad header block and `Decode` for a bad body. After a
    /// `Decode` error the stream is still positioned at the next frame.
    pub async fn read_message(&mut self) -> Result<Message, TransportError> {
        let content_length = self.read_headers().await?;

        let mut body = vec![0u8; content_length];
        match self.reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::EndOfStream);
            }
            Err(e) => return Err(TransportError::Io(e)),
        }

        trace!("DapTransport: Read frame ({} bytes)", content_length);

        serde_json::from_slice(&body).map_err(TransportError::Decode)
    }

    /// Consume header lines up to the blank separator line and return the
    /// Content-Length value
    async fn read_headers(&mut self) -> Result<usize, TransportError> {
        let mut content_length: Option<usize> = None;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE as u64 + 1)
                .read_until(b'\n', &mut line)
                .await?;

            if line.len() > MAX_HEADER_LINE {
                return Err(TransportError::Framing(format!(
                    "header line exceeds {MAX_HEADER_LINE} bytes"
                )));
            }

            // EOF before the line terminator: either a clean close between
            // frames or a truncated header, both end the stream
            if read == 0 || line.last() != Some(&b'\n') {
                return Err(TransportError::EndOfStream);
            }

            let text = std::str::from_utf8(&line)
                .map_err(|_| TransportError::Framing("header is not valid UTF-8".to_string()))?;
            let text = text.trim_end_matches(['\r', '\n']);

            if text.is_empty() {
                break;
            }

            if let Some(value) = text.strip_prefix(CONTENT_LENGTH_HEADER) {
                let value = value.trim();
                let length = value.parse::<usize>().map_err(|_| {
                    TransportError::Framing(format!("invalid Content-Length: '{value}'"))
                })?;

                if length > MAX_MESSAGE_SIZE {
                    return Err(TransportError::Framing(format!(
                        "message too large: {length} bytes (max: {MAX_MESSAGE_SIZE})"
                    )));
                }

                content_length = Some(length);
            } else {
                trace!("DapTransport: Ignoring header line '{}'", text);
            }
        }

        content_length
            .ok_or_else(|| TransportError::Framing("missing Content-Length header".to_string()))
    }
}

// ============================================================================
// Writer Half
// ============================================================================

/// Writes framed messages to the adapter's input stream
pub struct TransportWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> TransportWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one complete frame and flush it
    pub async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = encode_frame(message)?;

        trace!(
            "DapTransport: Writing {} '{}' frame ({} bytes)",
            message.kind(),
            message.name(),
            frame.len()
        );

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and shut down the underlying stream
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Combined Transport
// ============================================================================

/// Duplex DAP transport over a read stream and a write stream
pub struct DapTransport<R, W> {
    reader: TransportReader<R>,
    writer: TransportWriter<W>,
}

impl<R, W> DapTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: TransportReader::new(reader),
            writer: TransportWriter::new(writer),
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.write_message(message).await
    }

    pub async fn read_message(&mut self) -> Result<Message, TransportError> {
        self.reader.read_message().await
    }
}
