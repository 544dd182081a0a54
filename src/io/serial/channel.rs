// src/io/serial/channel.rs
//
// Line-oriented view of the serial byte stream.
//
// The read half accumulates bytes into `\r`-terminated lines with a hard
// length bound. The write half is shared between the command task (acks and
// replies) and the forwarding task (received frames); every write goes out
// as one unit under a single lock so lines never interleave.

use std::sync::Arc;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

use crate::io::error::ProtocolError;
use crate::io::slcan::{ACK_ERROR, TERMINATOR};

/// Longest accepted command line, terminator excluded.
/// `T` + 8 ID digits + DLC + 16 data digits is 26 bytes.
pub const SLCAN_MTU: usize = 32;

// =============================================================================
// Line Buffer
// =============================================================================

/// Bounded accumulator for one partially received line.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_length: usize,
    /// Set after an overflow; input is discarded up to the next terminator
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_length: usize) -> Self {
        LineBuffer {
            buffer: Vec::with_capacity(max_length),
            max_length,
            discarding: false,
        }
    }

    /// Feed one byte.
    ///
    /// Returns `Some(Ok(line))` when a terminator completes a line and
    /// `Some(Err(LineTooLong))` the moment the bound is exceeded. The rest of
    /// an overlong line, up to and including its terminator, is dropped.
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        match byte {
            TERMINATOR if self.discarding => {
                self.discarding = false;
                None
            }
            TERMINATOR => Some(Ok(self.buffer.drain(..).collect())),
            // CRLF senders: the line feed carries no meaning
            b'\n' => None,
            _ if self.discarding => None,
            _ if self.buffer.len() >= self.max_length => {
                self.buffer.clear();
                self.discarding = true;
                Some(Err(ProtocolError::LineTooLong {
                    limit: self.max_length,
                }))
            }
            _ => {
                self.buffer.push(byte);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// =============================================================================
// Serial Channel
// =============================================================================

/// Byte-stream transport split into a line reader and a shared line writer.
pub struct SerialChannel<T> {
    stream: T,
    max_line: usize,
}

impl<T> SerialChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: T) -> Self {
        Self::with_line_limit(stream, SLCAN_MTU)
    }

    pub fn with_line_limit(stream: T, max_line: usize) -> Self {
        SerialChannel { stream, max_line }
    }

    pub fn split(self) -> (SerialReader<ReadHalf<T>>, SerialWriter<WriteHalf<T>>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            SerialReader::new(read_half, self.max_line),
            SerialWriter::new(write_half),
        )
    }
}

/// Read half: yields complete command lines.
pub struct SerialReader<R> {
    inner: BufReader<R>,
    line: LineBuffer,
}

impl<R: AsyncRead + Unpin> SerialReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        SerialReader {
            inner: BufReader::new(inner),
            line: LineBuffer::new(max_line),
        }
    }

    /// Wait for the next complete line (terminator excluded).
    ///
    /// Returns `Ok(None)` once the stream is closed; a partial line pending
    /// at that point is dropped. Cancel-safe: bytes already consumed stay in
    /// the line buffer for the next call.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }

            let mut consumed = 0;
            let mut completed = None;
            for &byte in available {
                consumed += 1;
                if let Some(result) = self.line.push(byte) {
                    completed = Some(result);
                    break;
                }
            }
            self.inner.consume(consumed);

            if let Some(result) = completed {
                return result.map(Some);
            }
        }
    }
}

/// Write half: cloneable, every call writes one whole line or ack byte.
pub struct SerialWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SerialWriter<W> {
    fn clone(&self) -> Self {
        SerialWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> SerialWriter<W> {
    pub fn new(inner: W) -> Self {
        SerialWriter {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Write `line` followed by the `\r` terminator.
    pub async fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        self.write_line_if(line, || true).await.map(|_| ())
    }

    /// Write `line` only if `still_wanted` holds once the writer lock is held.
    /// Returns whether the line was written.
    pub async fn write_line_if(
        &self,
        line: &[u8],
        still_wanted: impl FnOnce() -> bool,
    ) -> std::io::Result<bool> {
        let mut port = self.inner.lock().await;
        if !still_wanted() {
            return Ok(false);
        }
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line);
        out.push(TERMINATOR);
        port.write_all(&out).await?;
        port.flush().await?;
        Ok(true)
    }

    /// Write a single acknowledgment byte: `\r` on success, bell on error.
    pub async fn write_ack(&self, ok: bool) -> std::io::Result<()> {
        let ack = if ok { TERMINATOR } else { ACK_ERROR };
        self.write_raw(&[ack]).await
    }

    /// Flush and shut down the write side.
    pub async fn close(&self) -> std::io::Result<()> {
        let mut port = self.inner.lock().await;
        port.shutdown().await
    }

    async fn write_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut port = self.inner.lock().await;
        port.write_all(bytes).await?;
        port.flush().await
    }
}

// =============================================================================
// Tests
// =============================================================================
