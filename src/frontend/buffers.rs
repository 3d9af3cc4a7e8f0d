use bytes::{Bytes, BytesMut};
use memchr::memchr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const SCRATCH_CAPACITY_HINT: usize = 4096;

/// Longest request line accepted, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

// -----------------------------------------------------------------------------
// ----- FrontendBuffers -------------------------------------------------------

/// Inbound line framing and outbound reply batching for one connection.
#[derive(Debug)]
pub(crate) struct FrontendBuffers {
    inbox: BytesMut,
    outbox: BytesMut,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request line exceeds {MAX_LINE_LENGTH} bytes")]
pub(crate) struct LineTooLong;

impl FrontendBuffers {
    pub(crate) fn new() -> Self {
        Self {
            inbox: BytesMut::with_capacity(SCRATCH_CAPACITY_HINT),
            outbox: BytesMut::with_capacity(SCRATCH_CAPACITY_HINT),
        }
    }

    pub(crate) async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.inbox.reserve(SCRATCH_CAPACITY_HINT);
        reader.read_buf(&mut self.inbox).await
    }

    /// Splits off the next complete line, without its `\n` or `\r\n`.
    /// `Ok(None)` means more bytes are needed.
    pub(crate) fn next_line(&mut self) -> Result<Option<BytesMut>, LineTooLong> {
        let Some(pos) = memchr(b'\n', &self.inbox) else {
            if self.inbox.len() > MAX_LINE_LENGTH {
                return Err(LineTooLong);
            }
            return Ok(None);
        };

        let mut line = self.inbox.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }

        if line.len() > MAX_LINE_LENGTH {
            return Err(LineTooLong);
        }
        Ok(Some(line))
    }

    /// Bytes received but not yet framed into a line.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn queue_response(&mut self, response: &Bytes) {
        self.outbox.extend_from_slice(response);
    }

    pub(crate) fn queue_line(&mut self, line: &str) {
        self.outbox.extend_from_slice(line.as_bytes());
        self.outbox.extend_from_slice(b"\n");
    }

    pub(crate) async fn flush_to<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.outbox.is_empty() {
            writer.write_all_buf(&mut self.outbox).await?;
            writer.flush().await?;
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
