//! Bounded in-memory capture of event lines
//!
//! Capture mode buffers every line instead of printing it and dumps the
//! whole buffer, in arrival order, when the session ends.

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::config::CaptureConfig;

/// Capture buffer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The hard size limit was reached; the session must end
    #[error("capture buffer exceeded {limit} bytes ({total} buffered)")]
    LimitExceeded {
        /// Configured hard limit
        limit: u64,
        /// Bytes buffered, including the line that crossed the limit
        total: u64,
    },
}

/// Ordered buffer of serialized events with a one-shot warning threshold and
/// a hard limit.
#[derive(Debug)]
pub struct CaptureBuffer {
    lines: Vec<String>,
    total_bytes: u64,
    warned: bool,
    warn_bytes: u64,
    max_bytes: u64,
}

impl CaptureBuffer {
    /// Empty buffer with the configured thresholds.
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            lines: Vec::with_capacity(128),
            total_bytes: 0,
            warned: false,
            warn_bytes: config.warn_bytes,
            max_bytes: config.max_bytes,
        }
    }

    /// Append one line.
    ///
    /// The line is always kept, even when it pushes the total over the hard
    /// limit; the returned error tells the caller to stop and flush.
    pub fn push(&mut self, line: String) -> Result<(), CaptureError> {
        self.total_bytes += line.len() as u64;
        self.lines.push(line);

        if !self.warned && self.total_bytes >= self.warn_bytes {
            self.warned = true;
            warn!(
                bytes = self.total_bytes,
                threshold = self.warn_bytes,
                "Capture buffer is large"
            );
        }

        if self.total_bytes >= self.max_bytes {
            return Err(CaptureError::LimitExceeded {
                limit: self.max_bytes,
                total: self.total_bytes,
            });
        }
        Ok(())
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Serialized bytes buffered so far (newlines excluded).
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether the warning threshold has been crossed.
    pub fn warned(&self) -> bool {
        self.warned
    }

    /// Write every line, newline-terminated, then flush the sink.
    pub async fn flush_to<W>(&self, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        for line in &self.lines {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await
    }
}
