use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames larger than this are rejected (spec.md §4.5).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum IpcTransportError {
    Io(std::io::Error),
    Json(serde_json::Error),
    FrameTooLarge(usize),
}

impl fmt::Display for IpcTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IPC transport I/O error: {e}"),
            Self::Json(e) => write!(f, "IPC transport JSON error: {e}"),
            Self::FrameTooLarge(n) => {
                write!(f, "IPC frame too large ({n} bytes, max {MAX_FRAME_SIZE})")
            }
        }
    }
}

impl std::error::Error for IpcTransportError {}

impl From<std::io::Error> for IpcTransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for IpcTransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Reads newline-delimited JSON frames from any `AsyncRead` (a Unix socket
/// half or a worker's piped stdout/stdin) (spec.md §4.5).
pub struct FramedReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Reads the next frame, skipping blank lines. Returns `Ok(None)` on
    /// clean EOF (the peer closed its write half).
    ///
    /// # Errors
    ///
    /// Returns `IpcTransportError` on I/O failure, malformed JSON, or a
    /// frame exceeding [`MAX_FRAME_SIZE`].
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcTransportError> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.len() > MAX_FRAME_SIZE {
                return Err(IpcTransportError::FrameTooLarge(self.line.len()));
            }
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Writes newline-delimited JSON frames to any `AsyncWrite` (spec.md §4.5).
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// # Errors
    ///
    /// Returns `IpcTransportError` on serialization or I/O failure.
    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<(), IpcTransportError> {
        let mut line = serde_json::to_string(value)?;
        if line.len() > MAX_FRAME_SIZE {
            return Err(IpcTransportError::FrameTooLarge(line.len()));
        }
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
