//! In-process byte pipe connecting the relay tasks to the runtime streams.
//!
//! Each end can be closed on its own and closing is idempotent. Closing the
//! writer shows up as end-of-stream on the reader once buffered bytes are
//! drained; closing the reader makes further writes fail with `BrokenPipe`.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Bytes buffered between writer and reader before writes start to wait.
pub const DEFAULT_PIPE_CAPACITY: usize = 10240;

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity);
    (
        PipeWriter {
            stream: Some(writer),
        },
        PipeReader {
            stream: Some(reader),
        },
    )
}

#[derive(Debug)]
pub struct PipeReader {
    stream: Option<DuplexStream>,
}

#[derive(Debug)]
pub struct PipeWriter {
    stream: Option<DuplexStream>,
}

impl PipeReader {
    /// Closes this end. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        self.stream.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl PipeWriter {
    /// Closes this end. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        self.stream.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe end already closed")
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
