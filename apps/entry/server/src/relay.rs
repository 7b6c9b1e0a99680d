//! Relay loops moving bytes between the client connection and the session's
//! pipes.

use std::{pin::Pin, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use entry_core::{
    safe_prefix_len, window_size, Codec, CodecError, RequestMessage, RequestType, ResponseMessage,
    ResponseType,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    pipe::{PipeReader, PipeWriter},
    runtime::{ContainerRuntime, RuntimeError},
};

/// Size of the per-stream read buffer on the outbound path.
pub const OUTPUT_BUFFER_SIZE: usize = 10240;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, axum::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection write failed: {0}")]
    Connection(#[source] axum::Error),
    #[error("connection read failed: {0}")]
    Receive(#[source] axum::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] CodecError),
    #[error("session stream failed: {0}")]
    Stream(#[from] std::io::Error),
    #[error("no valid utf-8 sequence start in {0} buffered bytes")]
    Undecodable(usize),
    #[error("resize exec tty failed: {0}")]
    Resize(#[source] RuntimeError),
}

/// Why a relay loop stopped. Every variant means the loop released its pipe.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The source reached end of stream or the client closed the socket.
    Finished,
    Failed(RelayError),
}

impl RelayOutcome {
    fn from_result(result: Result<(), RelayError>) -> Self {
        match result {
            Ok(()) => RelayOutcome::Finished,
            Err(err) => RelayOutcome::Failed(err),
        }
    }
}

/// Shared write half of the client connection. Every frame is sent while
/// holding the lock, so concurrent writers never interleave frame bytes.
#[derive(Clone)]
pub struct ClientWriter {
    sink: Arc<Mutex<FrameSink>>,
    codec: Codec,
}

impl ClientWriter {
    pub fn new(sink: FrameSink, codec: Codec) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            codec,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub async fn send(&self, message: &ResponseMessage) -> Result<(), RelayError> {
        let data = self.codec.encode(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data))
            .await
            .map_err(RelayError::Connection)
    }

    /// Starts the WebSocket closing handshake.
    pub async fn close(&self) -> Result<(), RelayError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(None))
            .await
            .map_err(RelayError::Connection)
    }
}

/// Target of WINCH requests for one exec.
#[derive(Clone)]
pub struct ResizeTarget {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub exec_id: String,
}

/// Client → session input. Decodes one frame at a time, writes PLAIN content
/// to `stdin` and resizes the exec on WINCH. `stdin` is closed on exit.
pub async fn relay_requests(
    mut frames: FrameStream,
    mut stdin: PipeWriter,
    codec: Codec,
    resize: ResizeTarget,
    attach_delay: Duration,
) -> RelayOutcome {
    // give the exec time to attach before the first resize lands
    tokio::time::sleep(attach_delay).await;

    let result = pump_requests(&mut frames, &mut stdin, codec, &resize).await;
    if let Err(err) = &result {
        info!(exec_id = %resize.exec_id, error = %err, "request relay ended");
    }
    stdin.close();
    RelayOutcome::from_result(result)
}

async fn pump_requests(
    frames: &mut FrameStream,
    stdin: &mut PipeWriter,
    codec: Codec,
    resize: &ResizeTarget,
) -> Result<(), RelayError> {
    while let Some(frame) = frames.next().await {
        let payload = match frame.map_err(RelayError::Receive)? {
            Message::Binary(bytes) => bytes,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let request: RequestMessage = match codec.decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "unmarshal request error");
                continue;
            }
        };

        match request.kind() {
            Ok(RequestType::Plain) => {
                if !request.content.is_empty() {
                    stdin.write_all(&request.content).await?;
                }
            }
            Ok(RequestType::Winch) => {
                let Some(size) = window_size(&request.content) else {
                    continue;
                };
                resize
                    .runtime
                    .resize_exec(&resize.exec_id, size.height, size.width)
                    .await
                    .map_err(RelayError::Resize)?;
            }
            Err(_) => {
                warn!(msg_type = request.msg_type, "dropping request with unknown type");
            }
        }
    }
    Ok(())
}

/// Session output → client, for one stream class. Emits only UTF-8 safe
/// prefixes and carries partial characters into the next read. `source` is
/// closed on exit.
pub async fn relay_output(
    mut source: PipeReader,
    writer: ClientWriter,
    kind: ResponseType,
    buffer_size: usize,
) -> RelayOutcome {
    let result = pump_output(&mut source, &writer, kind, buffer_size).await;
    if let Err(err) = &result {
        info!(stream = kind.label(), error = %err, "response relay ended");
    }
    source.close();
    RelayOutcome::from_result(result)
}

async fn pump_output(
    source: &mut PipeReader,
    writer: &ClientWriter,
    kind: ResponseType,
    buffer_size: usize,
) -> Result<(), RelayError> {
    let mut buf = vec![0u8; buffer_size];
    let mut cursor = 0usize;

    loop {
        if cursor == buf.len() {
            return Err(RelayError::Undecodable(cursor));
        }
        let size = source.read(&mut buf[cursor..]).await?;
        if size == 0 {
            if cursor > 0 {
                debug!(stream = kind.label(), bytes = cursor, "flushing tail at end of stream");
                send_chunk(writer, kind, &buf[..cursor]).await?;
            }
            return Ok(());
        }

        let filled = cursor + size;
        let valid = safe_prefix_len(&buf[..filled]).ok_or(RelayError::Undecodable(filled))?;
        if valid > 0 {
            send_chunk(writer, kind, &buf[..valid]).await?;
        }
        buf.copy_within(valid..filled, 0);
        cursor = filled - valid;
    }
}

async fn send_chunk(
    writer: &ClientWriter,
    kind: ResponseType,
    bytes: &[u8],
) -> Result<(), RelayError> {
    writer
        .send(&ResponseMessage::new(kind, bytes))
        .await?;
    counter!("entry_frames_relayed_total", 1, "stream" => kind.label());
    counter!("entry_bytes_relayed_total", bytes.len() as u64, "stream" => kind.label());
    Ok(())
}
