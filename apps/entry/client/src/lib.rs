//! Client side of the Entry gateway: opens an `/enter` session in header mode
//! and pumps a local terminal through it.

pub mod terminal;

use std::time::Duration;

use entry_core::{Codec, CodecError, RequestMessage, ResponseMessage, ResponseType, WindowSize};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

pub const CONTAINER_ID_HEADER: &str = "container_id";
pub const TERM_TYPE_HEADER: &str = "term-type";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INPUT_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("invalid header value: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error("terminal i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode request: {0}")]
    Codec(#[from] CodecError),
}

/// How an interactive session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server sent its CLOSE message.
    Closed(Vec<u8>),
    /// The connection went away without a CLOSE message.
    Disconnected,
}

pub struct EntryClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: Codec,
}

impl EntryClient {
    pub async fn connect(
        host: &str,
        port: u16,
        container_id: &str,
        term_type: &str,
    ) -> Result<Self, ClientError> {
        let url = format!("ws://{host}:{port}/enter");
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(CONTAINER_ID_HEADER, HeaderValue::from_str(container_id)?);
        headers.insert(TERM_TYPE_HEADER, HeaderValue::from_str(term_type)?);

        let (socket, _) = timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout(url.clone()))??;
        debug!(%url, container_id, "connected");
        Ok(Self {
            socket,
            codec: Codec::Binary,
        })
    }

    /// Relays `input` to the remote shell and remote output to `stdout` and
    /// `stderr` until the server ends the session. `initial` is sent as the
    /// first resize; later sizes arrive on `resizes`.
    pub async fn invoke_shell<I, O, E>(
        self,
        mut input: I,
        mut stdout: O,
        mut stderr: E,
        initial: WindowSize,
        mut resizes: mpsc::Receiver<WindowSize>,
    ) -> Result<SessionEnd, ClientError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let codec = self.codec;
        let (mut sink, mut stream) = self.socket.split();

        let encode = |message: &RequestMessage| codec.encode(message).map(Message::Binary);
        sink.send(encode(&RequestMessage::winch(initial.width, initial.height))?)
            .await?;

        let mut buf = vec![0u8; INPUT_CHUNK];
        let mut input_open = true;
        let mut resizes_open = true;
        loop {
            tokio::select! {
                frame = stream.next() => {
                    let payload = match frame {
                        None => return Ok(SessionEnd::Disconnected),
                        Some(frame) => match frame? {
                            Message::Binary(bytes) => bytes,
                            Message::Text(text) => text.into_bytes(),
                            Message::Close(_) => return Ok(SessionEnd::Disconnected),
                            _ => continue,
                        },
                    };
                    let response: ResponseMessage = match codec.decode(&payload) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable frame");
                            continue;
                        }
                    };
                    match response.kind() {
                        Ok(ResponseType::Stdout) => {
                            stdout.write_all(&response.content).await?;
                            stdout.flush().await?;
                        }
                        Ok(ResponseType::Stderr) => {
                            stderr.write_all(&response.content).await?;
                            stderr.flush().await?;
                        }
                        Ok(ResponseType::Ping) => {}
                        Ok(ResponseType::Close) => return Ok(SessionEnd::Closed(response.content)),
                        Err(_) => warn!(msg_type = response.msg_type, "unknown response type"),
                    }
                }
                read = input.read(&mut buf), if input_open => {
                    let size = read?;
                    if size == 0 {
                        input_open = false;
                        continue;
                    }
                    sink.send(encode(&RequestMessage::plain(&buf[..size]))?).await?;
                }
                size = resizes.recv(), if resizes_open => match size {
                    Some(size) => {
                        sink.send(encode(&RequestMessage::winch(size.width, size.height))?).await?;
                    }
                    None => resizes_open = false,
                },
            }
        }
    }
}
