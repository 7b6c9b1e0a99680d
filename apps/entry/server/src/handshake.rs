use std::time::Duration;

use axum::{extract::ws::Message, http::HeaderMap};
use entry_core::{Codec, WEB_METHOD};
use futures_util::StreamExt;
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;

use crate::{
    auth::{AuthError, ACCESS_TOKEN_HEADER},
    relay::FrameStream,
};

pub const CONTAINER_ID_HEADER: &str = "container_id";
pub const TERM_TYPE_HEADER: &str = "term-type";
pub const DEFAULT_TERM_TYPE: &str = "xterm-256color";

#[derive(Debug, Default, Deserialize)]
pub struct EntryQuery {
    pub method: Option<String>,
}

/// How the client names its target container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Browser clients send `{"container_id": ...}` as their first frame.
    FirstFrame,
    /// CLI clients send a `container_id` header with the upgrade request.
    Header,
}

/// First frame sent by browser clients.
#[derive(Debug, Deserialize)]
struct ContainerSelector {
    #[serde(default)]
    container_id: String,
}

/// Everything captured from the upgrade request before the socket exists.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub addressing: Addressing,
    pub codec: Codec,
    pub term_type: String,
    pub access_token: Option<String>,
    header_container: Option<String>,
}

impl EntryRequest {
    pub fn from_parts(query: &EntryQuery, headers: &HeaderMap) -> Self {
        let method = query.method.as_deref();
        let addressing = if method == Some(WEB_METHOD) {
            Addressing::FirstFrame
        } else {
            Addressing::Header
        };
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Self {
            addressing,
            codec: Codec::from_method(method),
            term_type: header(TERM_TYPE_HEADER)
                .filter(|term| !term.is_empty())
                .unwrap_or_else(|| DEFAULT_TERM_TYPE.to_string()),
            access_token: header(ACCESS_TOKEN_HEADER),
            header_container: header(CONTAINER_ID_HEADER),
        }
    }

    pub fn mode_label(&self) -> &'static str {
        match self.addressing {
            Addressing::FirstFrame => "web",
            Addressing::Header => "header",
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("authorize failed: container selector timed out")]
    TimedOut,
    #[error("authorize failed: socket closed before container selector")]
    SocketClosed,
    #[error("authorize failed: socket closed during handshake: {0:?}")]
    Closed(Option<String>),
    #[error("authorize failed: invalid container selector: {0}")]
    InvalidPayload(String),
    #[error("authorize failed: protocol error: {0}")]
    Protocol(String),
    #[error("authorize failed: unexpected frame type")]
    UnexpectedFrame,
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::Closed(_) => "client_closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::Protocol(_) => "protocol_error",
            HandshakeError::UnexpectedFrame => "unexpected_frame",
            HandshakeError::Unauthorized(_) => "unauthorized",
        }
    }
}

pub fn record_handshake_failure(error: &HandshakeError) {
    counter!(
        "entry_handshake_failures_total",
        1,
        "reason" => error.metric_label()
    );
}

/// Works out the target container. In first-frame mode this consumes the
/// first frame of `frames`, waiting at most `handshake_timeout` for it.
///
/// An absent id comes back empty; the runtime rejects it during setup and
/// the client gets the usual error CLOSE.
pub async fn resolve_container(
    request: &EntryRequest,
    frames: &mut FrameStream,
    handshake_timeout: Duration,
) -> Result<String, HandshakeError> {
    match request.addressing {
        Addressing::Header => Ok(request.header_container.clone().unwrap_or_default()),
        Addressing::FirstFrame => read_selector(frames, handshake_timeout).await,
    }
}

async fn read_selector(
    frames: &mut FrameStream,
    handshake_timeout: Duration,
) -> Result<String, HandshakeError> {
    let frame = timeout(handshake_timeout, frames.next())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .ok_or(HandshakeError::SocketClosed)?;

    let message = frame.map_err(|err| HandshakeError::Protocol(err.to_string()))?;
    let selector = match message {
        Message::Text(text) => serde_json::from_str::<ContainerSelector>(&text)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?,
        Message::Binary(bytes) => serde_json::from_slice::<ContainerSelector>(&bytes)
            .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?,
        Message::Close(frame) => {
            let reason = frame.map(|f| f.reason.to_string());
            return Err(HandshakeError::Closed(reason));
        }
        Message::Ping(_) | Message::Pong(_) => return Err(HandshakeError::UnexpectedFrame),
    };
    Ok(selector.container_id)
}
