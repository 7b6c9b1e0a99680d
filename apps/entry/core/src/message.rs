//! Request/response envelopes exchanged over the WebSocket.
//!
//! Each struct carries both the protobuf schema (tags 1 and 2) and the JSON
//! shape used by browser clients. `msg_type` stays a raw `i32` so that frames
//! with an unknown type still decode and can be rejected by the caller.

use prost::UnknownEnumValue;
use serde::{Deserialize, Serialize};

/// Fixed payload carried by heartbeat frames.
pub const PING_PAYLOAD: &[u8] = b"ping";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct RequestMessage {
    #[prost(enumeration = "RequestType", tag = "1")]
    #[serde(default)]
    pub msg_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(default, with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    /// Raw keystrokes for the session's stdin.
    Plain = 0,
    /// Terminal resize, payload is `"<width> <height>"`.
    Winch = 1,
}

impl RequestMessage {
    pub fn plain(content: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type: RequestType::Plain as i32,
            content: content.into(),
        }
    }

    pub fn winch(width: u16, height: u16) -> Self {
        Self {
            msg_type: RequestType::Winch as i32,
            content: format!("{width} {height}").into_bytes(),
        }
    }

    pub fn kind(&self) -> Result<RequestType, UnknownEnumValue> {
        RequestType::try_from(self.msg_type)
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[prost(enumeration = "ResponseType", tag = "1")]
    #[serde(default)]
    pub msg_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(default, with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseType {
    Stdout = 0,
    Stderr = 1,
    Ping = 2,
    /// Last frame of a session; content is a human-readable farewell or error.
    Close = 3,
}

impl ResponseType {
    /// Label used in logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ResponseType::Stdout => "stdout",
            ResponseType::Stderr => "stderr",
            ResponseType::Ping => "ping",
            ResponseType::Close => "close",
        }
    }
}

impl ResponseMessage {
    pub fn new(kind: ResponseType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type: kind as i32,
            content: content.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(ResponseType::Ping, PING_PAYLOAD)
    }

    pub fn close(content: impl Into<Vec<u8>>) -> Self {
        Self::new(ResponseType::Close, content)
    }

    pub fn kind(&self) -> Result<ResponseType, UnknownEnumValue> {
        ResponseType::try_from(self.msg_type)
    }
}

/// Byte payloads travel as standard base64 strings in the JSON form.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winch_builder_formats_width_then_height() {
        let msg = RequestMessage::winch(80, 24);
        assert_eq!(msg.kind().unwrap(), RequestType::Winch);
        assert_eq!(msg.content, b"80 24");
    }

    #[test]
    fn unknown_request_type_is_reported() {
        let msg = RequestMessage {
            msg_type: 9,
            content: Vec::new(),
        };
        assert!(msg.kind().is_err());
    }

    #[test]
    fn ping_carries_fixed_payload() {
        let ping = ResponseMessage::ping();
        assert_eq!(ping.kind().unwrap(), ResponseType::Ping);
        assert_eq!(ping.content, PING_PAYLOAD);
    }
}
