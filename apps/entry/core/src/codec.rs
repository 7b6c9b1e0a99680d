use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::message::{RequestMessage, ResponseMessage};
use crate::WEB_METHOD;

/// Serialization used for every frame of one session, picked at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Protobuf, used by native clients.
    #[default]
    Binary,
    /// JSON with base64 content, used by browser clients.
    Text,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages that can travel through either codec.
pub trait Envelope: prost::Message + Default + Serialize + DeserializeOwned {}

impl Envelope for RequestMessage {}
impl Envelope for ResponseMessage {}

impl Codec {
    /// Maps the `method` query hint onto a codec; only `web` selects JSON.
    pub fn from_method(method: Option<&str>) -> Self {
        match method {
            Some(WEB_METHOD) => Codec::Text,
            _ => Codec::Binary,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Codec::Binary => "binary",
            Codec::Text => "text",
        }
    }

    pub fn encode<M: Envelope>(self, message: &M) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Binary => Ok(message.encode_to_vec()),
            Codec::Text => Ok(serde_json::to_vec(message)?),
        }
    }

    pub fn decode<M: Envelope>(self, bytes: &[u8]) -> Result<M, CodecError> {
        match self {
            Codec::Binary => Ok(M::decode(bytes)?),
            Codec::Text => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RequestType, ResponseType};

    fn samples() -> Vec<ResponseMessage> {
        vec![
            ResponseMessage::new(ResponseType::Stdout, "héllo, 世界\r\n"),
            ResponseMessage::new(ResponseType::Stderr, vec![0xff, 0x00, 0xe4, 0xb8]),
            ResponseMessage::ping(),
            ResponseMessage::close(Vec::new()),
        ]
    }

    #[test]
    fn responses_round_trip_through_both_codecs() {
        for codec in [Codec::Binary, Codec::Text] {
            for message in samples() {
                let bytes = codec.encode(&message).expect("encode");
                let decoded: ResponseMessage = codec.decode(&bytes).expect("decode");
                assert_eq!(decoded, message, "codec {}", codec.label());
            }
        }
    }

    #[test]
    fn requests_round_trip_through_both_codecs() {
        let requests = [
            RequestMessage::plain("ls -la\n"),
            RequestMessage::plain(Vec::new()),
            RequestMessage::winch(120, 40),
        ];
        for codec in [Codec::Binary, Codec::Text] {
            for message in &requests {
                let bytes = codec.encode(message).expect("encode");
                let decoded: RequestMessage = codec.decode(&bytes).expect("decode");
                assert_eq!(&decoded, message);
            }
        }
    }

    #[test]
    fn text_codec_uses_snake_case_fields_and_base64_content() {
        let bytes = Codec::Text
            .encode(&ResponseMessage::ping())
            .expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["msg_type"], 2);
        assert_eq!(value["content"], "cGluZw==");
    }

    #[test]
    fn text_codec_accepts_browser_frames_with_missing_fields() {
        let decoded: RequestMessage = Codec::Text
            .decode(br#"{"content":"bHMK"}"#)
            .expect("decode");
        assert_eq!(decoded.kind().unwrap(), RequestType::Plain);
        assert_eq!(decoded.content, b"ls\n");

        let decoded: RequestMessage = Codec::Text
            .decode(br#"{"msg_type":1,"content":"ODAgMjQ="}"#)
            .expect("decode");
        assert_eq!(decoded.kind().unwrap(), RequestType::Winch);
        assert_eq!(decoded.content, b"80 24");
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(Codec::Text.decode::<RequestMessage>(b"not json").is_err());
        assert!(Codec::Text
            .decode::<RequestMessage>(br#"{"content":"***"}"#)
            .is_err());
        // field 2 declared as length-delimited with a length past the end
        assert!(Codec::Binary
            .decode::<RequestMessage>(&[0x12, 0x10, 0x01])
            .is_err());
    }

    #[test]
    fn method_hint_selects_codec() {
        assert_eq!(Codec::from_method(Some("web")), Codec::Text);
        assert_eq!(Codec::from_method(Some("cli")), Codec::Binary);
        assert_eq!(Codec::from_method(None), Codec::Binary);
    }
}
