//! Shared primitives for the Entry terminal gateway. The server and the CLI
//! client both speak these envelopes, so the message shapes live here rather
//! than being copied across crates.

pub mod codec;
pub mod message;
pub mod utf8;
pub mod winch;

pub use codec::{Codec, CodecError, Envelope};
pub use message::{RequestMessage, RequestType, ResponseMessage, ResponseType, PING_PAYLOAD};
pub use utf8::safe_prefix_len;
pub use winch::{window_size, WindowSize};

/// Query value of `method` that selects the browser-facing addressing mode and
/// the JSON codec.
pub const WEB_METHOD: &str = "web";
