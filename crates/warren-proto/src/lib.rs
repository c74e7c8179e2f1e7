//! Wire-level message model and framing codec for the warren node
//! control protocol: line-oriented frames of `Key=Value` fields with an
//! optional raw payload, exchanged over a single long-lived connection.

pub mod codec;
pub mod error;
pub mod fields;
pub mod ids;
pub mod message;

pub use codec::{encode_message, MessageCodec};
pub use error::CodecError;
pub use ids::RequestId;
pub use message::{keys, tags, Message};

/// Protocol revision sent in the handshake.
pub const PROTOCOL_VERSION: &str = "2.0";
