use std::time::Duration;

use warren_proto::{CodecError, RequestId};

/// Failures surfaced to callers of this library.
///
/// Node-reported per-request failures are not errors at this level: they
/// terminate the affected request with a `Failed` phase and are read from
/// its snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The node was unreachable at connect time.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// Operation attempted on a closed connection.
    #[error("not connected")]
    NotConnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame violated the protocol grammar. Fatal to the connection.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The caller reused an identifier that is still live.
    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(RequestId),

    #[error("unknown identifier: {0}")]
    NotFound(RequestId),

    /// A bounded wait elapsed. The node-side job is untouched.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True when the connection is unusable and a reconnect is required
    /// before further operations.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::NotConnected | Self::Io(_) | Self::Codec(_) | Self::Handshake(_)
        )
    }
}
