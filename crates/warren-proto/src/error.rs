use std::io;

/// Failures produced while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The byte stream violates the protocol grammar. Fatal to the
    /// connection that produced it.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
