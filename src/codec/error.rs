use thiserror::Error;

/// Errors produced while decoding or validating a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The bytes are not a well-formed Diameter message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A required AVP is absent.
    #[error("command {command}: missing required AVP {avp}")]
    MissingAvp { command: u32, avp: u32 },

    /// An AVP occurs more often than the grammar allows.
    #[error("command {command}: AVP {avp} occurs {count} times, at most {max} allowed")]
    TooManyAvps {
        command: u32,
        avp: u32,
        count: usize,
        max: usize,
    },

    /// An AVP value does not match its declared type.
    #[error("AVP {avp}: {reason}")]
    InvalidAvp { avp: u32, reason: String },

    /// The codec itself failed; not attributable to the peer.
    #[error("codec internal error: {0}")]
    Internal(String),
}

impl CodecError {
    /// Whether the error points at our own logic rather than at the peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Internal(_))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::Malformed(msg.into())
    }
}
