use thiserror::Error;

/// A malformed frame. The byte stream cannot be resynchronized after one of
/// these, so the connection must be closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad magic number: expected {expected:#04x}, found {found:#04x}")]
    BadMagic { expected: u8, found: u8 },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("negative body length: {0}")]
    NegativeBodyLength(i32),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("heartbeat frame carries a {0}-byte body")]
    HeartbeatWithBody(usize),

    #[error("header declares {header} body bytes but body has {body}")]
    LengthMismatch { header: i32, body: usize },

    #[error("stream ended inside a frame ({0} bytes buffered)")]
    TruncatedFrame(usize),

    #[error("io error: {0}")]
    Io(String),
}

// `tokio_util` codecs require `From<io::Error>` on the error type.
impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Errors produced while mapping packets to messages and back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// No body serializer is registered for this tag.
    #[error("unsupported serializer type: {0}")]
    UnsupportedSerializer(u8),

    /// The body did not (de)serialize with the selected serializer.
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CodecError {
    /// Protocol errors are fatal to the connection; the rest are request-scoped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Protocol(_))
    }
}
