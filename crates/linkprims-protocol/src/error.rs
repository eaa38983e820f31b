use linkprims_accessor::AccessorError;
use linkprims_packet::PacketError;

/// Errors raised while framing or transforming link data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A constructor argument could not be used.
    #[error("invalid {protocol} argument: {message}")]
    InvalidArgument {
        protocol: &'static str,
        message: String,
    },

    /// No protocol is registered under this name.
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    /// Incoming bytes cannot be framed.
    #[error("{0}")]
    Framing(String),

    /// An outgoing buffer cannot be framed.
    #[error("{0}")]
    Write(String),

    /// A command response was missing or did not match.
    #[error("{0}")]
    Response(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Accessor(#[from] AccessorError),

    #[error("invalid extra json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn invalid(protocol: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            protocol,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
