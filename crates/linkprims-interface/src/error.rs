use linkprims_packet::{ConfigError, PacketError};
use linkprims_protocol::ProtocolError;
use linkprims_stream::StreamError;

/// Errors raised by interfaces, routers and bridges.
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Bridge configuration error with file and line context.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Interface not connected for {op} {name}")]
    NotConnected { op: &'static str, name: String },

    #[error("Interface not readable {0}")]
    NotReadable(String),

    #[error("Interface not writable {0}")]
    NotWritable(String),

    #[error("Interface not raw writable {0}")]
    NotRawWritable(String),

    /// No interface implementation is registered under this name.
    #[error("unknown interface {0}")]
    UnknownInterface(String),

    #[error("invalid {implementation} argument: {message}")]
    InvalidArgument {
        implementation: &'static str,
        message: String,
    },

    #[error("Unknown protocol descriptor {0}. Must be 'READ', 'WRITE', or 'READ_WRITE'.")]
    ProtocolKind(String),

    /// `start` called on a thread that already ran.
    #[error("thread for {0} already started")]
    AlreadyStarted(String),

    #[error("failed to spawn thread for {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterfaceError {
    pub(crate) fn invalid(implementation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            implementation,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InterfaceError>;
