/// Errors that can occur on a link stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Failed to connect to the remote end.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to bind a listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Read or write attempted while disconnected.
    #[error("stream not connected")]
    NotConnected,

    /// The configured read or write timeout elapsed.
    #[error("stream timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("stream closed")]
    Closed,

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Construction arguments that cannot describe a working stream.
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Map an I/O error from a read or write, folding timeouts into
    /// [`StreamError::Timeout`].
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
