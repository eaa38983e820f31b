use std::fmt;
use std::io;

use linkprims_interface::InterfaceError;
use linkprims_packet::PacketError;
use linkprims_stream::StreamError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => CONFIG,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn stream_error(context: &str, err: StreamError) -> CliError {
    match err {
        StreamError::Connect { source, .. }
        | StreamError::Bind { source, .. }
        | StreamError::Io(source) => io_error(context, source),
        StreamError::Timeout => CliError::new(TIMEOUT, format!("{context}: {err}")),
        StreamError::InvalidConfig(_) => CliError::new(CONFIG, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn packet_error(context: &str, err: PacketError) -> CliError {
    match err {
        PacketError::Io(source) => io_error(context, source),
        PacketError::Config(_)
        | PacketError::Definition { .. }
        | PacketError::Overlap(_)
        | PacketError::AppendAfterVariable
        | PacketError::TargetNotFound(_)
        | PacketError::FileTooLarge { .. } => CliError::new(CONFIG, format!("{context}: {err}")),
        PacketError::UnknownTarget { .. } | PacketError::UnknownPacket { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        PacketError::Accessor(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn interface_error(context: &str, err: InterfaceError) -> CliError {
    match err {
        InterfaceError::Stream(err) => stream_error(context, err),
        InterfaceError::Packet(err) => packet_error(context, err),
        InterfaceError::Io(source) => io_error(context, source),
        InterfaceError::Config(_)
        | InterfaceError::Protocol(_)
        | InterfaceError::UnknownInterface(_)
        | InterfaceError::InvalidArgument { .. }
        | InterfaceError::ProtocolKind(_) => CliError::new(CONFIG, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
