//! Raw byte streams underneath the protocol chain.
//!
//! Every link type implements [`Stream`]: connect, blocking read of whatever
//! bytes are available, write, disconnect. Streams hold no framing state; that
//! lives in the protocols layered above them.
//!
//! - [`TcpClientStream`] / [`TcpServerStream`]
//! - [`UdpStream`]
//! - [`SerialStream`]
//! - [`MqttStream`]
//! - [`WebSocketStream`]

pub mod error;
pub mod mqtt;
pub mod serial;
pub mod tcp;
pub mod traits;
pub mod udp;
pub mod websocket;

pub use error::{Result, StreamError};
pub use mqtt::{MqttConfig, MqttStream};
pub use serial::{SerialConfig, SerialStream};
pub use tcp::{TcpClientStream, TcpServerStream};
pub use traits::{Stream, StreamConfig};
pub use udp::{UdpConfig, UdpStream};
pub use websocket::WebSocketStream;
