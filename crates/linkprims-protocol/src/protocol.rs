use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use linkprims_packet::{Packet, System};
use tracing::error;

use crate::error::{ProtocolError, Result};

/// Result of one protocol step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Pass this value on to the next protocol.
    Ready(T),
    /// Nothing complete yet; wait for more bytes.
    Stop,
    /// Unrecoverable; the interface must disconnect.
    Disconnect,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ready(value) => Outcome::Ready(f(value)),
            Self::Stop => Outcome::Stop,
            Self::Disconnect => Outcome::Disconnect,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// What a protocol may know about the interface it is attached to.
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub name: String,
    pub cmd_target_names: Vec<String>,
    pub tlm_target_names: Vec<String>,
    /// Definitions used by protocols that identify packets themselves.
    pub system: Option<Arc<System>>,
}

impl LinkInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A stateful framing or transform step on an interface.
///
/// Reads flow through the read chain in order: each `read_data` receives what
/// the previous protocol produced. Writes run `write_packet`, then the packet
/// is serialized, then `write_data`, over the write chain. Every hook defaults
/// to passing its input through.
pub trait Protocol: Send {
    /// Registry name, e.g. `LENGTH`.
    fn name(&self) -> &'static str;

    /// Called when the protocol is added to an interface.
    fn attach(&mut self, _link: &LinkInfo) {}

    /// The `allow_empty_data` setting; see [`pass_empty`].
    fn allow_empty_data(&self) -> Option<bool> {
        None
    }

    /// Feed bytes in. `at_tail` is true when this is the last protocol of
    /// the read chain.
    ///
    /// Each interface read starts with an empty call so buffered frames are
    /// emitted before the stream is read again.
    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        Ok(pass_empty(self.allow_empty_data(), data, at_tail))
    }

    fn read_packet(&mut self, packet: Packet) -> Result<Outcome<Packet>> {
        Ok(Outcome::Ready(packet))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<Outcome<Packet>> {
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        Ok(Outcome::Ready(data))
    }

    /// A response the just-written command must wait for.
    ///
    /// Asked after the bytes have gone out and before `post_write_interface`.
    /// The caller waits with the protocol unlocked so the read side can
    /// deliver the response.
    fn response_wait(&mut self) -> Option<ResponseWait> {
        None
    }

    /// Called after the bytes have gone out on the stream.
    fn post_write_interface(&mut self, _packet: &Packet, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Drop all buffered state.
    fn reset(&mut self) {}

    fn connect_reset(&mut self) {
        self.reset();
    }

    fn disconnect_reset(&mut self) {
        self.reset();
    }
}

/// A pending wait for the read side to release a write.
#[derive(Debug)]
pub struct ResponseWait {
    released: Arc<Mutex<Receiver<()>>>,
    timeout: Option<Duration>,
    poll: Duration,
    link_name: String,
    raise: bool,
}

impl ResponseWait {
    /// `timeout` of `None` waits forever.
    pub fn new(
        released: Arc<Mutex<Receiver<()>>>,
        timeout: Option<Duration>,
        poll: Duration,
        link_name: impl Into<String>,
        raise: bool,
    ) -> Self {
        Self {
            released,
            timeout,
            poll: poll.max(Duration::from_millis(1)),
            link_name: link_name.into(),
            raise,
        }
    }

    /// Block until released. A timeout is logged, and is an error only when
    /// `raise` was set.
    pub fn wait(self) -> Result<()> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match released.recv_timeout(self.poll) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let message = format!("{}: Timeout waiting for response", self.link_name);
                error!(link = %self.link_name, "{message}");
                if self.raise {
                    return Err(ProtocolError::Response(message));
                }
                return Ok(());
            }
        }
    }
}

/// Empty-input rule shared by every protocol.
///
/// Non-empty data always passes. Empty data stops the chain when
/// `allow_empty_data` is `Some(false)`, or when it is `None` and this
/// protocol is last in the chain; otherwise it passes so later protocols get
/// their chance to emit buffered frames.
pub fn pass_empty(allow_empty_data: Option<bool>, data: BytesMut, at_tail: bool) -> Outcome<BytesMut> {
    if !data.is_empty() {
        return Outcome::Ready(data);
    }
    match allow_empty_data {
        Some(true) => Outcome::Ready(data),
        Some(false) => Outcome::Stop,
        None if at_tail => Outcome::Stop,
        None => Outcome::Ready(data),
    }
}
