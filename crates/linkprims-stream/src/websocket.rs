use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info};
use tungstenite::http::Uri;
use tungstenite::{Message, WebSocket};

use crate::error::{Result, StreamError};
use crate::tcp::connect_addr;
use crate::traits::{lock, remaining, Stream, StreamConfig};

/// Socket read timeout while polling for messages. Keeps the socket lock
/// short so writers are not starved.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// WebSocket client presenting the plain byte-stream contract. Binary and
/// text message payloads read as bytes; writes go out as binary messages;
/// a close frame reads as end of stream.
#[derive(Debug)]
pub struct WebSocketStream {
    url: String,
    config: StreamConfig,
    socket: Mutex<Option<WebSocket<TcpStream>>>,
    /// Clone of the underlying TCP socket for shutdown from any thread.
    control: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl WebSocketStream {
    pub fn new(url: impl Into<String>, config: StreamConfig) -> Result<Self> {
        let url = url.into();
        endpoint(&url)?;
        Ok(Self {
            url,
            config,
            socket: Mutex::new(None),
            control: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Host and port of a `ws://` URL.
fn endpoint(url: &str) -> Result<(String, u16)> {
    let uri: Uri = url
        .parse()
        .map_err(|err| StreamError::InvalidConfig(format!("invalid websocket url {url}: {err}")))?;
    match uri.scheme_str() {
        Some("ws") => {}
        Some("wss") => {
            return Err(StreamError::InvalidConfig(format!(
                "{url}: wss requires TLS, which is not supported"
            )))
        }
        _ => {
            return Err(StreamError::InvalidConfig(format!(
                "{url}: websocket url must start with ws://"
            )))
        }
    }
    let host = uri
        .host()
        .ok_or_else(|| StreamError::InvalidConfig(format!("{url}: missing host")))?;
    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}

impl Stream for WebSocketStream {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();

        let (host, port) = endpoint(&self.url)?;
        let tcp = connect_addr(&host, port, self.config.connect_timeout)?;
        tcp.set_read_timeout(Some(self.config.connect_timeout))?;
        tcp.set_write_timeout(self.config.write_timeout)?;
        let control = tcp.try_clone()?;

        let (socket, response) = tungstenite::client::client(self.url.as_str(), tcp)
            .map_err(|err| StreamError::WebSocket(err.to_string()))?;
        control.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        debug!(status = %response.status(), "websocket handshake complete");

        *lock(&self.socket) = Some(socket);
        *lock(&self.control) = Some(control);
        self.connected.store(true, Ordering::Release);
        info!(url = %self.url, "websocket connected");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<BytesMut> {
        let deadline = self.config.read_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if !self.connected() {
                return Err(StreamError::NotConnected);
            }
            let mut guard = lock(&self.socket);
            let socket = guard.as_mut().ok_or(StreamError::NotConnected)?;
            match socket.read() {
                Ok(Message::Binary(data)) => return Ok(BytesMut::from(data.as_slice())),
                Ok(Message::Text(text)) => return Ok(BytesMut::from(text.as_bytes())),
                Ok(Message::Close(_)) => {
                    // Sends the queued close reply.
                    let _ = socket.flush();
                    self.mark_closed();
                    return Err(StreamError::Closed);
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    drop(guard);
                    if remaining(deadline).is_some_and(|left| left.is_zero()) {
                        return Err(StreamError::Timeout);
                    }
                    // Let a waiting writer take the socket.
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.mark_closed();
                    return Err(StreamError::Closed);
                }
                Err(tungstenite::Error::Io(err)) => {
                    self.mark_closed();
                    return Err(StreamError::from_io(err));
                }
                Err(err) => {
                    self.mark_closed();
                    return Err(StreamError::WebSocket(err.to_string()));
                }
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let mut guard = lock(&self.socket);
        let socket = guard.as_mut().ok_or(StreamError::NotConnected)?;
        socket
            .send(Message::Binary(data.to_vec()))
            .map_err(|err| match err {
                tungstenite::Error::Io(err) => StreamError::from_io(err),
                other => StreamError::WebSocket(other.to_string()),
            })
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if let Some(control) = lock(&self.control).take() {
            let _ = control.shutdown(Shutdown::Both);
        }
        if let Ok(mut socket) = self.socket.try_lock() {
            socket.take();
        }
        if was_connected {
            debug!(url = %self.url, "websocket disconnected");
        }
    }
}
