use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::traits::{lock, wait_until_disconnected, Stream, StreamConfig, IDLE_POLL_INTERVAL};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) fn connect_addr(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|source| StreamError::Connect {
            addr: addr.clone(),
            source,
        })?;

    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(StreamError::Connect {
        addr,
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no addresses resolved")),
    })
}

fn read_chunk(mut stream: &TcpStream, chunk_size: usize) -> Result<BytesMut> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Err(StreamError::Closed),
            Ok(n) => return Ok(BytesMut::from(&buf[..n])),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::from_io(err)),
        }
    }
}

fn write_all(mut stream: &TcpStream, data: &[u8]) -> Result<()> {
    stream.write_all(data).map_err(StreamError::from_io)?;
    stream.flush().map_err(StreamError::from_io)
}

/// TCP client. Uses one socket when the read and write ports match, else one
/// connection per direction.
#[derive(Debug)]
pub struct TcpClientStream {
    host: String,
    write_port: Option<u16>,
    read_port: Option<u16>,
    config: StreamConfig,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
    /// Clones used to shut the sockets down from any thread.
    sockets: Mutex<Vec<TcpStream>>,
    connected: AtomicBool,
}

impl TcpClientStream {
    pub fn new(
        host: impl Into<String>,
        write_port: Option<u16>,
        read_port: Option<u16>,
        config: StreamConfig,
    ) -> Result<Self> {
        if write_port.is_none() && read_port.is_none() {
            return Err(StreamError::InvalidConfig(
                "tcp client needs a write port or a read port".to_string(),
            ));
        }
        Ok(Self {
            host: host.into(),
            write_port,
            read_port,
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            sockets: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Stream for TcpClientStream {
    fn name(&self) -> &'static str {
        "tcp-client"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();

        let timeout = self.config.connect_timeout;
        let write_socket = match self.write_port {
            Some(port) => Some(connect_addr(&self.host, port, timeout)?),
            None => None,
        };
        let read_socket = match (self.read_port, &write_socket) {
            (Some(port), Some(socket)) if self.write_port == Some(port) => Some(socket.try_clone()?),
            (Some(port), _) => Some(connect_addr(&self.host, port, timeout)?),
            (None, _) => None,
        };

        let mut sockets = lock(&self.sockets);
        if let Some(socket) = &write_socket {
            socket.set_write_timeout(self.config.write_timeout)?;
            sockets.push(socket.try_clone()?);
        }
        if let Some(socket) = &read_socket {
            socket.set_read_timeout(self.config.read_timeout)?;
            sockets.push(socket.try_clone()?);
        }
        drop(sockets);

        *lock(&self.writer) = write_socket;
        *lock(&self.reader) = read_socket;
        self.connected.store(true, Ordering::Release);
        info!(
            host = %self.host,
            write_port = ?self.write_port,
            read_port = ?self.read_port,
            "tcp client connected"
        );
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<BytesMut> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let reader = lock(&self.reader);
        let Some(socket) = reader.as_ref() else {
            drop(reader);
            return wait_until_disconnected(|| self.connected());
        };
        let result = read_chunk(socket, self.config.read_chunk_size);
        if matches!(result, Err(StreamError::Closed)) {
            self.connected.store(false, Ordering::Release);
        }
        result
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let writer = lock(&self.writer);
        let socket = writer.as_ref().ok_or_else(|| {
            StreamError::InvalidConfig("write attempted on a read only tcp client".to_string())
        })?;
        write_all(socket, data)
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        for socket in lock(&self.sockets).drain(..) {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if was_connected {
            debug!(host = %self.host, "tcp client disconnected");
        }
    }
}

/// One listening port and the client currently attached to it.
#[derive(Debug)]
struct ClientSlot {
    listen_address: String,
    port: u16,
    local_addr: Mutex<Option<SocketAddr>>,
    client: Mutex<Option<TcpStream>>,
    /// Bumped whenever a new client replaces the old one.
    generation: AtomicU64,
    ready: Condvar,
    running: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSlot {
    fn new(listen_address: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            listen_address: listen_address.to_string(),
            port,
            local_addr: Mutex::new(None),
            client: Mutex::new(None),
            generation: AtomicU64::new(0),
            ready: Condvar::new(),
            running: AtomicBool::new(false),
            acceptor: Mutex::new(None),
        })
    }

    fn start(self: &Arc<Self>, write_timeout: Option<Duration>) -> Result<()> {
        let addr = format!("{}:{}", self.listen_address, self.port);
        let listener = TcpListener::bind(&addr).map_err(|source| StreamError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local_addr);
        self.running.store(true, Ordering::Release);

        let slot = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("tcp-accept-{}", local_addr.port()))
            .spawn(move || slot.accept_loop(listener, write_timeout))?;
        *lock(&self.acceptor) = Some(handle);
        info!(%local_addr, "listening for tcp clients");
        Ok(())
    }

    fn accept_loop(&self, listener: TcpListener, write_timeout: Option<Duration>) {
        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = prepare_client(&stream, write_timeout) {
                        warn!(%peer, error = %err, "failed to configure tcp client");
                        continue;
                    }
                    let mut client = lock(&self.client);
                    match client.replace(stream) {
                        Some(old) => {
                            info!(%peer, "new tcp client replaces existing connection");
                            let _ = old.shutdown(Shutdown::Both);
                        }
                        None => info!(%peer, "tcp client connected"),
                    }
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    self.ready.notify_all();
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        debug!(port = self.port, "tcp acceptor stopped");
    }

    /// Block until a client is attached. Returns its generation and a handle.
    fn wait_for_client(&self) -> Result<(u64, TcpStream)> {
        let mut client = lock(&self.client);
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(StreamError::Closed);
            }
            if let Some(stream) = client.as_ref() {
                return Ok((self.generation.load(Ordering::Acquire), stream.try_clone()?));
            }
            client = self
                .ready
                .wait_timeout(client, IDLE_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Detach the client of `generation` if it is still the current one.
    fn drop_client(&self, generation: u64) {
        let mut client = lock(&self.client);
        if self.generation.load(Ordering::Acquire) == generation {
            if let Some(old) = client.take() {
                let _ = old.shutdown(Shutdown::Both);
                info!(port = self.port, "tcp client disconnected");
            }
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(client) = lock(&self.client).take() {
            let _ = client.shutdown(Shutdown::Both);
        }
        self.ready.notify_all();
        if let Some(handle) = lock(&self.acceptor).take() {
            let _ = handle.join();
        }
    }
}

fn prepare_client(stream: &TcpStream, write_timeout: Option<Duration>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(write_timeout)
}

/// TCP server with a single active client per port. A newly accepted client
/// replaces (and closes) the previous one.
#[derive(Debug)]
pub struct TcpServerStream {
    write_slot: Option<Arc<ClientSlot>>,
    read_slot: Option<Arc<ClientSlot>>,
    config: StreamConfig,
}

impl TcpServerStream {
    pub fn new(
        listen_address: &str,
        write_port: Option<u16>,
        read_port: Option<u16>,
        config: StreamConfig,
    ) -> Result<Self> {
        let write_slot = write_port.map(|port| ClientSlot::new(listen_address, port));
        let read_slot = match (read_port, &write_slot) {
            (Some(port), Some(slot)) if write_port == Some(port) => Some(Arc::clone(slot)),
            (Some(port), _) => Some(ClientSlot::new(listen_address, port)),
            (None, _) => None,
        };
        if write_slot.is_none() && read_slot.is_none() {
            return Err(StreamError::InvalidConfig(
                "tcp server needs a write port or a read port".to_string(),
            ));
        }
        Ok(Self {
            write_slot,
            read_slot,
            config,
        })
    }

    fn slots(&self) -> impl Iterator<Item = &Arc<ClientSlot>> {
        let shared = matches!(
            (&self.write_slot, &self.read_slot),
            (Some(w), Some(r)) if Arc::ptr_eq(w, r)
        );
        self.write_slot
            .iter()
            .chain(self.read_slot.iter().filter(move |_| !shared))
    }

    /// Bound address of the write port (or the read port for read only
    /// servers). Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.write_slot
            .as_ref()
            .or(self.read_slot.as_ref())
            .and_then(|slot| *lock(&slot.local_addr))
    }
}

impl Stream for TcpServerStream {
    fn name(&self) -> &'static str {
        "tcp-server"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();
        for slot in self.slots() {
            slot.start(self.config.write_timeout)?;
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.slots().all(|slot| slot.running.load(Ordering::Acquire))
    }

    fn read(&self) -> Result<BytesMut> {
        let Some(slot) = &self.read_slot else {
            return wait_until_disconnected(|| self.connected());
        };
        loop {
            let (generation, stream) = slot.wait_for_client()?;
            let result = stream
                .set_read_timeout(self.config.read_timeout)
                .map_err(StreamError::from_io)
                .and_then(|()| read_chunk(&stream, self.config.read_chunk_size));
            match result {
                Ok(data) => return Ok(data),
                Err(StreamError::Timeout) => return Err(StreamError::Timeout),
                Err(err) => {
                    // Only this client is lost. Keep listening: either a
                    // newer client took over or the next one will.
                    debug!(port = slot.port, error = %err, "tcp client read failed");
                    slot.drop_client(generation);
                }
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let slot = self.write_slot.as_ref().ok_or_else(|| {
            StreamError::InvalidConfig("write attempted on a read only tcp server".to_string())
        })?;
        if !slot.running.load(Ordering::Acquire) {
            return Err(StreamError::NotConnected);
        }
        let mut client = lock(&slot.client);
        let Some(stream) = client.as_ref() else {
            debug!(bytes = data.len(), "no tcp client attached, dropping write");
            return Ok(());
        };
        if let Err(err) = write_all(stream, data) {
            warn!(error = %err, "tcp client write failed, dropping client");
            if let Some(old) = client.take() {
                let _ = old.shutdown(Shutdown::Both);
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        for slot in self.slots() {
            slot.stop();
        }
    }
}

impl Drop for TcpServerStream {
    fn drop(&mut self) {
        self.disconnect();
    }
}
