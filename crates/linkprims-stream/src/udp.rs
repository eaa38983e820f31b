use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::traits::{lock, remaining, wait_until_disconnected, Stream, StreamConfig, IDLE_POLL_INTERVAL};

/// Addressing for a UDP link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConfig {
    /// Remote host; a 224.0.0.0/4 address turns on multicast.
    pub hostname: String,
    pub write_dest_port: Option<u16>,
    pub read_port: Option<u16>,
    /// Local port writes are sent from. Equal to `read_port`, one socket
    /// serves both directions.
    pub write_src_port: Option<u16>,
    /// Local interface used to join the multicast group.
    pub interface_address: Option<Ipv4Addr>,
    /// Multicast time to live.
    pub ttl: u32,
    pub bind_address: String,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            write_dest_port: None,
            read_port: None,
            write_src_port: None,
            interface_address: None,
            ttl: 128,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

impl UdpConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: localhost(hostname),
            ..Self::default()
        }
    }

    pub fn with_write_dest_port(mut self, port: Option<u16>) -> Self {
        self.write_dest_port = port;
        self
    }

    pub fn with_read_port(mut self, port: Option<u16>) -> Self {
        self.read_port = port;
        self
    }

    pub fn with_write_src_port(mut self, port: Option<u16>) -> Self {
        self.write_src_port = port;
        self
    }

    pub fn with_interface_address(mut self, address: Option<Ipv4Addr>) -> Self {
        self.interface_address = address;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl.max(1);
        self
    }

    pub fn with_bind_address(mut self, address: &str) -> Self {
        self.bind_address = localhost(address);
        self
    }

    fn multicast_group(&self) -> Option<Ipv4Addr> {
        self.hostname
            .parse::<Ipv4Addr>()
            .ok()
            .filter(Ipv4Addr::is_multicast)
    }
}

fn localhost(host: &str) -> String {
    if host.eq_ignore_ascii_case("LOCALHOST") {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

/// UDP link. Connection means the sockets exist: reads return one datagram
/// each, writes send one datagram each.
#[derive(Debug)]
pub struct UdpStream {
    udp: UdpConfig,
    config: StreamConfig,
    reader: Mutex<Option<Arc<UdpSocket>>>,
    writer: Mutex<Option<Arc<UdpSocket>>>,
    connected: AtomicBool,
}

impl UdpStream {
    pub fn new(udp: UdpConfig, config: StreamConfig) -> Result<Self> {
        if udp.write_dest_port.is_none() && udp.read_port.is_none() {
            return Err(StreamError::InvalidConfig(
                "udp needs a write destination port or a read port".to_string(),
            ));
        }
        if udp.write_dest_port.is_some() && udp.hostname.is_empty() {
            return Err(StreamError::InvalidConfig(
                "udp writes need a hostname".to_string(),
            ));
        }
        Ok(Self {
            udp,
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn udp_config(&self) -> &UdpConfig {
        &self.udp
    }

    /// Local address of the read socket, once connected. Useful after
    /// binding port 0.
    pub fn read_addr(&self) -> Option<SocketAddr> {
        lock(&self.reader)
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Local address writes are sent from, once connected.
    pub fn write_addr(&self) -> Option<SocketAddr> {
        lock(&self.writer)
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn bind(&self, port: u16) -> Result<UdpSocket> {
        let addr = format!("{}:{port}", self.udp.bind_address);
        UdpSocket::bind(&addr).map_err(|source| StreamError::Bind { addr, source })
    }

    fn destination(&self, port: u16) -> Result<SocketAddr> {
        let addr = format!("{}:{port}", self.udp.hostname);
        (self.udp.hostname.as_str(), port)
            .to_socket_addrs()
            .map_err(|source| StreamError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| StreamError::Connect {
                addr,
                source: std::io::Error::new(ErrorKind::NotFound, "no addresses resolved"),
            })
    }

    fn open_reader(&self, port: u16) -> Result<UdpSocket> {
        let socket = self.bind(port)?;
        if let Some(group) = self.udp.multicast_group() {
            let interface = self.udp.interface_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &interface)?;
        }
        Ok(socket)
    }

    fn open_writer(&self, socket: Option<UdpSocket>, port: u16) -> Result<UdpSocket> {
        let socket = match socket {
            Some(socket) => socket,
            None => self.bind(self.udp.write_src_port.unwrap_or(0))?,
        };
        socket.connect(self.destination(port)?)?;
        socket.set_write_timeout(self.config.write_timeout)?;
        if self.udp.multicast_group().is_some() {
            socket.set_multicast_ttl_v4(self.udp.ttl)?;
            if self.udp.interface_address.is_some() {
                warn!(
                    hostname = %self.udp.hostname,
                    "outgoing multicast interface selection is not supported; using the default route"
                );
            }
        }
        Ok(socket)
    }
}

impl Stream for UdpStream {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();

        let udp = &self.udp;
        let (reader, writer) = match (udp.read_port, udp.write_dest_port) {
            (Some(read_port), Some(dest_port)) if udp.write_src_port == Some(read_port) => {
                let socket = Arc::new(self.open_writer(Some(self.open_reader(read_port)?), dest_port)?);
                (Some(Arc::clone(&socket)), Some(socket))
            }
            (read_port, dest_port) => {
                let reader = read_port
                    .map(|port| self.open_reader(port))
                    .transpose()?
                    .map(Arc::new);
                let writer = dest_port
                    .map(|port| self.open_writer(None, port))
                    .transpose()?
                    .map(Arc::new);
                (reader, writer)
            }
        };

        *lock(&self.reader) = reader;
        *lock(&self.writer) = writer;
        self.connected.store(true, Ordering::Release);
        info!(
            hostname = %udp.hostname,
            write_dest_port = ?udp.write_dest_port,
            read_port = ?udp.read_port,
            "udp sockets open"
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
        let Some(socket) = lock(&self.reader).clone() else {
            return wait_until_disconnected(|| self.connected());
        };

        // Short socket timeouts let a disconnect from another thread end the
        // read.
        let deadline = self.config.read_timeout.map(|timeout| Instant::now() + timeout);
        let mut buf = vec![0u8; self.config.read_chunk_size];
        loop {
            if !self.connected() {
                return Err(StreamError::Closed);
            }
            let wait = remaining(deadline).map_or(IDLE_POLL_INTERVAL, |left| left.min(IDLE_POLL_INTERVAL));
            if wait.is_zero() {
                return Err(StreamError::Timeout);
            }
            socket.set_read_timeout(Some(wait))?;
            match socket.recv_from(&mut buf) {
                Ok((0, peer)) => debug!(%peer, "ignoring empty udp datagram"),
                Ok((n, _)) => return Ok(BytesMut::from(&buf[..n])),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(StreamError::from_io(err)),
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let socket = lock(&self.writer).clone().ok_or_else(|| {
            StreamError::InvalidConfig("write attempted on a read only udp link".to_string())
        })?;
        let sent = socket.send(data).map_err(StreamError::from_io)?;
        if sent < data.len() {
            return Err(StreamError::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("udp datagram truncated to {sent} of {} bytes", data.len()),
            )));
        }
        Ok(())
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        lock(&self.reader).take();
        lock(&self.writer).take();
        if was_connected {
            debug!(hostname = %self.udp.hostname, "udp sockets closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn local() -> UdpConfig {
        UdpConfig::new("localhost").with_bind_address("127.0.0.1")
    }

    #[test]
    fn test_requires_a_port() {
        assert!(matches!(
            UdpStream::new(local(), StreamConfig::default()),
            Err(StreamError::InvalidConfig(_))
        ));
        assert_eq!(local().hostname, "127.0.0.1");
        assert_eq!(UdpConfig::default().with_ttl(0).ttl, 1);
    }

    #[test]
    fn test_write_and_read_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let stream = UdpStream::new(
            local().with_write_dest_port(Some(peer_port)).with_read_port(Some(0)),
            StreamConfig::default(),
        )
        .unwrap();
        stream.connect().unwrap();
        assert!(stream.connected());

        stream.write(b"CMD").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"CMD");
        assert_eq!(Some(from), stream.write_addr());

        let read_addr = stream.read_addr().unwrap();
        peer.send_to(b"TLM1", read_addr).unwrap();
        peer.send_to(b"TLM2", read_addr).unwrap();
        assert_eq!(stream.read().unwrap().as_ref(), b"TLM1");
        assert_eq!(stream.read().unwrap().as_ref(), b"TLM2");

        stream.disconnect();
        assert!(!stream.connected());
        assert!(matches!(stream.read(), Err(StreamError::NotConnected)));
    }

    #[test]
    fn test_shared_socket_when_src_port_matches_read_port() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        let stream = UdpStream::new(
            local()
                .with_write_dest_port(Some(peer_port))
                .with_read_port(Some(port))
                .with_write_src_port(Some(port)),
            StreamConfig::default(),
        )
        .unwrap();
        stream.connect().unwrap();
        assert_eq!(stream.read_addr(), stream.write_addr());
        assert_eq!(stream.read_addr().unwrap().port(), port);
        stream.disconnect();
    }

    #[test]
    fn test_read_timeout_and_disconnect_wake() {
        let stream = Arc::new(
            UdpStream::new(
                local().with_read_port(Some(0)),
                StreamConfig::default().with_read_timeout(Some(Duration::from_millis(50))),
            )
            .unwrap(),
        );
        stream.connect().unwrap();
        assert!(matches!(stream.read(), Err(StreamError::Timeout)));
        assert!(matches!(
            stream.write(b"x"),
            Err(StreamError::InvalidConfig(_))
        ));

        let blocking = Arc::new(UdpStream::new(local().with_read_port(Some(0)), StreamConfig::default()).unwrap());
        blocking.connect().unwrap();
        let reader = Arc::clone(&blocking);
        let handle = std::thread::spawn(move || reader.read());
        std::thread::sleep(Duration::from_millis(50));
        blocking.disconnect();
        assert!(matches!(handle.join().unwrap(), Err(StreamError::Closed)));
    }
}
