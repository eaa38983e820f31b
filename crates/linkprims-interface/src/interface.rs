use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use linkprims_packet::{Packet, System};
use linkprims_protocol::{LinkInfo, Outcome, Protocol};
use linkprims_stream::{Stream, StreamError};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{InterfaceError, Result};

/// A protocol instance, shared between the read and write chains when it
/// was added as `READ_WRITE`.
pub type SharedProtocol = Arc<Mutex<Box<dyn Protocol>>>;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which chain(s) a protocol joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolKind {
    Read,
    Write,
    ReadWrite,
}

impl FromStr for ProtocolKind {
    type Err = InterfaceError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "READ" => Ok(Self::Read),
            "WRITE" => Ok(Self::Write),
            "READ_WRITE" => Ok(Self::ReadWrite),
            _ => Err(InterfaceError::ProtocolKind(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceState {
    Disconnected,
    Connecting,
    Connected,
}

/// Behaviour settings for one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub target_names: Vec<String>,
    pub cmd_target_names: Vec<String>,
    pub tlm_target_names: Vec<String>,
    /// Whether a bridge starts this interface's thread at startup.
    pub connect_on_startup: bool,
    /// When false the interface thread stops after the first lost connection.
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    /// Refuse `DISCONNECT` interface commands.
    pub disable_disconnect: bool,
    pub read_allowed: bool,
    pub write_allowed: bool,
    pub write_raw_allowed: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            target_names: Vec::new(),
            cmd_target_names: Vec::new(),
            tlm_target_names: Vec::new(),
            connect_on_startup: true,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            disable_disconnect: false,
            read_allowed: true,
            write_allowed: true,
            write_raw_allowed: true,
        }
    }
}

impl InterfaceConfig {
    /// Map the interface to targets for both commands and telemetry.
    pub fn with_target_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        let names: Vec<String> = names
            .iter()
            .map(|name| name.as_ref().to_ascii_uppercase())
            .collect();
        self.cmd_target_names = names.clone();
        self.tlm_target_names = names.clone();
        self.target_names = names;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_connect_on_startup(mut self, connect_on_startup: bool) -> Self {
        self.connect_on_startup = connect_on_startup;
        self
    }

    pub fn with_read_allowed(mut self, allowed: bool) -> Self {
        self.read_allowed = allowed;
        self
    }

    pub fn with_write_allowed(mut self, allowed: bool) -> Self {
        self.write_allowed = allowed;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    read_count: AtomicU64,
    write_count: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Counters {
    fn clear(&self) {
        self.read_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

/// One protocol as it was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolInfo {
    pub name: String,
    pub kind: ProtocolKind,
}

/// Point-in-time view of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub state: InterfaceState,
    pub stream: String,
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub protocols: Vec<ProtocolInfo>,
    pub routers: Vec<String>,
}

/// A stream plus its read and write protocol chains: the unit of connection
/// to one link.
///
/// Configuration (`add_protocol`, `set_option`, routers, system) happens
/// through `&mut self` before the interface is shared. Once in an `Arc`, one
/// thread reads while any number of threads write; writes are serialized by
/// an internal mutex.
pub struct Interface {
    name: String,
    config: InterfaceConfig,
    stream: Box<dyn Stream>,
    state: Mutex<InterfaceState>,
    read_protocols: Vec<SharedProtocol>,
    write_protocols: Vec<SharedProtocol>,
    protocol_info: Vec<ProtocolInfo>,
    options: BTreeMap<String, Vec<String>>,
    system: Option<Arc<System>>,
    routers: Vec<Arc<Interface>>,
    log_stream: Option<Vec<String>>,
    counters: Counters,
    write_mutex: Mutex<()>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("stream", &self.stream.name())
            .field("state", &self.state())
            .field("protocols", &self.protocol_info)
            .finish_non_exhaustive()
    }
}

impl Interface {
    pub fn new(name: impl Into<String>, stream: Box<dyn Stream>, config: InterfaceConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stream,
            state: Mutex::new(InterfaceState::Disconnected),
            read_protocols: Vec::new(),
            write_protocols: Vec::new(),
            protocol_info: Vec::new(),
            options: BTreeMap::new(),
            system: None,
            routers: Vec::new(),
            log_stream: None,
            counters: Counters::default(),
            write_mutex: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn state(&self) -> InterfaceState {
        *lock(&self.state)
    }

    fn set_state(&self, state: InterfaceState) {
        *lock(&self.state) = state;
    }

    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    pub fn system(&self) -> Option<&Arc<System>> {
        self.system.as_ref()
    }

    /// Routers this interface forwards what it reads to.
    pub fn routers(&self) -> &[Arc<Interface>] {
        &self.routers
    }

    pub fn protocol_info(&self) -> &[ProtocolInfo] {
        &self.protocol_info
    }

    pub fn options(&self) -> &BTreeMap<String, Vec<String>> {
        &self.options
    }

    pub fn option(&self, name: &str) -> Option<&[String]> {
        self.options
            .get(&name.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// `LOG_STREAM`/`LOG_RAW` parameters, if requested.
    pub fn log_stream(&self) -> Option<&[String]> {
        self.log_stream.as_deref()
    }

    pub fn link_info(&self) -> LinkInfo {
        LinkInfo {
            name: self.name.clone(),
            cmd_target_names: self.config.cmd_target_names.clone(),
            tlm_target_names: self.config.tlm_target_names.clone(),
            system: self.system.clone(),
        }
    }

    /// Attach packet definitions; every protocol is re-attached so it sees
    /// them.
    pub fn set_system(&mut self, system: Arc<System>) {
        self.system = Some(system);
        let link = self.link_info();
        for protocol in self.unique_protocols() {
            lock(protocol).attach(&link);
        }
    }

    /// Add a protocol. `Read` appends to the read chain, `Write` prepends to
    /// the write chain, `ReadWrite` does both with one shared instance.
    pub fn add_protocol(&mut self, kind: ProtocolKind, mut protocol: Box<dyn Protocol>) -> SharedProtocol {
        protocol.attach(&self.link_info());
        self.protocol_info.push(ProtocolInfo {
            name: protocol.name().to_string(),
            kind,
        });
        let shared: SharedProtocol = Arc::new(Mutex::new(protocol));
        if matches!(kind, ProtocolKind::Read | ProtocolKind::ReadWrite) {
            self.read_protocols.push(Arc::clone(&shared));
        }
        if matches!(kind, ProtocolKind::Write | ProtocolKind::ReadWrite) {
            self.write_protocols.insert(0, Arc::clone(&shared));
        }
        shared
    }

    pub fn set_option(&mut self, name: &str, values: Vec<String>) {
        self.options.insert(name.to_ascii_uppercase(), values);
    }

    pub fn add_router(&mut self, router: Arc<Interface>) {
        if !self.routers.iter().any(|existing| Arc::ptr_eq(existing, &router)) {
            self.routers.push(router);
        }
    }

    pub fn set_reconnect_delay(&mut self, delay: Duration) {
        self.config.reconnect_delay = delay;
    }

    pub fn set_log_stream(&mut self, params: Vec<String>) {
        self.log_stream = Some(params);
    }

    /// Every protocol once, read chain order first.
    fn unique_protocols(&self) -> impl Iterator<Item = &SharedProtocol> {
        self.read_protocols.iter().chain(
            self.write_protocols
                .iter()
                .filter(|p| !self.read_protocols.iter().any(|r| Arc::ptr_eq(r, p))),
        )
    }

    pub fn connect(&self) -> Result<()> {
        self.set_state(InterfaceState::Connecting);
        for protocol in self.unique_protocols() {
            lock(protocol).connect_reset();
        }
        if let Err(err) = self.stream.connect() {
            self.set_state(InterfaceState::Disconnected);
            return Err(err.into());
        }
        self.set_state(InterfaceState::Connected);
        Ok(())
    }

    /// Close the stream and drop buffered protocol state. Wakes a reader
    /// blocked in [`Interface::read`].
    pub fn disconnect(&self) {
        self.stream.disconnect();
        for protocol in self.unique_protocols() {
            lock(protocol).disconnect_reset();
        }
        self.set_state(InterfaceState::Disconnected);
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the stream ends or a protocol asks to
    /// disconnect. Errors disconnect the interface before they are returned.
    pub fn read(&self) -> Result<Option<Packet>> {
        if !self.connected() {
            return Err(InterfaceError::NotConnected {
                op: "read",
                name: self.name.clone(),
            });
        }
        if !self.config.read_allowed {
            return Err(InterfaceError::NotReadable(self.name.clone()));
        }
        self.read_chain().inspect_err(|err| {
            error!(interface = %self.name, error = %err, "Error reading from interface");
            self.disconnect();
        })
    }

    fn read_chain(&self) -> Result<Option<Packet>> {
        // The first pass feeds nothing so protocols can emit frames they
        // already hold before the stream is read again.
        let mut first = !self.read_protocols.is_empty();
        loop {
            let data = if first {
                first = false;
                BytesMut::new()
            } else {
                match self.stream.read() {
                    Ok(data) if data.is_empty() => {
                        info!(interface = %self.name, "read_interface requested disconnect");
                        return Ok(None);
                    }
                    Ok(data) => {
                        self.counters
                            .bytes_read
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        debug!(interface = %self.name, len = data.len(), "read raw data");
                        data
                    }
                    Err(StreamError::Closed) => {
                        info!(interface = %self.name, "read_interface requested disconnect");
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            };

            let last = self.read_protocols.len().saturating_sub(1);
            let data = match self.run_chain(&self.read_protocols, "read_data", data, |p, data, index| {
                p.read_data(data, index == last)
            })? {
                Outcome::Ready(data) => data,
                Outcome::Stop => continue,
                Outcome::Disconnect => return Ok(None),
            };

            let packet = Packet::raw(data.to_vec());
            let packet = match self.run_chain(&self.read_protocols, "read_packet", packet, |p, packet, _| {
                p.read_packet(packet)
            })? {
                Outcome::Ready(packet) => packet,
                Outcome::Stop => continue,
                Outcome::Disconnect => return Ok(None),
            };

            self.counters.read_count.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(packet));
        }
    }

    /// Pass `value` through `chain`, stopping at the first protocol that does
    /// not answer `Ready`.
    fn run_chain<T>(
        &self,
        chain: &[SharedProtocol],
        hook: &'static str,
        mut value: T,
        mut step: impl FnMut(&mut Box<dyn Protocol>, T, usize) -> linkprims_protocol::Result<Outcome<T>>,
    ) -> Result<Outcome<T>> {
        for (index, protocol) in chain.iter().enumerate() {
            let mut protocol = lock(protocol);
            match step(&mut *protocol, value, index)? {
                Outcome::Ready(next) => value = next,
                Outcome::Stop => return Ok(Outcome::Stop),
                Outcome::Disconnect => {
                    info!(
                        interface = %self.name,
                        protocol = protocol.name(),
                        hook,
                        "Protocol requested disconnect"
                    );
                    return Ok(Outcome::Disconnect);
                }
            }
        }
        Ok(Outcome::Ready(value))
    }

    /// Send a packet through the write chain and out on the stream.
    pub fn write(&self, packet: Packet) -> Result<()> {
        if !self.connected() {
            return Err(InterfaceError::NotConnected {
                op: "write",
                name: self.name.clone(),
            });
        }
        if !self.config.write_allowed {
            return Err(InterfaceError::NotWritable(self.name.clone()));
        }
        let _guard = lock(&self.write_mutex);
        self.counters.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_chain(packet).inspect_err(|err| {
            error!(interface = %self.name, error = %err, "Error writing to interface");
            self.disconnect();
        })
    }

    fn write_chain(&self, packet: Packet) -> Result<()> {
        let chain = &self.write_protocols;
        let packet = match self.run_chain(chain, "write_packet", packet, |p, packet, _| {
            p.write_packet(packet)
        })? {
            Outcome::Ready(packet) => packet,
            Outcome::Stop => return Ok(()),
            Outcome::Disconnect => {
                self.disconnect();
                return Ok(());
            }
        };

        let data = match self.run_chain(chain, "write_data", packet.buffer.clone(), |p, data, _| {
            p.write_data(data)
        })? {
            Outcome::Ready(data) => data,
            Outcome::Stop => return Ok(()),
            Outcome::Disconnect => {
                self.disconnect();
                return Ok(());
            }
        };

        self.write_stream(&data)?;
        for protocol in chain {
            // Wait unlocked; the read thread needs the protocol to deliver
            // the response.
            let wait = lock(protocol).response_wait();
            if let Some(wait) = wait {
                wait.wait()?;
            }
            lock(protocol).post_write_interface(&packet, &data)?;
        }
        Ok(())
    }

    /// Write bytes to the stream without any protocol processing.
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(InterfaceError::NotConnected {
                op: "write_raw",
                name: self.name.clone(),
            });
        }
        if !self.config.write_raw_allowed {
            return Err(InterfaceError::NotRawWritable(self.name.clone()));
        }
        let _guard = lock(&self.write_mutex);
        self.write_stream(data).inspect_err(|err| {
            error!(interface = %self.name, error = %err, "Error writing to interface");
            self.disconnect();
        })
    }

    fn write_stream(&self, data: &[u8]) -> Result<()> {
        self.stream.write(data)?;
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(interface = %self.name, len = data.len(), "wrote raw data");
        Ok(())
    }

    /// Interface-level commands. Returns whether the command was handled.
    ///
    /// - `CLEAR_COUNTERS` zeroes the read/write counters.
    /// - `DISCONNECT` drops the link unless `disable_disconnect` is set; an
    ///   interface thread with `auto_reconnect` reconnects afterwards.
    pub fn interface_cmd(&self, cmd_name: &str, _args: &[String]) -> bool {
        match cmd_name.to_ascii_uppercase().as_str() {
            "CLEAR_COUNTERS" => {
                self.counters.clear();
                true
            }
            "DISCONNECT" if !self.config.disable_disconnect => {
                info!(interface = %self.name, "Disconnect commanded");
                self.disconnect();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            name: self.name.clone(),
            state: self.state(),
            stream: self.stream.name().to_string(),
            read_count: self.counters.read_count.load(Ordering::Relaxed),
            write_count: self.counters.write_count.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            protocols: self.protocol_info.clone(),
            routers: self.routers.iter().map(|r| r.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use linkprims_protocol::TerminatedProtocol;

    use super::*;
    use crate::test_support::ScriptedStream;

    /// Appends one marker byte on write.
    struct Marker(u8);

    impl Protocol for Marker {
        fn name(&self) -> &'static str {
            "MARKER"
        }

        fn write_data(&mut self, mut data: Vec<u8>) -> linkprims_protocol::Result<Outcome<Vec<u8>>> {
            data.push(self.0);
            Ok(Outcome::Ready(data))
        }
    }

    fn newline() -> Box<dyn Protocol> {
        Box::new(TerminatedProtocol::new(vec![b'\n'], vec![b'\n'], true, 0, None, false, None).unwrap())
    }

    #[test]
    fn test_reads_buffered_frames_before_stream() {
        let (stream, script) = ScriptedStream::new();
        script.push_read(b"AB\nCD\n");
        let mut interface = Interface::new("INST_INT", stream, InterfaceConfig::default());
        interface.add_protocol(ProtocolKind::ReadWrite, newline());
        interface.connect().unwrap();

        assert_eq!(interface.read().unwrap().unwrap().buffer, b"AB");
        // Second frame comes from the protocol buffer, not the stream.
        assert_eq!(interface.read().unwrap().unwrap().buffer, b"CD");
        assert_eq!(script.reads_served(), 1);

        let status = interface.status();
        assert_eq!(status.read_count, 2);
        assert_eq!(status.bytes_read, 6);
        assert_eq!(status.state, InterfaceState::Connected);
    }

    #[test]
    fn test_read_errors_and_eof() {
        let (stream, script) = ScriptedStream::new();
        let interface = Interface::new("INST_INT", stream, InterfaceConfig::default());
        let err = interface.read().unwrap_err();
        assert_eq!(err.to_string(), "Interface not connected for read INST_INT");

        interface.connect().unwrap();
        script.push_closed();
        assert!(interface.read().unwrap().is_none());

        let (stream, _script) = ScriptedStream::new();
        let interface = Interface::new(
            "TLM_ONLY",
            stream,
            InterfaceConfig::default().with_read_allowed(false),
        );
        interface.connect().unwrap();
        assert!(matches!(interface.read(), Err(InterfaceError::NotReadable(_))));
    }

    #[test]
    fn test_write_chain_order_and_counters() {
        let (stream, script) = ScriptedStream::new();
        let mut interface = Interface::new("INST_INT", stream, InterfaceConfig::default());
        interface.add_protocol(ProtocolKind::Write, Box::new(Marker(b'A')));
        interface.add_protocol(ProtocolKind::Write, Box::new(Marker(b'B')));
        interface.connect().unwrap();

        interface.write(Packet::raw(b"x".to_vec())).unwrap();
        // Later WRITE protocols run first.
        assert_eq!(script.written(), vec![b"xBA".to_vec()]);

        interface.write_raw(b"raw").unwrap();
        assert_eq!(script.written()[1], b"raw");
        let status = interface.status();
        assert_eq!(status.write_count, 1);
        assert_eq!(status.bytes_written, 6);

        assert!(interface.interface_cmd("clear_counters", &[]));
        assert_eq!(interface.status().bytes_written, 0);
        assert!(!interface.interface_cmd("SELF_DESTRUCT", &[]));
    }

    #[test]
    fn test_write_waits_for_template_response() {
        let dir = std::env::temp_dir().join(format!(
            "linkprims-interface-template-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path = dir.join("PSU/cmd_tlm/cmd_tlm.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "COMMAND PSU GET_VOLTAGE BIG_ENDIAN\n  APPEND_PARAMETER CMD_TEMPLATE 128 STRING \"MEAS:VOLT?\"\n  APPEND_PARAMETER RSP_TEMPLATE 128 STRING \"<VOLTAGE>\"\n  APPEND_PARAMETER RSP_PACKET 64 STRING \"VOLTAGE\"\nTELEMETRY PSU VOLTAGE BIG_ENDIAN\n  APPEND_ITEM VOLTAGE 32 FLOAT\n",
        )
        .unwrap();
        let system = Arc::new(System::new(&["PSU"], &dir).unwrap());

        let (stream, script) = ScriptedStream::new();
        let config = InterfaceConfig::default().with_target_names(&["PSU"]);
        let mut interface = Interface::new("PSU_INT", stream, config);
        let args: Vec<String> = vec!["0x0A".into(), "0x0A".into()];
        let template = linkprims_protocol::registry::create("TEMPLATE", &args).unwrap();
        interface.add_protocol(ProtocolKind::ReadWrite, template);
        interface.set_system(system.clone());
        interface.connect().unwrap();
        let interface = Arc::new(interface);

        let reader = {
            let interface = Arc::clone(&interface);
            let script = Arc::clone(&script);
            std::thread::spawn(move || {
                assert!(crate::test_support::wait_for(|| !script.written().is_empty()));
                script.push_read(b"12.5\n");
                interface.read().unwrap().unwrap()
            })
        };

        let def = system
            .packet(linkprims_packet::PacketKind::Command, "PSU", "GET_VOLTAGE")
            .unwrap();
        let mut command = Packet::from_def(def);
        command.restore_defaults().unwrap();
        interface.write(command).unwrap();
        assert_eq!(script.written(), vec![b"MEAS:VOLT?\n".to_vec()]);

        let response = reader.join().unwrap();
        assert_eq!(response.packet_name.as_deref(), Some("VOLTAGE"));
        assert_eq!(
            response.read("VOLTAGE").unwrap(),
            Some(linkprims_packet::Value::Float(12.5))
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_write_failure_disconnects() {
        let (stream, script) = ScriptedStream::new();
        let mut interface = Interface::new("INST_INT", stream, InterfaceConfig::default());
        interface.add_protocol(ProtocolKind::ReadWrite, newline());
        interface.connect().unwrap();

        script.fail_writes();
        assert!(interface.write(Packet::raw(b"CMD".to_vec())).is_err());
        assert!(!interface.connected());
        assert_eq!(interface.state(), InterfaceState::Disconnected);

        let err = interface.write(Packet::raw(b"CMD".to_vec())).unwrap_err();
        assert_eq!(err.to_string(), "Interface not connected for write INST_INT");
    }

    #[test]
    fn test_options_and_status_json() {
        let (stream, _script) = ScriptedStream::new();
        let mut interface = Interface::new("INST_INT", stream, InterfaceConfig::default());
        interface.set_option("listen_address", vec!["127.0.0.1".to_string()]);
        interface.add_protocol(ProtocolKind::ReadWrite, newline());
        assert_eq!(
            interface.option("LISTEN_ADDRESS"),
            Some(&["127.0.0.1".to_string()][..])
        );

        let json = serde_json::to_value(interface.status()).unwrap();
        assert_eq!(json["state"], "DISCONNECTED");
        assert_eq!(json["protocols"][0]["name"], "TERMINATED");
        assert_eq!(json["protocols"][0]["kind"], "READ_WRITE");
    }

    #[test]
    fn test_protocol_kind_parse() {
        assert_eq!("read_write".parse::<ProtocolKind>().unwrap(), ProtocolKind::ReadWrite);
        assert!("BOTH".parse::<ProtocolKind>().is_err());
    }
}
