use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use linkprims_packet::{Packet, PacketKind};
use tracing::{error, info, warn};

use crate::error::{InterfaceError, Result};
use crate::interface::{lock, Interface};
use crate::sleeper::Sleeper;

/// Bytes of an unidentified packet shown in the log.
pub const UNKNOWN_BYTES_TO_PRINT: usize = 36;

/// Receives every packet an interface thread reads.
pub trait PacketHandler: Send {
    fn handle(&mut self, interface: &Interface, packet: Packet);
}

impl<F> PacketHandler for F
where
    F: FnMut(&Interface, Packet) + Send,
{
    fn handle(&mut self, interface: &Interface, packet: Packet) {
        self(interface, packet)
    }
}

/// Default handler: identify against the interface's system (when one is
/// attached), then write to every connected, writable router.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifyAndRoute;

impl PacketHandler for IdentifyAndRoute {
    fn handle(&mut self, interface: &Interface, packet: Packet) {
        let packet = identify_packet(interface, packet);
        for router in interface.routers() {
            if !router.config().write_allowed || !router.connected() {
                continue;
            }
            if let Err(err) = router.write(packet.clone()) {
                error!(
                    interface = %interface.name(),
                    router = %router.name(),
                    error = %err,
                    "Problem writing to router"
                );
            }
        }
    }
}

/// Resolve the definition of a packet read from `interface`.
///
/// Packets a protocol already identified are kept. Packets carrying only
/// target and packet names are looked up; anything else is identified from
/// its bytes against the interface's telemetry targets. Unknown data becomes
/// `UNKNOWN UNKNOWN`. Without a system the packet is returned untouched.
pub fn identify_packet(interface: &Interface, mut packet: Packet) -> Packet {
    let Some(system) = interface.system() else {
        return packet;
    };
    if packet.definition().is_some() {
        return packet;
    }

    if let (Some(target), Some(name)) = (&packet.target_name, &packet.packet_name) {
        match system.packet(PacketKind::Telemetry, target, name) {
            Ok(def) => {
                packet.set_definition(def);
                return packet;
            }
            Err(_) => {
                warn!(
                    interface = %interface.name(),
                    "Received unknown identified telemetry: {target} {name}"
                );
                packet.clear_identity();
            }
        }
    }

    let tlm_target_names = &interface.config().tlm_target_names;
    if let Some(def) = system.identify_kind(PacketKind::Telemetry, &packet.buffer, tlm_target_names) {
        packet.set_definition(def);
        return packet;
    }

    if let Ok(unknown) = system.packet(PacketKind::Telemetry, "UNKNOWN", "UNKNOWN") {
        packet.set_definition(unknown);
    }
    let preview: String = packet
        .buffer
        .iter()
        .take(UNKNOWN_BYTES_TO_PRINT)
        .map(|byte| format!("{byte:02X}"))
        .collect();
    error!(
        interface = %interface.name(),
        "{} - Unknown {} byte packet starting: {preview}",
        interface.name(),
        packet.len()
    );
    packet
}

/// Cancellation shared between an [`InterfaceThread`] and its loop.
#[derive(Debug, Default)]
struct Control {
    cancelled: AtomicBool,
    sleeper: Sleeper,
    /// Held while connecting so `stop` never races a connect.
    connecting: Mutex<()>,
}

impl Control {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.sleeper.cancel();
    }
}

/// Runs one interface on its own thread: connect, read, hand each packet to
/// the handler, and on any failure disconnect, wait `reconnect_delay` and
/// try again until stopped.
pub struct InterfaceThread {
    interface: Arc<Interface>,
    handler: Option<Box<dyn PacketHandler>>,
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for InterfaceThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceThread")
            .field("interface", &self.interface.name())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl InterfaceThread {
    /// Thread using [`IdentifyAndRoute`].
    pub fn new(interface: Arc<Interface>) -> Self {
        Self::with_handler(interface, IdentifyAndRoute)
    }

    pub fn with_handler(interface: Arc<Interface>, handler: impl PacketHandler + 'static) -> Self {
        Self {
            interface,
            handler: Some(Box::new(handler)),
            control: Arc::new(Control::default()),
            handle: None,
        }
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    pub fn start(&mut self) -> Result<()> {
        let name = self.interface.name().to_string();
        let mut handler = self
            .handler
            .take()
            .ok_or_else(|| InterfaceError::AlreadyStarted(name.clone()))?;
        let interface = Arc::clone(&self.interface);
        let control = Arc::clone(&self.control);
        let handle = std::thread::Builder::new()
            .name(format!("linkprims-{}", name.to_ascii_lowercase()))
            .spawn(move || run(&interface, &control, handler.as_mut()))
            .map_err(|source| InterfaceError::Spawn { name, source })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Cancel the loop, wake any reconnect wait, disconnect the interface so
    /// a blocked read returns, and join the thread.
    pub fn stop(&mut self) {
        {
            let _connecting = lock(&self.control.connecting);
            self.control.cancel();
            self.interface.disconnect();
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!(interface = %self.interface.name(), "interface thread panicked");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for InterfaceThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run(interface: &Interface, control: &Control, handler: &mut dyn PacketHandler) {
    let name = interface.name();
    if interface.config().read_allowed {
        info!(interface = %name, "Starting packet reading for {name}");
    } else {
        info!(interface = %name, "Starting connection maintenance for {name}");
    }

    while !control.cancelled() {
        if !interface.connected() {
            let attempt = {
                let _connecting = lock(&control.connecting);
                if control.cancelled() {
                    break;
                }
                info!(interface = %name, "Connecting to {name}...");
                interface.connect()
            };
            match attempt {
                Ok(()) => info!(interface = %name, "{name} Connection Success"),
                Err(err) => {
                    error!(interface = %name, error = %err, "{name} Connection Failed: {err}");
                    disconnect_and_wait(interface, control);
                    continue;
                }
            }
        }

        if interface.config().read_allowed {
            match interface.read() {
                Ok(Some(mut packet)) => {
                    if packet.received_time.is_none() {
                        packet.received_time = Some(SystemTime::now());
                    }
                    handler.handle(interface, packet);
                }
                Ok(None) => {
                    info!(interface = %name, "Clean disconnect from {name} (returned None)");
                    info!(interface = %name, "Connection Lost for {name}");
                    disconnect_and_wait(interface, control);
                }
                Err(err) => {
                    info!(interface = %name, error = %err, "Connection Lost for {name}: {err}");
                    disconnect_and_wait(interface, control);
                }
            }
        } else {
            control.sleeper.sleep(Duration::from_secs(1));
            if !interface.connected() && !control.cancelled() {
                info!(interface = %name, "Connection Lost for {name}");
                disconnect_and_wait(interface, control);
            }
        }
    }
    info!(interface = %name, "Stopped packet reading for {name}");
}

fn disconnect_and_wait(interface: &Interface, control: &Control) {
    interface.disconnect();
    if !interface.config().auto_reconnect {
        control.cancel();
    } else if !control.cancelled() {
        control.sleeper.sleep(interface.config().reconnect_delay);
    }
}
