use std::collections::BTreeMap;
use std::sync::Arc;

use linkprims_packet::System;
use tracing::{info, warn};

use crate::bridge_config::{BridgeConfig, LinkDecl};
use crate::error::{InterfaceError, Result};
use crate::interface::{Interface, InterfaceConfig, InterfaceStatus};
use crate::registry;
use crate::router::{BridgeRouterThread, Router};
use crate::thread::InterfaceThread;

/// A running set of interfaces and routers built from a [`BridgeConfig`].
///
/// Packets read by an interface are written to every router that routes it;
/// packets read by a router are written to each of its routed interfaces.
#[derive(Debug)]
pub struct Bridge {
    interfaces: BTreeMap<String, Arc<Interface>>,
    routers: BTreeMap<String, Router>,
    interface_threads: Vec<InterfaceThread>,
    router_threads: Vec<BridgeRouterThread>,
}

impl Bridge {
    /// Build every declared link. With `system`, interfaces identify what
    /// they read against its targets before routing.
    pub fn new(config: &BridgeConfig, system: Option<Arc<System>>) -> Result<Self> {
        let mut links = BTreeMap::new();
        for decl in config.routers() {
            let link = build_link(decl, InterfaceConfig::default(), None)?;
            links.insert(decl.name.clone(), Arc::new(link));
        }

        let interface_config = match &system {
            Some(system) => InterfaceConfig::default().with_target_names(&system.target_names()),
            None => InterfaceConfig::default(),
        };
        let mut interfaces = BTreeMap::new();
        for decl in config.interfaces() {
            let mut interface = build_link(decl, interface_config.clone(), system.clone())?;
            for router in config.routers() {
                if router.routes.contains(&decl.name) {
                    if let Some(link) = links.get(&router.name) {
                        interface.add_router(Arc::clone(link));
                    }
                }
            }
            interfaces.insert(decl.name.clone(), Arc::new(interface));
        }

        let mut routers = BTreeMap::new();
        for decl in config.routers() {
            let Some(link) = links.remove(&decl.name) else {
                continue;
            };
            let members = decl
                .routes
                .iter()
                .filter_map(|name| interfaces.get(name).cloned())
                .collect();
            routers.insert(decl.name.clone(), Router::new(link, members));
        }

        Ok(Self {
            interfaces,
            routers,
            interface_threads: Vec::new(),
            router_threads: Vec::new(),
        })
    }

    /// Start a thread for every interface and router marked to connect on
    /// startup.
    pub fn start(&mut self) -> Result<()> {
        let names: Vec<String> = self
            .interfaces
            .keys()
            .chain(self.routers.keys())
            .cloned()
            .collect();
        for name in names {
            if self.link(&name).is_some_and(|link| !link.config().connect_on_startup) {
                info!(interface = %name, "not connecting on startup");
                continue;
            }
            self.start_link(&name)?;
        }
        Ok(())
    }

    /// Start the thread for one interface or router by name.
    pub fn start_link(&mut self, name: &str) -> Result<()> {
        let name = name.to_ascii_uppercase();
        if let Some(router) = self.routers.get(&name) {
            if self.router_threads.iter().any(|t| t.interface().name() == name) {
                return Err(InterfaceError::AlreadyStarted(name));
            }
            let mut thread = BridgeRouterThread::new(router);
            thread.start()?;
            self.router_threads.push(thread);
        } else if let Some(interface) = self.interfaces.get(&name) {
            if self.interface_threads.iter().any(|t| t.interface().name() == name) {
                return Err(InterfaceError::AlreadyStarted(name));
            }
            let mut thread = InterfaceThread::new(Arc::clone(interface));
            thread.start()?;
            self.interface_threads.push(thread);
        } else {
            return Err(InterfaceError::UnknownInterface(name));
        }
        Ok(())
    }

    /// Stop every thread and wait for it to finish.
    pub fn shutdown(&mut self) {
        info!(
            interfaces = self.interface_threads.len(),
            routers = self.router_threads.len(),
            "Shutting down bridge"
        );
        for thread in &mut self.interface_threads {
            thread.stop();
        }
        for thread in &mut self.router_threads {
            thread.stop();
        }
        self.interface_threads.clear();
        self.router_threads.clear();
    }

    pub fn interface(&self, name: &str) -> Option<&Arc<Interface>> {
        self.interfaces.get(&name.to_ascii_uppercase())
    }

    pub fn router(&self, name: &str) -> Option<&Router> {
        self.routers.get(&name.to_ascii_uppercase())
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Arc<Interface>> {
        self.interfaces.values()
    }

    pub fn routers(&self) -> impl Iterator<Item = &Router> {
        self.routers.values()
    }

    /// Interfaces then routers, each sorted by name.
    pub fn statuses(&self) -> Vec<InterfaceStatus> {
        self.interfaces
            .values()
            .map(|interface| interface.status())
            .chain(self.routers.values().map(|router| router.link().status()))
            .collect()
    }

    fn link(&self, name: &str) -> Option<&Arc<Interface>> {
        self.interfaces
            .get(name)
            .or_else(|| self.routers.get(name).map(Router::link))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build one declared link; errors point at its declaring line.
fn build_link(decl: &LinkDecl, config: InterfaceConfig, system: Option<Arc<System>>) -> Result<Interface> {
    let located = |err: InterfaceError| -> InterfaceError {
        match err {
            InterfaceError::Config(err) => InterfaceError::Config(err),
            other => decl.line.error(other.to_string(), "").into(),
        }
    };

    let mut interface = registry::build(&decl.name, &decl.spec, &decl.options, config).map_err(located)?;
    if let Some(system) = system {
        interface.set_system(system);
    }
    for protocol in &decl.protocols {
        let created = linkprims_protocol::registry::create(&protocol.name, &protocol.args)
            .map_err(|err| located(err.into()))?;
        interface.add_protocol(protocol.kind, created);
    }
    if let Some(delay) = decl.reconnect_delay {
        interface.set_reconnect_delay(delay);
    }
    if let Some(params) = &decl.log_stream {
        warn!(interface = %decl.name, "raw stream logging is not supported; LOG_STREAM recorded only");
        interface.set_log_stream(params.clone());
    }
    Ok(interface)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use super::*;
    use crate::interface::ProtocolKind;

    const CONFIG: &str = r#"
VARIABLE device_port 0
VARIABLE ground_port 0
INTERFACE DEVICE_INT TCPIP_CLIENT_INTERFACE 127.0.0.1 <%= device_port %> <%= device_port %> 5.0 nil TERMINATED 0x0A 0x0A
  RECONNECT_DELAY 0.1
ROUTER GROUND_ROUTER TCPIP_CLIENT_INTERFACE 127.0.0.1 <%= ground_port %> <%= ground_port %> 5.0 nil TERMINATED 0x0A 0x0A
  ROUTE DEVICE_INT
  RECONNECT_DELAY 0.1
"#;

    fn config(device_port: u16, ground_port: u16) -> BridgeConfig {
        let overrides = HashMap::from([
            ("device_port".to_string(), device_port.to_string()),
            ("ground_port".to_string(), ground_port.to_string()),
        ]);
        BridgeConfig::parse(CONFIG, "bridge.txt", &overrides).unwrap()
    }

    fn read_line(stream: &mut TcpStream) -> Vec<u8> {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while !out.ends_with(b"\n") {
            let n = stream.read(&mut byte).unwrap();
            assert!(n > 0, "peer closed before a full line");
            out.push(byte[0]);
        }
        out
    }

    #[test]
    fn test_wiring() {
        let bridge = Bridge::new(&config(7001, 7002), None).unwrap();
        let device = bridge.interface("device_int").unwrap();
        assert_eq!(device.routers().len(), 1);
        assert_eq!(device.routers()[0].name(), "GROUND_ROUTER");
        assert_eq!(device.config().reconnect_delay, Duration::from_millis(100));
        assert_eq!(device.protocol_info()[0].kind, ProtocolKind::ReadWrite);

        let router = bridge.router("GROUND_ROUTER").unwrap();
        assert_eq!(router.members().len(), 1);
        assert_eq!(router.members()[0].name(), "DEVICE_INT");

        let names: Vec<String> = bridge.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["DEVICE_INT".to_string(), "GROUND_ROUTER".to_string()]);
    }

    #[test]
    fn test_build_error_points_at_line() {
        let text = "INTERFACE SER SERIAL /dev/null nil 9600 NONE 1 nil nil\n  OPTION DATA_BITS 9\n";
        let config = BridgeConfig::parse(text, "bridge.txt", &HashMap::new()).unwrap();
        match Bridge::new(&config, None) {
            Err(InterfaceError::Config(err)) => assert_eq!(err.line_number, 1),
            other => panic!("expected a located config error, got {other:?}"),
        }
    }

    #[test]
    fn test_bridge_forwards_both_ways() {
        let device_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ground_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config(
            device_listener.local_addr().unwrap().port(),
            ground_listener.local_addr().unwrap().port(),
        );

        let mut bridge = Bridge::new(&config, None).unwrap();
        bridge.start().unwrap();
        let (mut device, _) = device_listener.accept().unwrap();
        let (mut ground, _) = ground_listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        device.write_all(b"HELLO\n").unwrap();
        assert_eq!(read_line(&mut ground), b"HELLO\n");

        ground.write_all(b"CMD\n").unwrap();
        assert_eq!(read_line(&mut device), b"CMD\n");

        bridge.shutdown();
        let device_status = bridge.interface("DEVICE_INT").unwrap().status();
        assert_eq!(device_status.read_count, 1);
        assert_eq!(device_status.write_count, 1);
    }
}
