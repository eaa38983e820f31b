use std::sync::Arc;

use linkprims_packet::Packet;
use tracing::{debug, error};

use crate::error::Result;
use crate::interface::Interface;
use crate::thread::{InterfaceThread, PacketHandler};

/// A link whose incoming packets fan out to member interfaces.
///
/// The router's own [`Interface`] is its connection (typically a TCP server
/// that ground software attaches to). Members are the interfaces named by
/// `ROUTE`; each member also lists the router link among its routers, so
/// traffic flows both ways.
#[derive(Debug, Clone)]
pub struct Router {
    link: Arc<Interface>,
    members: Vec<Arc<Interface>>,
}

impl Router {
    pub fn new(link: Arc<Interface>, members: Vec<Arc<Interface>>) -> Self {
        Self { link, members }
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn link(&self) -> &Arc<Interface> {
        &self.link
    }

    pub fn members(&self) -> &[Arc<Interface>] {
        &self.members
    }

    /// Write `packet` to every connected, writable member. Returns how many
    /// members took it.
    pub fn route(&self, packet: &Packet) -> usize {
        deliver(self.name(), &self.members, packet)
    }
}

/// Per-member failures are logged and never stop delivery to the others.
fn deliver(router: &str, members: &[Arc<Interface>], packet: &Packet) -> usize {
    let mut delivered = 0;
    for member in members {
        if !member.config().write_allowed || !member.connected() {
            debug!(router, interface = %member.name(), "skipping unavailable interface");
            continue;
        }
        match member.write(packet.clone()) {
            Ok(()) => delivered += 1,
            Err(err) => error!(
                router,
                interface = %member.name(),
                error = %err,
                "Problem writing to interface"
            ),
        }
    }
    delivered
}

struct RouteToMembers {
    members: Vec<Arc<Interface>>,
}

impl PacketHandler for RouteToMembers {
    fn handle(&mut self, link: &Interface, packet: Packet) {
        deliver(link.name(), &self.members, &packet);
    }
}

/// Interface thread for a router's link: every packet read from the link is
/// written to the router's members.
#[derive(Debug)]
pub struct BridgeRouterThread {
    thread: InterfaceThread,
}

impl BridgeRouterThread {
    pub fn new(router: &Router) -> Self {
        let handler = RouteToMembers {
            members: router.members.clone(),
        };
        Self {
            thread: InterfaceThread::with_handler(Arc::clone(&router.link), handler),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.thread.start()
    }

    pub fn stop(&mut self) {
        self.thread.stop();
    }

    pub fn is_alive(&self) -> bool {
        self.thread.is_alive()
    }

    pub fn interface(&self) -> &Arc<Interface> {
        self.thread.interface()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::interface::InterfaceConfig;
    use crate::test_support::{wait_for, Script, ScriptedStream};

    fn member(name: &str) -> (Arc<Interface>, Arc<Script>) {
        let (stream, script) = ScriptedStream::new();
        let interface = Interface::new(name, stream, InterfaceConfig::default());
        interface.connect().unwrap();
        (Arc::new(interface), script)
    }

    #[test]
    fn test_fan_out_survives_failing_member() {
        let (a, script_a) = member("A");
        let (b, script_b) = member("B");
        let (c, script_c) = member("C");
        script_b.fail_writes();

        let (link_stream, _) = ScriptedStream::new();
        let link = Arc::new(Interface::new("ROUTER", link_stream, InterfaceConfig::default()));
        let router = Router::new(link, vec![a, Arc::clone(&b), c]);

        assert_eq!(router.route(&Packet::raw(b"CMD".to_vec())), 2);
        assert_eq!(script_a.written(), vec![b"CMD".to_vec()]);
        assert_eq!(script_c.written(), vec![b"CMD".to_vec()]);
        assert!(script_b.written().is_empty());
        // The failed member was disconnected and is now skipped.
        assert!(!b.connected());
        assert_eq!(router.route(&Packet::raw(b"CMD".to_vec())), 2);
    }

    #[test]
    fn test_skips_read_only_members() {
        let (stream, script) = ScriptedStream::new();
        let config = InterfaceConfig::default().with_write_allowed(false);
        let read_only = Interface::new("RO", stream, config);
        read_only.connect().unwrap();

        let (link_stream, _) = ScriptedStream::new();
        let link = Arc::new(Interface::new("ROUTER", link_stream, InterfaceConfig::default()));
        let router = Router::new(link, vec![Arc::new(read_only)]);
        assert_eq!(router.route(&Packet::raw(b"CMD".to_vec())), 0);
        assert!(script.written().is_empty());
    }

    #[test]
    fn test_router_thread_forwards_link_packets() {
        let (a, script_a) = member("A");
        let (link_stream, link_script) = ScriptedStream::new();
        link_script.push_read(b"NOOP");
        let config = InterfaceConfig::default().with_reconnect_delay(Duration::from_millis(10));
        let link = Arc::new(Interface::new("ROUTER", link_stream, config));
        let router = Router::new(link, vec![a]);

        let mut thread = BridgeRouterThread::new(&router);
        thread.start().unwrap();
        assert!(wait_for(|| script_a.written().len() == 1));
        thread.stop();
        assert!(!thread.is_alive());
        assert_eq!(script_a.written(), vec![b"NOOP".to_vec()]);
    }
}
