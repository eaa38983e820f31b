//! Interfaces, interface threads, routers and bridges.
//!
//! An [`Interface`] pairs a [`linkprims_stream::Stream`] with read and write
//! protocol chains. An [`InterfaceThread`] keeps one interface connected,
//! reading packets and handing them to a [`PacketHandler`]; the default
//! handler identifies each packet and writes it to the interface's routers.
//!
//! A [`Bridge`] is built from a [`BridgeConfig`] file:
//!
//! ```text
//! INTERFACE INST_INT TCPIP_CLIENT_INTERFACE localhost 8080 8080 10.0 nil BURST
//! ROUTER INST_ROUTER TCPIP_SERVER_INTERFACE 2950 2950 10.0 nil BURST
//!   ROUTE INST_INT
//! ```

pub mod bridge;
pub mod bridge_config;
pub mod error;
pub mod instrumentation;
pub mod interface;
pub mod registry;
pub mod router;
pub mod sleeper;
pub mod thread;

#[cfg(test)]
mod test_support;

pub use bridge::Bridge;
pub use bridge_config::{BridgeConfig, LinkDecl, ProtocolDecl};
pub use error::{InterfaceError, Result};
pub use instrumentation::{instrument_line, ScriptInstrumentation};
pub use interface::{
    Interface, InterfaceConfig, InterfaceState, InterfaceStatus, ProtocolInfo, ProtocolKind,
    SharedProtocol,
};
pub use registry::{InterfaceSpec, LinkSpec};
pub use router::{BridgeRouterThread, Router};
pub use sleeper::Sleeper;
pub use thread::{identify_packet, IdentifyAndRoute, InterfaceThread, PacketHandler};
