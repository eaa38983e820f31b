//! Command and telemetry framing, links and bridges for ground systems.
//!
//! linkprims turns raw byte streams (TCP, serial, MQTT, WebSocket) into
//! bit-exact command and telemetry packets and routes them between links.
//!
//! # Crate Structure
//!
//! - [`accessor`]: bit-level reads and writes of typed values
//! - [`packet`]: definition compiler, packet templates and identification
//! - [`stream`]: raw byte transports
//! - [`protocol`]: framing and transform protocols
//! - [`interface`]: interfaces, interface threads, routers and bridges

/// Re-export accessor types.
pub mod accessor {
    pub use linkprims_accessor::*;
}

/// Re-export packet definition types.
pub mod packet {
    pub use linkprims_packet::*;
}

/// Re-export stream types.
pub mod stream {
    pub use linkprims_stream::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use linkprims_protocol::*;
}

/// Re-export interface, router and bridge types.
pub mod interface {
    pub use linkprims_interface::*;
}
