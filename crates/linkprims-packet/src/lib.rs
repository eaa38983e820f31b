//! Command and telemetry definitions.
//!
//! Target directories hold line-oriented definition files:
//!
//! ```text
//! TELEMETRY INST HEALTH_STATUS BIG_ENDIAN "Health and status"
//!   APPEND_ID_ITEM CCSDSAPID 16 UINT 1 "Packet id"
//!   APPEND_ITEM    TEMP1     16 INT     "Temperature #1"
//!     UNITS Celsius C
//! ```
//!
//! [`PacketConfig`] compiles them into immutable [`PacketDef`] templates,
//! [`Target`] resolves which files belong to a target, and [`System`] holds the
//! process-wide lookup tables used to identify raw bytes.

pub mod error;
pub mod item;
pub mod packet;
pub mod packet_config;
pub mod parser;
pub mod system;
pub mod target;

pub use error::{ConfigError, PacketError, Result};
pub use item::{Item, ItemState};
pub use packet::{Packet, PacketDef, PacketKind};
pub use packet_config::{PacketConfig, PacketTable, TargetPackets};
pub use parser::{ConfigLine, ConfigParser};
pub use system::{System, SystemConfig};
pub use target::Target;

pub use linkprims_accessor::{DataType, Endianness, OverflowPolicy, Value};
