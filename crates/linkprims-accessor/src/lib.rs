//! Bit-level field access for command and telemetry buffers.
//!
//! Every packet item is a view over a byte buffer described by:
//! - a bit offset (negative offsets count back from the end of the buffer)
//! - a bit size (non-positive sizes mean "rest of buffer" for STRING/BLOCK)
//! - a data type and a byte order
//!
//! Integers may start and end anywhere inside a byte. Little-endian bitfields
//! name the most significant bit of the field in the big-endian view of the
//! buffer, and the covered bytes are then taken in reverse.

pub mod accessor;
pub mod error;
pub mod types;

pub use accessor::BinaryAccessor;
pub use error::{AccessorError, Result};
pub use types::{DataType, Endianness, OverflowPolicy, Value};
