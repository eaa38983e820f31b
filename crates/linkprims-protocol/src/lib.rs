//! Framing and transform protocols layered over raw link streams.
//!
//! An interface owns a read chain and a write chain of [`Protocol`]s. Bytes
//! from the stream pass through each read protocol in order; every step
//! answers with an [`Outcome`]:
//! - `Ready(frame)` to hand a frame to the next protocol
//! - `Stop` to wait for more bytes
//! - `Disconnect` when the link cannot continue
//!
//! Framing protocols share one buffering core that handles sync patterns and
//! leading-byte removal. [`registry::create`] builds protocols by name from
//! config-line arguments.
//!
//! A protocol that sends commands and expects an answer offers a
//! [`ResponseWait`]; the interface blocks the write on it until the read side
//! delivers the response.

mod args;
mod burst;
pub mod crc;
pub mod encryption;
pub mod error;
pub mod fixed;
pub mod length;
pub mod preidentified;
pub mod protocol;
pub mod registry;
pub mod slip;
pub mod template;
pub mod terminated;

pub use burst::BurstProtocol;
pub use crc::{BadCrcStrategy, Crc, CrcProtocol};
pub use encryption::EncryptionProtocol;
pub use error::{ProtocolError, Result};
pub use fixed::FixedProtocol;
pub use length::{LengthField, LengthProtocol};
pub use preidentified::PreidentifiedProtocol;
pub use protocol::{pass_empty, LinkInfo, Outcome, Protocol, ResponseWait};
pub use slip::{SlipChars, SlipProtocol};
pub use template::{TemplateOptions, TemplateProtocol};
pub use terminated::TerminatedProtocol;
