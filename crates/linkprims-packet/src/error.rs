use std::fmt;
use std::path::PathBuf;

use linkprims_accessor::AccessorError;

use crate::packet::PacketKind;

/// A definition error pinned to the config line that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    pub message: String,
    pub filename: String,
    pub line_number: usize,
    pub line: String,
    pub usage: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.filename, self.line_number, self.message)?;
        if !self.line.is_empty() {
            write!(f, "\n  {}", self.line)?;
        }
        if !self.usage.is_empty() {
            write!(f, "\nUsage: {}", self.usage)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

/// Errors raised while compiling or using packet definitions.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Accessor(#[from] AccessorError),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("{kind} target '{target}' does not exist")]
    UnknownTarget { kind: PacketKind, target: String },

    #[error("{kind} packet '{target} {packet}' does not exist")]
    UnknownPacket {
        kind: PacketKind,
        target: String,
        packet: String,
    },

    /// Item access on a packet that was never identified.
    #[error("packet {0} has no definition")]
    Undefined(String),

    #[error("Can't append an item after a variably sized item")]
    AppendAfterVariable,

    /// Two items claim the same bits without OVERLAP or IGNORE_OVERLAP.
    #[error("{0}")]
    Overlap(String),

    #[error("Target folder must exist '{}'", .0.display())]
    TargetNotFound(PathBuf),

    /// Every definition file of a target that failed to compile.
    #[error("{}", .errors.join("\n"))]
    Definition { target: String, errors: Vec<String> },

    #[error("definition file too large ({size} bytes, max {max}): {}", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("definition I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PacketError>;
