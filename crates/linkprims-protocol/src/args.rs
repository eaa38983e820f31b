use std::time::Duration;

use linkprims_packet::parser::{handle_none, handle_true_false, hex_to_bytes, parse_int};

use crate::error::{ProtocolError, Result};

/// Positional constructor arguments from a config line.
pub(crate) struct Args<'a> {
    protocol: &'static str,
    values: &'a [String],
}

impl<'a> Args<'a> {
    pub(crate) fn new(protocol: &'static str, values: &'a [String], max: usize) -> Result<Self> {
        if values.len() > max {
            return Err(ProtocolError::invalid(
                protocol,
                format!("expected at most {max} arguments, got {}", values.len()),
            ));
        }
        Ok(Self { protocol, values })
    }

    /// The argument at `index`, `None` when absent or spelled as none.
    pub(crate) fn get(&self, index: usize) -> Option<&'a str> {
        self.values.get(index).and_then(|v| handle_none(v))
    }

    /// Whether a value, none included, was written at `index`.
    pub(crate) fn given(&self, index: usize) -> bool {
        index < self.values.len()
    }

    pub(crate) fn required(&self, index: usize, what: &str) -> Result<&'a str> {
        self.get(index)
            .ok_or_else(|| ProtocolError::invalid(self.protocol, format!("{what} is required")))
    }

    pub(crate) fn opt_int(&self, index: usize, what: &str) -> Result<Option<i128>> {
        match self.get(index) {
            None => Ok(None),
            Some(value) => parse_int(value).map(Some).ok_or_else(|| {
                ProtocolError::invalid(self.protocol, format!("invalid {what} {value}, must be a number"))
            }),
        }
    }

    pub(crate) fn int(&self, index: usize, what: &str, default: i64) -> Result<i64> {
        match self.opt_int(index, what)? {
            None => Ok(default),
            Some(value) => i64::try_from(value).map_err(|_| {
                ProtocolError::invalid(self.protocol, format!("{what} {value} is out of range"))
            }),
        }
    }

    pub(crate) fn size(&self, index: usize, what: &str, default: usize) -> Result<usize> {
        match self.opt_int(index, what)? {
            None => Ok(default),
            Some(value) => usize::try_from(value).map_err(|_| {
                ProtocolError::invalid(self.protocol, format!("{what} {value} must not be negative"))
            }),
        }
    }

    pub(crate) fn opt_flag(&self, index: usize, what: &str) -> Result<Option<bool>> {
        match self.get(index) {
            None => Ok(None),
            Some(value) => handle_true_false(value).map(Some).ok_or_else(|| {
                ProtocolError::invalid(
                    self.protocol,
                    format!("invalid {what} '{value}', must be TRUE or FALSE"),
                )
            }),
        }
    }

    pub(crate) fn flag(&self, index: usize, what: &str, default: bool) -> Result<bool> {
        Ok(self.opt_flag(index, what)?.unwrap_or(default))
    }

    pub(crate) fn hex(&self, index: usize, what: &str) -> Result<Option<Vec<u8>>> {
        match self.get(index) {
            None => Ok(None),
            Some(value) => hex_to_bytes(value).map(Some).ok_or_else(|| {
                ProtocolError::invalid(self.protocol, format!("invalid {what} {value}, must be hex"))
            }),
        }
    }

    /// Seconds as a float, e.g. `0.02`.
    pub(crate) fn seconds(&self, index: usize, what: &str) -> Result<Option<Duration>> {
        match self.get(index) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map(Some)
                .ok_or_else(|| {
                    ProtocolError::invalid(
                        self.protocol,
                        format!("invalid {what} {value}, must be a non-negative number of seconds"),
                    )
                }),
        }
    }
}
