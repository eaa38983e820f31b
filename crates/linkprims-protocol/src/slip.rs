use bytes::{BufMut, BytesMut};

use crate::args::Args;
use crate::burst::{BurstCore, Reduced};
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol};

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Framing characters; defaults follow RFC 1055.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlipChars {
    pub start: Option<u8>,
    pub end: u8,
    pub esc: u8,
    pub esc_end: u8,
    pub esc_esc: u8,
}

impl Default for SlipChars {
    fn default() -> Self {
        Self {
            start: None,
            end: SLIP_END,
            esc: SLIP_ESC,
            esc_end: SLIP_ESC_END,
            esc_esc: SLIP_ESC_ESC,
        }
    }
}

/// Serial Line IP framing.
#[derive(Debug)]
pub struct SlipProtocol {
    core: BurstCore,
    chars: SlipChars,
    read_strip_characters: bool,
    read_enable_escaping: bool,
    write_enable_escaping: bool,
}

impl SlipProtocol {
    pub fn new(
        chars: SlipChars,
        read_strip_characters: bool,
        read_enable_escaping: bool,
        write_enable_escaping: bool,
        allow_empty_data: Option<bool>,
    ) -> Self {
        // A start character doubles as the sync pattern.
        let sync_pattern = chars.start.map(|start| vec![start]);
        Self {
            core: BurstCore::new(0, sync_pattern, false, allow_empty_data),
            chars,
            read_strip_characters,
            read_enable_escaping,
            write_enable_escaping,
        }
    }

    /// `start_char read_strip_characters read_enable_escaping
    /// write_enable_escaping end_char esc_char esc_end_char esc_esc_char
    /// allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("SLIP", values, 9)?;
        let byte = |index: usize, what: &str, default: u8| -> Result<u8> {
            match args.opt_int(index, what)? {
                None => Ok(default),
                Some(value) => u8::try_from(value).map_err(|_| {
                    ProtocolError::invalid("SLIP", format!("invalid value {value} for {what}"))
                }),
            }
        };
        let start = match args.opt_int(0, "start_char")? {
            None => None,
            Some(value) => Some(u8::try_from(value).map_err(|_| {
                ProtocolError::invalid("SLIP", format!("invalid value {value} for start_char"))
            })?),
        };
        let chars = SlipChars {
            start,
            end: byte(4, "end_char", SLIP_END)?,
            esc: byte(5, "esc_char", SLIP_ESC)?,
            esc_end: byte(6, "esc_end_char", SLIP_ESC_END)?,
            esc_esc: byte(7, "esc_esc_char", SLIP_ESC_ESC)?,
        };
        Ok(Self::new(
            chars,
            args.flag(1, "read_strip_characters", true)?,
            args.flag(2, "read_enable_escaping", true)?,
            args.flag(3, "write_enable_escaping", true)?,
            args.opt_flag(8, "allow_empty_data")?,
        ))
    }

    fn unescape(&self, data: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(data.len());
        let mut bytes = data.iter().copied().peekable();
        while let Some(byte) = bytes.next() {
            if byte == self.chars.esc {
                match bytes.peek().copied() {
                    Some(next) if next == self.chars.esc_end => {
                        bytes.next();
                        out.put_u8(self.chars.end);
                        continue;
                    }
                    Some(next) if next == self.chars.esc_esc => {
                        bytes.next();
                        out.put_u8(self.chars.esc);
                        continue;
                    }
                    _ => {}
                }
            }
            out.put_u8(byte);
        }
        out
    }

    fn escape(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2);
        for &byte in data {
            if byte == self.chars.esc {
                out.extend_from_slice(&[self.chars.esc, self.chars.esc_esc]);
            } else if byte == self.chars.end {
                out.extend_from_slice(&[self.chars.esc, self.chars.esc_end]);
            } else {
                out.push(byte);
            }
        }
        out
    }
}

fn reduce_slip(data: &mut BytesMut, end: u8, has_start: bool) -> Reduced {
    if data.is_empty() {
        return Reduced::Stop;
    }
    // The start character sits at index 0 once synced; it may equal `end`.
    let from = usize::from(has_start);
    match data.iter().skip(from).position(|b| *b == end) {
        Some(index) => Reduced::Frame(data.split_to(from + index + 1)),
        None => Reduced::Stop,
    }
}

impl Protocol for SlipProtocol {
    fn name(&self) -> &'static str {
        "SLIP"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        let end = self.chars.end;
        let has_start = self.chars.start.is_some();
        let outcome = self
            .core
            .read(data, at_tail, |buffer, _| Ok(reduce_slip(buffer, end, has_start)))?;
        let Outcome::Ready(mut frame) = outcome else {
            return Ok(outcome);
        };
        if frame.is_empty() {
            return Ok(Outcome::Ready(frame));
        }

        if self.read_strip_characters {
            if has_start {
                let _ = frame.split_to(1);
            }
            frame.truncate(frame.len().saturating_sub(1));
        }
        if self.read_enable_escaping {
            frame = self.unescape(&frame);
        }
        Ok(Outcome::Ready(frame))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        let body = if self.write_enable_escaping {
            self.escape(&data)
        } else {
            data
        };
        let mut framed = Vec::with_capacity(body.len() + 2);
        if let Some(start) = self.chars.start {
            framed.push(start);
        }
        framed.extend_from_slice(&body);
        framed.push(self.chars.end);
        Ok(Outcome::Ready(framed))
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}
