use bytes::BytesMut;
use linkprims_packet::Packet;

use crate::args::Args;
use crate::burst::{BurstCore, Reduced};
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol};

/// Frames delimited by a terminator sequence.
#[derive(Debug)]
pub struct TerminatedProtocol {
    core: BurstCore,
    write_termination: Vec<u8>,
    read_termination: Vec<u8>,
    strip_read_termination: bool,
}

impl TerminatedProtocol {
    pub fn new(
        write_termination: Vec<u8>,
        read_termination: Vec<u8>,
        strip_read_termination: bool,
        discard_leading_bytes: usize,
        sync_pattern: Option<Vec<u8>>,
        fill_fields: bool,
        allow_empty_data: Option<bool>,
    ) -> Result<Self> {
        if read_termination.is_empty() {
            return Err(ProtocolError::invalid(
                "TERMINATED",
                "read_termination_characters must not be empty",
            ));
        }
        Ok(Self {
            core: BurstCore::new(discard_leading_bytes, sync_pattern, fill_fields, allow_empty_data),
            write_termination,
            read_termination,
            strip_read_termination,
        })
    }

    /// `write_termination_characters read_termination_characters
    /// strip_read_termination discard_leading_bytes sync_pattern fill_fields
    /// allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("TERMINATED", values, 7)?;
        Self::new(
            args.hex(0, "write_termination_characters")?.unwrap_or_default(),
            args.hex(1, "read_termination_characters")?.unwrap_or_default(),
            args.flag(2, "strip_read_termination", true)?,
            args.size(3, "discard_leading_bytes", 0)?,
            args.hex(4, "sync_pattern")?,
            args.flag(5, "fill_fields", false)?,
            args.opt_flag(6, "allow_empty_data")?,
        )
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn reduce_terminated(data: &mut BytesMut, termination: &[u8], strip: bool) -> Reduced {
    let Some(index) = find(data, termination) else {
        return Reduced::Stop;
    };
    let mut frame = data.split_to(index + termination.len());
    if strip {
        frame.truncate(index);
    }
    Reduced::Frame(frame)
}

impl Protocol for TerminatedProtocol {
    fn name(&self) -> &'static str {
        "TERMINATED"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        let termination = &self.read_termination;
        let strip = self.strip_read_termination;
        self.core.read(data, at_tail, |buffer, _| {
            Ok(reduce_terminated(buffer, termination, strip))
        })
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        self.core.write_packet(&mut packet)?;
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        if find(&data, &self.write_termination).is_some() {
            return Err(ProtocolError::Write(
                "Packet contains termination characters!".to_string(),
            ));
        }
        let mut data = self.core.write_data(data)?;
        data.extend_from_slice(&self.write_termination);
        Ok(Outcome::Ready(data))
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}
