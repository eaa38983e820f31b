use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use linkprims_packet::Packet;

use crate::args::Args;
use crate::burst::{BurstCore, Reduced};
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol};

pub const STORED_FLAG_MASK: u8 = 0x80;
pub const EXTRA_FLAG_MASK: u8 = 0x40;

/// Header layout with a flags byte and optional JSON extra.
pub const MODE_FLAGS: u8 = 4;

/// Where the resumable header parse stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduction {
    Start,
    SyncRemoved,
    NeedExtra,
    FlagsRemoved,
    TimeRemoved,
    TargetNameRemoved,
    PacketNameRemoved,
}

#[derive(Debug)]
struct ReadState {
    reduction: Reduction,
    stored: bool,
    extra: Option<serde_json::Value>,
    received_time: Option<SystemTime>,
    target_name: String,
    packet_name: String,
}

impl Default for ReadState {
    fn default() -> Self {
        Self {
            reduction: Reduction::Start,
            stored: false,
            extra: None,
            received_time: None,
            target_name: String::new(),
            packet_name: String::new(),
        }
    }
}

/// Remove a big-endian count of `width` bytes and the run it counts.
/// `None` until both are buffered.
fn take_counted(data: &mut BytesMut, width: usize, max_length: Option<usize>) -> Result<Option<BytesMut>> {
    if data.len() < width {
        return Ok(None);
    }
    let length = match width {
        1 => data[0] as usize,
        4 => {
            let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if let Some(max) = max_length {
                if length > max {
                    return Err(ProtocolError::Framing(format!(
                        "Length value received larger than max_length: {length} > {max}"
                    )));
                }
            }
            length
        }
        other => {
            return Err(ProtocolError::Framing(format!(
                "Unsupported length field width {other}"
            )))
        }
    };
    if data.len() < width + length {
        return Ok(None);
    }
    data.advance(width);
    Ok(Some(data.split_to(length)))
}

impl ReadState {
    fn reduce(
        &mut self,
        data: &mut BytesMut,
        sync_len: usize,
        max_length: Option<usize>,
        mode: u8,
    ) -> Result<Reduced> {
        if self.reduction == Reduction::Start {
            if data.len() < sync_len {
                return Ok(Reduced::Stop);
            }
            data.advance(sync_len);
            self.reduction = Reduction::SyncRemoved;
        }

        if self.reduction == Reduction::SyncRemoved && mode == MODE_FLAGS {
            if data.is_empty() {
                return Ok(Reduced::Stop);
            }
            let flags = data.get_u8();
            self.stored = flags & STORED_FLAG_MASK != 0;
            self.extra = None;
            self.reduction = if flags & EXTRA_FLAG_MASK != 0 {
                Reduction::NeedExtra
            } else {
                Reduction::FlagsRemoved
            };
        }

        if self.reduction == Reduction::NeedExtra {
            let Some(extra) = take_counted(data, 4, max_length)? else {
                return Ok(Reduced::Stop);
            };
            self.extra = Some(serde_json::from_slice(&extra)?);
            self.reduction = Reduction::FlagsRemoved;
        }

        if self.reduction == Reduction::FlagsRemoved
            || (self.reduction == Reduction::SyncRemoved && mode != MODE_FLAGS)
        {
            if data.len() < 8 {
                return Ok(Reduced::Stop);
            }
            let seconds = data.get_u32();
            let microseconds = data.get_u32();
            self.received_time = Some(
                UNIX_EPOCH + Duration::from_secs(seconds as u64) + Duration::from_micros(microseconds as u64),
            );
            self.reduction = Reduction::TimeRemoved;
        }

        if self.reduction == Reduction::TimeRemoved {
            let Some(name) = take_counted(data, 1, None)? else {
                return Ok(Reduced::Stop);
            };
            self.target_name = String::from_utf8_lossy(&name).into_owned();
            self.reduction = Reduction::TargetNameRemoved;
        }

        if self.reduction == Reduction::TargetNameRemoved {
            let Some(name) = take_counted(data, 1, None)? else {
                return Ok(Reduced::Stop);
            };
            self.packet_name = String::from_utf8_lossy(&name).into_owned();
            self.reduction = Reduction::PacketNameRemoved;
        }

        let Some(packet_data) = take_counted(data, 4, max_length)? else {
            return Ok(Reduced::Stop);
        };
        self.reduction = Reduction::Start;
        Ok(Reduced::Frame(packet_data))
    }
}

/// Header fields captured from the outgoing packet for `write_data`.
#[derive(Debug, Default)]
struct WriteHeader {
    flags: u8,
    extra: Option<String>,
    seconds: u32,
    microseconds: u32,
    target_name: String,
    packet_name: String,
}

/// Carries packet identity, timing and metadata alongside the packet bytes
/// so another node can rebuild the packet without identifying it:
///
/// ```text
/// [sync] flags:u8 [extra_len:u32 extra_json] secs:u32 usecs:u32
/// tgt_len:u8 tgt pkt_len:u8 pkt data_len:u32 data
/// ```
#[derive(Debug)]
pub struct PreidentifiedProtocol {
    core: BurstCore,
    max_length: Option<usize>,
    mode: u8,
    read: ReadState,
    write: WriteHeader,
}

impl PreidentifiedProtocol {
    pub fn new(
        sync_pattern: Option<Vec<u8>>,
        max_length: Option<usize>,
        mode: u8,
        allow_empty_data: Option<bool>,
    ) -> Self {
        Self {
            core: BurstCore::new(0, sync_pattern, false, allow_empty_data),
            max_length,
            mode,
            read: ReadState::default(),
            write: WriteHeader::default(),
        }
    }

    /// `sync_pattern max_length mode allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("PREIDENTIFIED", values, 4)?;
        let max_length = match args.opt_int(1, "max_length")? {
            None => None,
            Some(value) => Some(usize::try_from(value).map_err(|_| {
                ProtocolError::invalid("PREIDENTIFIED", format!("invalid max_length {value}"))
            })?),
        };
        let mode = args.int(2, "mode", MODE_FLAGS as i64)?;
        let mode = u8::try_from(mode).map_err(|_| {
            ProtocolError::invalid("PREIDENTIFIED", format!("invalid mode {mode}"))
        })?;
        Ok(Self::new(
            args.hex(0, "sync_pattern")?,
            max_length,
            mode,
            args.opt_flag(3, "allow_empty_data")?,
        ))
    }
}

impl Protocol for PreidentifiedProtocol {
    fn name(&self) -> &'static str {
        "PREIDENTIFIED"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        let sync_len = self.core.sync_pattern.as_ref().map_or(0, Vec::len);
        let (max_length, mode) = (self.max_length, self.mode);
        let state = &mut self.read;
        self.core.read(data, at_tail, |buffer, _| {
            state.reduce(buffer, sync_len, max_length, mode)
        })
    }

    fn read_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        packet.received_time = self.read.received_time;
        packet.target_name = Some(self.read.target_name.clone());
        packet.packet_name = Some(self.read.packet_name.clone());
        if self.mode == MODE_FLAGS {
            packet.stored = self.read.stored;
            packet.extra = match (packet.extra.take(), self.read.extra.clone()) {
                (Some(serde_json::Value::Object(mut existing)), Some(serde_json::Value::Object(read))) => {
                    existing.extend(read);
                    Some(serde_json::Value::Object(existing))
                }
                (_, read) => read,
            };
        }
        Ok(Outcome::Ready(packet))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<Outcome<Packet>> {
        let since_epoch = packet
            .received_time
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut header = WriteHeader {
            seconds: since_epoch.as_secs() as u32,
            microseconds: since_epoch.subsec_micros(),
            target_name: packet
                .target_name
                .clone()
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            packet_name: packet
                .packet_name
                .clone()
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            ..WriteHeader::default()
        };
        if self.mode == MODE_FLAGS {
            if packet.stored {
                header.flags |= STORED_FLAG_MASK;
            }
            if let Some(extra) = &packet.extra {
                header.flags |= EXTRA_FLAG_MASK;
                header.extra = Some(serde_json::to_string(extra)?);
            }
        }
        for name in [&header.target_name, &header.packet_name] {
            if name.len() > u8::MAX as usize {
                return Err(ProtocolError::Write(format!(
                    "name {name} longer than {} bytes",
                    u8::MAX
                )));
            }
        }
        self.write = header;
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        let header = &self.write;
        let mut out = BytesMut::with_capacity(data.len() + 32);
        if let Some(sync) = &self.core.sync_pattern {
            out.put_slice(sync);
        }
        if self.mode == MODE_FLAGS {
            out.put_u8(header.flags);
            if let Some(extra) = &header.extra {
                out.put_u32(extra.len() as u32);
                out.put_slice(extra.as_bytes());
            }
        }
        out.put_u32(header.seconds);
        out.put_u32(header.microseconds);
        out.put_u8(header.target_name.len() as u8);
        out.put_slice(header.target_name.as_bytes());
        out.put_u8(header.packet_name.len() as u8);
        out.put_slice(header.packet_name.as_bytes());
        out.put_u32(data.len() as u32);
        out.put_slice(&data);
        Ok(Outcome::Ready(out.to_vec()))
    }

    fn reset(&mut self) {
        self.core.reset();
        self.read.reduction = Reduction::Start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(protocol: &mut PreidentifiedProtocol, packet: Packet) -> Vec<u8> {
        let data = packet.buffer.clone();
        let Outcome::Ready(_) = protocol.write_packet(packet).unwrap() else {
            panic!("expected a packet");
        };
        let Outcome::Ready(wire) = protocol.write_data(data).unwrap() else {
            panic!("expected data");
        };
        wire
    }

    #[test]
    fn test_header_layout() {
        let mut protocol = PreidentifiedProtocol::new(None, None, MODE_FLAGS, None);
        let mut packet = Packet::raw(vec![0xAA, 0xBB]);
        packet.target_name = Some("INST".to_string());
        packet.packet_name = Some("HS".to_string());
        packet.received_time = Some(UNIX_EPOCH + Duration::new(0x0102_0304, 5_000));
        packet.stored = true;

        let wire = written(&mut protocol, packet);
        let mut expected = vec![0x80, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x05, 4];
        expected.extend_from_slice(b"INST");
        expected.push(2);
        expected.extend_from_slice(b"HS");
        expected.extend_from_slice(&[0, 0, 0, 2, 0xAA, 0xBB]);
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_split_reads_resume_the_header_parse() {
        let sync = vec![0x1A, 0xCF, 0xFC, 0x1D];
        let mut writer = PreidentifiedProtocol::new(Some(sync.clone()), None, MODE_FLAGS, None);
        let mut packet = Packet::raw(vec![1, 2, 3]);
        packet.target_name = Some("INST".to_string());
        packet.packet_name = Some("ADCS".to_string());
        packet.extra = Some(serde_json::json!({"vcid": 3}));
        let wire = written(&mut writer, packet);

        let mut reader = PreidentifiedProtocol::new(Some(sync), Some(1024), MODE_FLAGS, None);
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            match reader.read_data(BytesMut::from(chunk), true).unwrap() {
                Outcome::Ready(frame) => frames.push(frame),
                Outcome::Stop => {}
                Outcome::Disconnect => panic!("unexpected disconnect"),
            }
        }
        assert_eq!(frames, vec![BytesMut::from(&[1, 2, 3][..])]);

        let Outcome::Ready(packet) = reader.read_packet(Packet::raw(vec![1, 2, 3])).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!(packet.target_name.as_deref(), Some("INST"));
        assert_eq!(packet.packet_name.as_deref(), Some("ADCS"));
        assert!(!packet.stored);
        assert_eq!(packet.extra, Some(serde_json::json!({"vcid": 3})));
        assert!(packet.received_time.is_some());
    }

    #[test]
    fn test_legacy_mode_has_no_flags() {
        let mut protocol = PreidentifiedProtocol::new(None, None, 0, None);
        let mut packet = Packet::raw(vec![9]);
        packet.stored = true;
        let wire = written(&mut protocol, packet);
        // secs, usecs, "UNKNOWN" twice, length, data
        assert_eq!(wire.len(), 8 + 1 + 7 + 1 + 7 + 4 + 1);

        assert_eq!(
            protocol.read_data(BytesMut::from(&wire[..]), true).unwrap(),
            Outcome::Ready(BytesMut::from(&[9][..]))
        );
    }

    #[test]
    fn test_max_length_enforced() {
        let mut protocol = PreidentifiedProtocol::new(None, Some(2), MODE_FLAGS, None);
        let mut wire = vec![0x00, 0, 0, 0, 0, 0, 0, 0, 0, 1, b'A', 1, b'B'];
        wire.extend_from_slice(&[0, 0, 0, 3, 1, 2, 3]);
        let err = protocol
            .read_data(BytesMut::from(&wire[..]), true)
            .unwrap_err();
        assert_eq!(err.to_string(), "Length value received larger than max_length: 3 > 2");
    }
}
