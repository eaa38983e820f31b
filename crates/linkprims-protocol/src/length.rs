use bytes::BytesMut;
use linkprims_accessor::{BinaryAccessor, DataType, Endianness, OverflowPolicy, Value};
use linkprims_packet::Packet;

use crate::args::Args;
use crate::burst::{BurstCore, Reduced};
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol};

/// Length field layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthField {
    pub bit_offset: i64,
    pub bit_size: i64,
    /// Added to `value * bytes_per_count` to get the full frame length,
    /// discarded leading bytes included.
    pub value_offset: i64,
    pub bytes_per_count: i64,
    pub endianness: Endianness,
    pub max_length: Option<i64>,
}

impl Default for LengthField {
    fn default() -> Self {
        Self {
            bit_offset: 0,
            bit_size: 16,
            value_offset: 0,
            bytes_per_count: 1,
            endianness: Endianness::Big,
            max_length: None,
        }
    }
}

impl LengthField {
    /// Bytes that must be buffered before the field can be read.
    fn bytes_needed(&self) -> usize {
        if self.endianness == Endianness::Big || self.bit_offset % 8 == 0 {
            ((self.bit_offset + self.bit_size) as usize).div_ceil(8)
        } else {
            (self.bit_offset / 8) as usize + 1
        }
    }

    /// Length value to store for a frame of `buffer_length` bytes.
    fn calculate(&self, buffer_length: usize) -> Result<i64> {
        let length = buffer_length as i64 / self.bytes_per_count - self.value_offset;
        if let Some(max) = self.max_length {
            if length > max {
                return Err(ProtocolError::Write(format!(
                    "Calculated length {length} larger than max_length {max}"
                )));
            }
        }
        Ok(length)
    }

    fn write(&self, length: i64, bit_offset: i64, buffer: &mut Vec<u8>) -> Result<()> {
        BinaryAccessor::write(
            &Value::Int(length as i128),
            bit_offset,
            self.bit_size,
            DataType::Uint,
            buffer,
            self.endianness,
            OverflowPolicy::Error,
        )?;
        Ok(())
    }

    fn reduce(&self, data: &mut BytesMut) -> Result<Reduced> {
        if data.len() < self.bytes_needed() {
            return Ok(Reduced::Stop);
        }
        let length = BinaryAccessor::read(
            self.bit_offset,
            self.bit_size,
            DataType::Uint,
            data,
            self.endianness,
        )?
        .as_int()
        .unwrap_or_default();
        if let Some(max) = self.max_length {
            if length > max as i128 {
                return Err(ProtocolError::Framing(format!(
                    "Length value received larger than max_length= {length} > {max}"
                )));
            }
        }

        let packet_length = length * self.bytes_per_count as i128 + self.value_offset as i128;
        if packet_length * 8 < (self.bit_offset + self.bit_size) as i128 {
            return Err(ProtocolError::Framing(format!(
                "Calculated packet length of {} bits < (offset={} + size={})",
                packet_length * 8,
                self.bit_offset,
                self.bit_size
            )));
        }
        let packet_length = usize::try_from(packet_length).map_err(|_| {
            ProtocolError::Framing(format!(
                "Calculated packet length of {packet_length} bytes is too large"
            ))
        })?;
        if data.len() < packet_length {
            return Ok(Reduced::Stop);
        }
        Ok(Reduced::Frame(data.split_to(packet_length)))
    }
}

/// Frames delimited by a length field at a fixed position in each frame.
#[derive(Debug)]
pub struct LengthProtocol {
    core: BurstCore,
    field: LengthField,
}

impl LengthProtocol {
    pub fn new(
        field: LengthField,
        discard_leading_bytes: usize,
        sync_pattern: Option<Vec<u8>>,
        fill_length_and_sync_pattern: bool,
        allow_empty_data: Option<bool>,
    ) -> Self {
        Self {
            core: BurstCore::new(
                discard_leading_bytes,
                sync_pattern,
                fill_length_and_sync_pattern,
                allow_empty_data,
            ),
            field,
        }
    }

    /// `length_bit_offset length_bit_size length_value_offset
    /// length_bytes_per_count length_endianness discard_leading_bytes
    /// sync_pattern max_length fill_length_and_sync_pattern allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("LENGTH", values, 10)?;
        let endianness = match args.get(4) {
            Some(value) if value.eq_ignore_ascii_case("LITTLE_ENDIAN") => Endianness::Little,
            _ => Endianness::Big,
        };
        let bytes_per_count = args.int(3, "length_bytes_per_count", 1)?;
        if bytes_per_count <= 0 {
            return Err(ProtocolError::invalid(
                "LENGTH",
                format!("length_bytes_per_count must be positive, got {bytes_per_count}"),
            ));
        }
        let field = LengthField {
            bit_offset: args.int(0, "length_bit_offset", 0)?,
            bit_size: args.int(1, "length_bit_size", 16)?,
            value_offset: args.int(2, "length_value_offset", 0)?,
            bytes_per_count,
            endianness,
            max_length: args
                .opt_int(7, "max_length")?
                .map(|max| max as i64),
        };
        Ok(Self::new(
            field,
            args.size(5, "discard_leading_bytes", 0)?,
            args.hex(6, "sync_pattern")?,
            args.flag(8, "fill_length_and_sync_pattern", false)?,
            args.opt_flag(9, "allow_empty_data")?,
        ))
    }
}

impl Protocol for LengthProtocol {
    fn name(&self) -> &'static str {
        "LENGTH"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        let field = &self.field;
        self.core.read(data, at_tail, |buffer, _| field.reduce(buffer))
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        let discard_bits = self.core.discard_leading_bytes as i64 * 8;
        if self.core.fill_fields && self.field.bit_offset >= discard_bits {
            // The leading bytes are added back later in write_data.
            let length = self
                .field
                .calculate(packet.buffer.len() + self.core.discard_leading_bytes)?;
            self.field
                .write(length, self.field.bit_offset - discard_bits, &mut packet.buffer)?;
        }
        self.core.write_packet(&mut packet)?;
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        let mut data = self.core.write_data(data)?;
        let discard_bits = self.core.discard_leading_bytes as i64 * 8;
        if self.core.fill_fields && self.field.bit_offset < discard_bits {
            let length = self.field.calculate(data.len())?;
            self.field.write(length, self.field.bit_offset, &mut data)?;
        }
        Ok(Outcome::Ready(data))
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ccsds() -> LengthProtocol {
        // CCSDS primary header: 16-bit length at byte 4, value = total - 7.
        LengthProtocol::new(
            LengthField {
                bit_offset: 32,
                value_offset: 7,
                ..LengthField::default()
            },
            0,
            None,
            false,
            None,
        )
    }

    #[test]
    fn test_byte_at_a_time_yields_one_frame() {
        let mut protocol = ccsds();
        let frame = [0x08, 0x01, 0xC0, 0x00, 0x00, 0x02, 0xAA, 0xBB, 0xCC];
        for byte in &frame[..frame.len() - 1] {
            assert_eq!(
                protocol.read_data(BytesMut::from(&[*byte][..]), true).unwrap(),
                Outcome::Stop
            );
        }
        assert_eq!(
            protocol
                .read_data(BytesMut::from(&frame[frame.len() - 1..]), true)
                .unwrap(),
            Outcome::Ready(BytesMut::from(&frame[..]))
        );
        assert_eq!(protocol.read_data(BytesMut::new(), true).unwrap(), Outcome::Stop);
    }

    #[test]
    fn test_back_to_back_frames_drain() {
        let mut protocol = LengthProtocol::new(LengthField::default(), 0, None, false, None);
        let input = [0x00, 0x03, 0x01, 0x00, 0x04, 0x02, 0x03];
        assert_eq!(
            protocol.read_data(BytesMut::from(&input[..]), true).unwrap(),
            Outcome::Ready(BytesMut::from(&[0x00, 0x03, 0x01][..]))
        );
        assert_eq!(
            protocol.read_data(BytesMut::new(), true).unwrap(),
            Outcome::Ready(BytesMut::from(&[0x00, 0x04, 0x02, 0x03][..]))
        );
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let mut protocol = LengthProtocol::new(
            LengthField {
                max_length: Some(50),
                ..LengthField::default()
            },
            0,
            None,
            false,
            None,
        );
        let err = protocol
            .read_data(BytesMut::from(&[0x00, 0x64, 0x00][..]), true)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Length value received larger than max_length= 100 > 50"
        );

        // A one byte frame cannot hold its own 16-bit length field.
        let mut protocol = LengthProtocol::new(LengthField::default(), 0, None, false, None);
        assert!(protocol
            .read_data(BytesMut::from(&[0x00, 0x01][..]), true)
            .is_err());
    }

    #[test]
    fn test_oversized_64_bit_length_is_a_framing_error() {
        let mut protocol = LengthProtocol::new(
            LengthField {
                bit_size: 64,
                bytes_per_count: 4,
                ..LengthField::default()
            },
            0,
            None,
            false,
            None,
        );
        let err = protocol
            .read_data(BytesMut::from(&[0xFF; 8][..]), true)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
        assert!(err.to_string().ends_with("is too large"));
    }

    #[test]
    fn test_fill_length_and_sync() {
        let mut protocol = LengthProtocol::new(
            LengthField {
                bit_offset: 8,
                bit_size: 8,
                ..LengthField::default()
            },
            0,
            Some(vec![0xAB]),
            true,
            None,
        );
        let Outcome::Ready(packet) = protocol.write_packet(Packet::raw(vec![0, 0, 1, 2])).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!(packet.buffer, vec![0xAB, 0x04, 1, 2]);
    }

    #[test]
    fn test_fill_length_in_discarded_header() {
        // Two byte header (sync + length) stripped on read, restored on write.
        let mut protocol = LengthProtocol::new(
            LengthField {
                bit_offset: 8,
                bit_size: 8,
                ..LengthField::default()
            },
            2,
            Some(vec![0xAB]),
            true,
            None,
        );
        assert_eq!(
            protocol.write_data(vec![7, 8, 9]).unwrap(),
            Outcome::Ready(vec![0xAB, 0x05, 7, 8, 9])
        );
        assert_eq!(
            protocol
                .read_data(BytesMut::from(&[0x00, 0xAB, 0x05, 7, 8, 9][..]), true)
                .unwrap(),
            Outcome::Ready(BytesMut::from(&[7, 8, 9][..]))
        );
    }

    #[test]
    fn test_from_args() {
        let args: Vec<String> = ["32", "16", "7", "1", "BIG_ENDIAN", "0", "nil", "nil", "false"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let protocol = LengthProtocol::from_args(&args).unwrap();
        assert_eq!(protocol.field.bit_offset, 32);
        assert_eq!(protocol.field.value_offset, 7);
        assert_eq!(protocol.field.max_length, None);
        assert_eq!(protocol.field.bytes_needed(), 6);

        let bad: Vec<String> = vec!["abc".to_string()];
        assert!(LengthProtocol::from_args(&bad).is_err());
    }
}
