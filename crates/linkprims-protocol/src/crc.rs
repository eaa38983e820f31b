use std::fmt;

use bytes::BytesMut;
use crc::Algorithm;
use linkprims_accessor::{BinaryAccessor, DataType, Endianness, OverflowPolicy, Value};
use linkprims_packet::Packet;
use tracing::error;

use crate::args::Args;
use crate::error::{ProtocolError, Result};
use crate::protocol::{pass_empty, LinkInfo, Outcome, Protocol};

/// CRC of width 8, 16, 32 or 64 with a configurable polynomial, seed, final
/// xor and reflection.
///
/// `xor` inverts every bit of the final register. `reflect` applies to both
/// the input bytes and the output value.
pub struct Crc {
    engine: crc::Crc<u64>,
}

impl fmt::Debug for Crc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = self.engine.algorithm;
        f.debug_struct("Crc")
            .field("width", &algorithm.width)
            .field("poly", &format_args!("{:#x}", algorithm.poly))
            .field("seed", &format_args!("{:#x}", algorithm.init))
            .field("xor", &(algorithm.xorout != 0))
            .field("reflect", &algorithm.refin)
            .finish()
    }
}

impl Crc {
    pub fn new(width: u32, poly: u64, seed: u64, xor: bool, reflect: bool) -> Result<Self> {
        if !matches!(width, 8 | 16 | 32 | 64) {
            return Err(ProtocolError::invalid(
                "CRC",
                format!("invalid bit size of {width}, must be 8, 16, 32, or 64"),
            ));
        }
        let mask = mask(width);
        // crc::Crc borrows its algorithm for 'static; one is built per
        // configured protocol.
        let algorithm: &'static Algorithm<u64> = Box::leak(Box::new(Algorithm {
            width: width as u8,
            poly: poly & mask,
            init: seed & mask,
            refin: reflect,
            refout: reflect,
            xorout: if xor { mask } else { 0 },
            check: 0,
            residue: 0,
        }));
        Ok(Self {
            engine: crc::Crc::<u64>::new(algorithm),
        })
    }

    /// Width-specific defaults: CRC-8 0xD5; CRC-16 CCITT; CRC-32 and CRC-64
    /// reflected with final xor.
    pub fn with_defaults(width: u32) -> Result<Self> {
        let (poly, seed, xor, reflect) = Self::defaults(width)?;
        Self::new(width, poly, seed, xor, reflect)
    }

    fn defaults(width: u32) -> Result<(u64, u64, bool, bool)> {
        match width {
            8 => Ok((0xD5, 0, false, false)),
            16 => Ok((0x1021, 0xFFFF, false, false)),
            32 => Ok((0x04C1_1DB7, 0xFFFF_FFFF, true, true)),
            64 => Ok((0x42F0_E1EB_A9EA_3693, u64::MAX, true, true)),
            other => Err(ProtocolError::invalid(
                "CRC",
                format!("invalid bit size of {other}, must be 8, 16, 32, or 64"),
            )),
        }
    }

    pub fn width(&self) -> u32 {
        u32::from(self.engine.algorithm.width)
    }

    pub fn poly(&self) -> u64 {
        self.engine.algorithm.poly
    }

    pub fn calc(&self, data: &[u8]) -> u64 {
        self.engine.checksum(data)
    }
}

fn mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Reaction to a CRC mismatch on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadCrcStrategy {
    /// Log and pass the frame on.
    Error,
    Disconnect,
}

/// Verifies a CRC on read and creates one on write.
#[derive(Debug)]
pub struct CrcProtocol {
    write_item_name: Option<String>,
    strip_crc: bool,
    bad_strategy: BadCrcStrategy,
    /// Negative offsets count back from the end of the frame.
    bit_offset: i64,
    endianness: Endianness,
    crc: Crc,
    allow_empty_data: Option<bool>,
    link_name: String,
}

impl CrcProtocol {
    pub fn new(
        write_item_name: Option<String>,
        strip_crc: bool,
        bad_strategy: BadCrcStrategy,
        bit_offset: i64,
        endianness: Endianness,
        crc: Crc,
        allow_empty_data: Option<bool>,
    ) -> Result<Self> {
        if bit_offset % 8 != 0 {
            return Err(ProtocolError::invalid(
                "CRC",
                format!("invalid bit offset of {bit_offset}, must be divisible by 8"),
            ));
        }
        Ok(Self {
            write_item_name,
            strip_crc,
            bad_strategy,
            bit_offset,
            endianness,
            crc,
            allow_empty_data,
            link_name: String::new(),
        })
    }

    /// `write_item_name strip_crc bad_strategy bit_offset bit_size endianness
    /// poly seed xor reflect allow_empty_data`
    ///
    /// Each of poly, seed, xor and reflect only applies when the ones before
    /// it are given; the rest take the width defaults.
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("CRC", values, 11)?;
        let strip_crc = args.flag(1, "strip CRC", false)?;
        let bad_strategy = match args.get(2).map(str::to_ascii_uppercase).as_deref() {
            None | Some("ERROR") => BadCrcStrategy::Error,
            Some("DISCONNECT") => BadCrcStrategy::Disconnect,
            Some(other) => {
                return Err(ProtocolError::invalid(
                    "CRC",
                    format!("invalid bad CRC strategy of {other}, must be ERROR or DISCONNECT"),
                ))
            }
        };
        let endianness = match args.get(5).map(str::to_ascii_uppercase).as_deref() {
            None | Some("BIG_ENDIAN") => Endianness::Big,
            Some("LITTLE_ENDIAN") => Endianness::Little,
            Some(other) => {
                return Err(ProtocolError::invalid(
                    "CRC",
                    format!("invalid endianness '{other}', must be BIG_ENDIAN or LITTLE_ENDIAN"),
                ))
            }
        };
        let bit_size = args.int(4, "bit size", 32)?;
        let width = u32::try_from(bit_size).map_err(|_| {
            ProtocolError::invalid("CRC", format!("invalid bit size of {bit_size}"))
        })?;
        let (mut poly, mut seed, mut xor, mut reflect) = Crc::defaults(width)?;
        if let Some(value) = args.opt_int(6, "polynomial")? {
            poly = value as u64;
            if let Some(value) = args.opt_int(7, "seed")? {
                seed = value as u64;
                if let Some(value) = args.opt_flag(8, "XOR value")? {
                    xor = value;
                    if let Some(value) = args.opt_flag(9, "reflect value")? {
                        reflect = value;
                    }
                }
            }
        }
        Self::new(
            args.get(0).map(str::to_ascii_uppercase),
            strip_crc,
            bad_strategy,
            args.int(3, "bit offset", -32)?,
            endianness,
            Crc::new(width, poly, seed, xor, reflect)?,
            args.opt_flag(10, "allow_empty_data")?,
        )
    }

    fn bit_size(&self) -> i64 {
        self.crc.width() as i64
    }

    /// Byte index of the CRC field in a frame of `len` bytes.
    fn crc_start(&self, len: usize) -> Result<usize> {
        let index = if self.bit_offset < 0 {
            len as i64 + self.bit_offset / 8
        } else {
            self.bit_offset / 8
        };
        usize::try_from(index)
            .ok()
            .filter(|start| start + (self.bit_size() / 8) as usize <= len)
            .ok_or_else(|| {
                ProtocolError::Framing(format!(
                    "{len} byte frame too short for a CRC at bit offset {}",
                    self.bit_offset
                ))
            })
    }
}

impl Protocol for CrcProtocol {
    fn name(&self) -> &'static str {
        "CRC"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.link_name = link.name.clone();
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        if data.is_empty() {
            return Ok(pass_empty(self.allow_empty_data, data, at_tail));
        }
        let start = self.crc_start(data.len())?;
        let found = BinaryAccessor::read(
            self.bit_offset,
            self.bit_size(),
            DataType::Uint,
            &data,
            self.endianness,
        )?
        .as_int()
        .unwrap_or_default() as u64;
        let calculated = self.crc.calc(&data[..start]);
        if calculated != found {
            error!(
                interface = %self.link_name,
                "Invalid CRC detected! Calculated {calculated:#x} vs found {found:#x}."
            );
            if self.bad_strategy == BadCrcStrategy::Disconnect {
                return Ok(Outcome::Disconnect);
            }
        }
        if !self.strip_crc {
            return Ok(Outcome::Ready(data));
        }
        let end = start + (self.bit_size() / 8) as usize;
        let mut stripped = BytesMut::with_capacity(data.len() - (end - start));
        stripped.extend_from_slice(&data[..start]);
        stripped.extend_from_slice(&data[end..]);
        Ok(Outcome::Ready(stripped))
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        if let Some(name) = &self.write_item_name {
            let offset = {
                let def = packet.definition().ok_or_else(|| {
                    ProtocolError::Write(format!(
                        "CRC item {name} needs an identified packet"
                    ))
                })?;
                def.get_item(name)?.bit_offset
            };
            let end = if offset < 0 {
                (packet.buffer.len() as i64 + offset / 8).max(0) as usize
            } else {
                ((offset / 8) as usize).min(packet.buffer.len())
            };
            let crc = self.crc.calc(&packet.buffer[..end]);
            packet.write(name, &Value::Int(crc as i128))?;
        }
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, mut data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        if self.write_item_name.is_none() {
            let crc = self.crc.calc(&data);
            data.resize(data.len() + (self.bit_size() / 8) as usize, 0);
            BinaryAccessor::write(
                &Value::Int(crc as i128),
                -self.bit_size(),
                self.bit_size(),
                DataType::Uint,
                &mut data,
                self.endianness,
                OverflowPolicy::Error,
            )?;
        }
        Ok(Outcome::Ready(data))
    }
}
