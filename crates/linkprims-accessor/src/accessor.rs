use crate::error::{AccessorError, Result};
use crate::types::{DataType, Endianness, OverflowPolicy, Value};

/// Reads and writes typed fields at arbitrary bit positions of a buffer.
///
/// All offsets and sizes are in bits. A negative `bit_offset` is relative to
/// the end of the buffer. For STRING and BLOCK a `bit_size <= 0` selects the
/// rest of the buffer minus `|bit_size|` trailing bits.
pub struct BinaryAccessor;

impl BinaryAccessor {
    /// Read one field.
    pub fn read(
        bit_offset: i64,
        bit_size: i64,
        data_type: DataType,
        buffer: &[u8],
        endianness: Endianness,
    ) -> Result<Value> {
        let len = buffer.len();
        let offset = resolve_offset("read", bit_offset, bit_size, data_type, len)?;

        let mut size = bit_size;
        if data_type.is_bytes() && size <= 0 {
            size = len as i64 * 8 - offset + size;
            if size == 0 {
                return Ok(empty_bytes(data_type));
            }
            if size < 0 {
                return Err(buffer_error("read", len, data_type, bit_offset, bit_size));
            }
        }

        if !check_bounds(offset, size, data_type, len, endianness) {
            return Err(buffer_error("read", len, data_type, bit_offset, bit_size));
        }
        let lower = (offset / 8) as usize;
        let upper = (offset + size - 1).div_euclid(8) as usize;

        match data_type {
            DataType::String | DataType::Block => {
                require_aligned(offset, data_type)?;
                let bytes = &buffer[lower..=upper];
                if data_type == DataType::Block {
                    return Ok(Value::Block(bytes.to_vec()));
                }
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                match String::from_utf8(bytes[..end].to_vec()) {
                    Ok(s) => Ok(Value::String(s)),
                    Err(e) => Ok(Value::Block(e.into_bytes())),
                }
            }
            DataType::Int | DataType::Uint => {
                check_integer_size(size, data_type)?;
                let raw = read_raw(buffer, offset, size, endianness, lower)?;
                Ok(Value::Int(sign_extend(raw, size, data_type)))
            }
            DataType::Float => {
                require_aligned(offset, data_type)?;
                let bytes = &buffer[lower..=upper];
                match (size, endianness) {
                    (32, Endianness::Big) => Ok(Value::Float(f32::from_be_bytes(to_array(bytes)) as f64)),
                    (32, Endianness::Little) => Ok(Value::Float(f32::from_le_bytes(to_array(bytes)) as f64)),
                    (64, Endianness::Big) => Ok(Value::Float(f64::from_be_bytes(to_array(bytes)))),
                    (64, Endianness::Little) => Ok(Value::Float(f64::from_le_bytes(to_array(bytes)))),
                    _ => Err(AccessorError::InvalidFloatSize { bit_size: size }),
                }
            }
            DataType::Derived => Err(AccessorError::Unsupported(data_type)),
        }
    }

    /// Write one field into `buffer`.
    ///
    /// Fixed-size writes never change the buffer length. A STRING or BLOCK
    /// write with `bit_size <= 0` resizes the variable region so that the
    /// trailing `|bit_size|` bits stay in place.
    pub fn write(
        value: &Value,
        bit_offset: i64,
        bit_size: i64,
        data_type: DataType,
        buffer: &mut Vec<u8>,
        endianness: Endianness,
        overflow: OverflowPolicy,
    ) -> Result<()> {
        let len = buffer.len();
        let offset = resolve_offset("write", bit_offset, bit_size, data_type, len)?;

        match data_type {
            DataType::String | DataType::Block => {
                write_bytes(value, offset, bit_offset, bit_size, data_type, buffer, overflow)
            }
            DataType::Int | DataType::Uint => {
                check_integer_size(bit_size, data_type)?;
                if !check_bounds(offset, bit_size, data_type, len, endianness) {
                    return Err(buffer_error("write", len, data_type, bit_offset, bit_size));
                }
                let raw = integer_value(value, data_type)?;
                let checked = check_overflow(raw, bit_size, data_type, overflow)?;
                write_raw(buffer, offset, bit_size, endianness, checked)
            }
            DataType::Float => {
                if !check_bounds(offset, bit_size, data_type, len, endianness) {
                    return Err(buffer_error("write", len, data_type, bit_offset, bit_size));
                }
                require_aligned(offset, data_type)?;
                let v = value.as_float().ok_or(AccessorError::TypeMismatch {
                    found: value.kind(),
                    data_type,
                })?;
                let lower = (offset / 8) as usize;
                let bytes = match (bit_size, endianness) {
                    (32, Endianness::Big) => (v as f32).to_be_bytes().to_vec(),
                    (32, Endianness::Little) => (v as f32).to_le_bytes().to_vec(),
                    (64, Endianness::Big) => v.to_be_bytes().to_vec(),
                    (64, Endianness::Little) => v.to_le_bytes().to_vec(),
                    _ => return Err(AccessorError::InvalidFloatSize { bit_size }),
                };
                buffer[lower..lower + bytes.len()].copy_from_slice(&bytes);
                Ok(())
            }
            DataType::Derived => Err(AccessorError::Unsupported(data_type)),
        }
    }

    /// Read a run of `array_size` bits as consecutive `bit_size` elements.
    ///
    /// `array_size <= 0` means the rest of the buffer minus `|array_size|`
    /// trailing bits.
    pub fn read_array(
        bit_offset: i64,
        bit_size: i64,
        data_type: DataType,
        array_size: i64,
        buffer: &[u8],
        endianness: Endianness,
    ) -> Result<Vec<Value>> {
        if buffer.is_empty() {
            return Ok(Vec::new());
        }
        if bit_size <= 0 {
            return Err(AccessorError::NonPositiveArrayBitSize { bit_size });
        }
        let len = buffer.len();
        let len_bits = len as i64 * 8;
        let offset = resolve_array_offset("read", bit_offset, bit_size, data_type, array_size, len)?;

        let mut total = array_size;
        if total <= 0 {
            total = len_bits - offset + total;
            if total == 0 {
                return Ok(Vec::new());
            }
            if total < 0 {
                return Err(buffer_error("read", len, data_type, bit_offset, bit_size));
            }
        }
        if total % bit_size != 0 {
            return Err(AccessorError::ArraySizeNotMultiple {
                array_size: total,
                bit_size,
            });
        }
        check_array_endianness("read_array", offset, bit_size, data_type, endianness)?;
        if offset + total > len_bits {
            return Err(buffer_error("read", len, data_type, bit_offset, total));
        }

        (0..total / bit_size)
            .map(|i| Self::read(offset + i * bit_size, bit_size, data_type, buffer, endianness))
            .collect()
    }

    /// Write `values` as consecutive `bit_size` elements.
    ///
    /// Missing values are written as zero. With `array_size <= 0` the array
    /// region is resized to fit exactly `values.len()` elements.
    #[allow(clippy::too_many_arguments)]
    pub fn write_array(
        values: &[Value],
        bit_offset: i64,
        bit_size: i64,
        data_type: DataType,
        array_size: i64,
        buffer: &mut Vec<u8>,
        endianness: Endianness,
        overflow: OverflowPolicy,
    ) -> Result<()> {
        if bit_size <= 0 {
            return Err(AccessorError::NonPositiveArrayBitSize { bit_size });
        }
        let len = buffer.len();
        let offset = resolve_array_offset("write", bit_offset, bit_size, data_type, array_size, len)?;
        check_array_endianness("write_array", offset, bit_size, data_type, endianness)?;

        let num_writes = if array_size <= 0 {
            let end_bytes = -array_size.div_euclid(8);
            let lower = offset / 8;
            let num_bytes = (values.len() as i64 * bit_size + 7) / 8;
            let upper = lower + num_bytes - 1;
            let old_upper = len as i64 - 1 - end_bytes;
            if lower + end_bytes > len as i64 {
                return Err(buffer_error("write", len, data_type, bit_offset, bit_size));
            }
            if upper < old_upper {
                buffer.drain((upper + 1) as usize..=old_upper as usize);
            } else if upper > old_upper {
                let at = (old_upper + 1) as usize;
                let diff = (upper - old_upper) as usize;
                buffer.splice(at..at, std::iter::repeat_n(0u8, diff));
            }
            values.len() as i64
        } else {
            if array_size % bit_size != 0 {
                return Err(AccessorError::ArraySizeNotMultiple {
                    array_size,
                    bit_size,
                });
            }
            array_size / bit_size
        };

        if offset + num_writes * bit_size > buffer.len() as i64 * 8 {
            return Err(buffer_error("write", buffer.len(), data_type, bit_offset, bit_size));
        }
        if values.len() as i64 > num_writes {
            return Err(AccessorError::TooManyValues {
                count: values.len(),
                array_size,
                bit_size,
            });
        }

        let zero = Value::zero(data_type);
        for i in 0..num_writes {
            let value = values.get(i as usize).unwrap_or(&zero);
            Self::write(
                value,
                offset + i * bit_size,
                bit_size,
                data_type,
                buffer,
                endianness,
                overflow,
            )?;
        }
        Ok(())
    }

    /// Valid integer range of a field as `(min, max, hex_max)`.
    pub fn overflow_range(bit_size: i64, data_type: DataType) -> (i128, i128, i128) {
        let hex_max = (1i128 << bit_size) - 1;
        match data_type {
            DataType::Int if bit_size == 1 => (-1, 1, 1),
            DataType::Int => (
                -(1i128 << (bit_size - 1)),
                (1i128 << (bit_size - 1)) - 1,
                hex_max,
            ),
            _ => (0, hex_max, hex_max),
        }
    }
}

fn buffer_error(
    op: &'static str,
    len: usize,
    data_type: DataType,
    bit_offset: i64,
    bit_size: i64,
) -> AccessorError {
    AccessorError::BufferTooSmall {
        op,
        len,
        data_type,
        bit_offset,
        bit_size,
    }
}

fn empty_bytes(data_type: DataType) -> Value {
    match data_type {
        DataType::String => Value::String(String::new()),
        _ => Value::Block(Vec::new()),
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Validate the offset/size pair and resolve a negative offset.
fn resolve_offset(
    op: &'static str,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    len: usize,
) -> Result<i64> {
    if data_type == DataType::Derived {
        return Err(AccessorError::Unsupported(data_type));
    }
    if bit_size <= 0 && !data_type.is_bytes() {
        return Err(AccessorError::NonPositiveBitSize { bit_size });
    }
    if bit_size <= 0 && bit_offset < 0 {
        return Err(AccessorError::NegativeOffsetWithVariableSize {
            bit_offset,
            bit_size,
        });
    }
    if bit_offset < 0 {
        let resolved = len as i64 * 8 + bit_offset;
        if resolved < 0 {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
        return Ok(resolved);
    }
    Ok(bit_offset)
}

fn resolve_array_offset(
    op: &'static str,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    array_size: i64,
    len: usize,
) -> Result<i64> {
    if array_size <= 0 && bit_offset < 0 {
        return Err(AccessorError::NegativeOffsetWithVariableSize {
            bit_offset,
            bit_size: array_size,
        });
    }
    if bit_offset < 0 {
        let resolved = len as i64 * 8 + bit_offset;
        if resolved < 0 {
            return Err(buffer_error(op, len, data_type, bit_offset, bit_size));
        }
        return Ok(resolved);
    }
    Ok(bit_offset)
}

fn is_aligned_word(bit_offset: i64, bit_size: i64) -> bool {
    bit_offset % 8 == 0 && matches!(bit_size, 8 | 16 | 32 | 64)
}

/// True when every byte touched by the field lies inside the buffer.
///
/// Little-endian integer bitfields extend *downwards* from the byte named by
/// `bit_offset`, so only their first byte has to be inside the buffer here;
/// the real span is validated when the bytes are gathered.
fn check_bounds(
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    len: usize,
    endianness: Endianness,
) -> bool {
    let lower = bit_offset / 8;
    let upper = (bit_offset + bit_size - 1).div_euclid(8);
    let len = len as i64;
    if upper < len {
        return true;
    }
    endianness == Endianness::Little
        && data_type.is_integer()
        && !is_aligned_word(bit_offset, bit_size)
        && lower < len
}

fn require_aligned(bit_offset: i64, data_type: DataType) -> Result<()> {
    if bit_offset % 8 != 0 {
        return Err(AccessorError::NotByteAligned {
            bit_offset,
            data_type,
        });
    }
    Ok(())
}

fn check_integer_size(bit_size: i64, data_type: DataType) -> Result<()> {
    if bit_size > 64 {
        return Err(AccessorError::BitSizeTooLarge {
            bit_size,
            data_type,
        });
    }
    Ok(())
}

fn check_array_endianness(
    op: &'static str,
    bit_offset: i64,
    bit_size: i64,
    data_type: DataType,
    endianness: Endianness,
) -> Result<()> {
    if endianness == Endianness::Little
        && data_type.is_integer()
        && bit_size > 1
        && !is_aligned_word(bit_offset, bit_size)
    {
        return Err(AccessorError::LittleEndianArrayBitfield { op });
    }
    Ok(())
}

/// Byte range of an integer bitfield, in buffer index order.
fn bitfield_span(
    bit_offset: i64,
    bit_size: i64,
    endianness: Endianness,
    len: usize,
) -> Result<(usize, usize)> {
    match endianness {
        Endianness::Big => Ok((
            (bit_offset / 8) as usize,
            ((bit_offset + bit_size - 1) / 8) as usize,
        )),
        Endianness::Little => {
            let num_bytes = ((bit_offset % 8) + bit_size - 1) / 8 + 1;
            let upper = bit_offset / 8;
            let lower = upper - num_bytes + 1;
            if lower < 0 || upper >= len as i64 {
                return Err(AccessorError::InvalidLittleEndianBitfield {
                    bit_offset,
                    bit_size,
                });
            }
            Ok((lower as usize, upper as usize))
        }
    }
}

/// Gather the covered bytes in big-endian view order.
fn gather(buffer: &[u8], lower: usize, upper: usize, endianness: Endianness) -> Vec<u8> {
    let span = &buffer[lower..=upper];
    match endianness {
        Endianness::Big => span.to_vec(),
        Endianness::Little => span.iter().rev().copied().collect(),
    }
}

fn read_raw(
    buffer: &[u8],
    bit_offset: i64,
    bit_size: i64,
    endianness: Endianness,
    lower: usize,
) -> Result<u128> {
    if is_aligned_word(bit_offset, bit_size) {
        let n = (bit_size / 8) as usize;
        let bytes = gather(buffer, lower, lower + n - 1, endianness);
        return Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128));
    }

    let (lo, hi) = bitfield_span(bit_offset, bit_size, endianness, buffer.len())?;
    let bytes = gather(buffer, lo, hi, endianness);
    let start_bits = bit_offset % 8;
    let start_mask = 0xFFu8 >> start_bits;
    let total_bits = bytes.len() as i64 * 8;
    let right_shift = total_bits - start_bits - bit_size;

    let mut raw = (bytes[0] & start_mask) as u128;
    for b in &bytes[1..] {
        raw = (raw << 8) | *b as u128;
    }
    Ok(raw >> right_shift)
}

fn sign_extend(raw: u128, bit_size: i64, data_type: DataType) -> i128 {
    if data_type == DataType::Int && bit_size > 1 && raw & (1u128 << (bit_size - 1)) != 0 {
        raw as i128 - (1i128 << bit_size)
    } else {
        raw as i128
    }
}

fn integer_value(value: &Value, data_type: DataType) -> Result<i128> {
    let mismatch = || AccessorError::TypeMismatch {
        found: value.kind(),
        data_type,
    };
    match value {
        Value::Int(v) => Ok(*v),
        Value::Float(f) if f.is_finite() => Ok(f.trunc() as i128),
        Value::String(s) => s.trim().parse::<i128>().map_err(|_| mismatch()),
        _ => Err(mismatch()),
    }
}

fn check_overflow(
    value: i128,
    bit_size: i64,
    data_type: DataType,
    overflow: OverflowPolicy,
) -> Result<i128> {
    let (min, max, hex_max) = BinaryAccessor::overflow_range(bit_size, data_type);
    let out_of_range = || AccessorError::Overflow {
        value,
        bit_size,
        data_type,
    };

    if overflow == OverflowPolicy::Truncate {
        let modulus = hex_max + 1;
        let mut v = value.rem_euclid(modulus);
        if v > max {
            v -= modulus;
        }
        return Ok(v);
    }

    if value > max {
        return match overflow {
            OverflowPolicy::Saturate => Ok(max),
            OverflowPolicy::ErrorAllowHex if value <= hex_max => Ok(value),
            _ => Err(out_of_range()),
        };
    }
    if value < min {
        return match overflow {
            OverflowPolicy::Saturate => Ok(min),
            _ => Err(out_of_range()),
        };
    }
    Ok(value)
}

fn write_raw(
    buffer: &mut [u8],
    bit_offset: i64,
    bit_size: i64,
    endianness: Endianness,
    value: i128,
) -> Result<()> {
    let raw = value as u128;

    if is_aligned_word(bit_offset, bit_size) {
        let n = (bit_size / 8) as usize;
        let lower = (bit_offset / 8) as usize;
        let be = raw.to_be_bytes();
        let bytes = &be[16 - n..];
        let dst = &mut buffer[lower..lower + n];
        match endianness {
            Endianness::Big => dst.copy_from_slice(bytes),
            Endianness::Little => {
                for (d, s) in dst.iter_mut().zip(bytes.iter().rev()) {
                    *d = *s;
                }
            }
        }
        return Ok(());
    }

    let (lo, hi) = bitfield_span(bit_offset, bit_size, endianness, buffer.len())?;
    let mut field = gather(buffer, lo, hi, endianness);
    let last = field.len() - 1;
    let start_bits = bit_offset % 8;
    let start_mask = ((0xFFu16 << (8 - start_bits)) & 0xFF) as u8;
    let total_bits = field.len() as i64 * 8;
    let end_bits = total_bits - start_bits - bit_size;
    let end_mask = ((1u16 << end_bits) - 1) as u8;

    let mut temp = (field[0] & start_mask) as u128;
    let field_value = raw & ((1u128 << bit_size) - 1);
    let shift = bit_size - (8 - start_bits);
    temp = if shift < 0 {
        (temp >> -shift) + field_value
    } else {
        (temp << shift) + field_value
    };
    temp = (temp << end_bits) + (field[last] & end_mask) as u128;

    for byte in field.iter_mut().rev() {
        *byte = (temp & 0xFF) as u8;
        temp >>= 8;
    }
    if endianness == Endianness::Little {
        field.reverse();
    }
    buffer[lo..=hi].copy_from_slice(&field);
    Ok(())
}

/// Replace `buffer[start..start + data.len()]`, growing the buffer if the
/// range runs past its end.
fn assign(buffer: &mut Vec<u8>, start: usize, data: &[u8]) {
    if start > buffer.len() {
        buffer.resize(start, 0);
    }
    let end = (start + data.len()).min(buffer.len());
    buffer.splice(start..end, data.iter().copied());
}

fn write_bytes(
    value: &Value,
    offset: i64,
    given_offset: i64,
    given_size: i64,
    data_type: DataType,
    buffer: &mut Vec<u8>,
    overflow: OverflowPolicy,
) -> Result<()> {
    let mut temp = value
        .as_bytes()
        .ok_or(AccessorError::TypeMismatch {
            found: value.kind(),
            data_type,
        })?
        .to_vec();
    let len = buffer.len();
    let bit_size = if given_size <= 0 {
        temp.len() as i64 * 8
    } else {
        given_size
    };

    if !check_bounds(offset, bit_size, data_type, len, Endianness::Big) && given_size > 0 {
        return Err(buffer_error("write", len, data_type, given_offset, given_size));
    }
    require_aligned(offset, data_type)?;

    let lower = offset / 8;
    let upper = (offset + bit_size - 1).div_euclid(8);

    if given_size <= 0 {
        let end_bytes = -given_size.div_euclid(8);
        let old_upper = len as i64 - 1 - end_bytes;
        if lower + end_bytes > len as i64 {
            return Err(buffer_error("write", len, data_type, given_offset, given_size));
        }

        if old_upper < lower {
            // The variable region is currently empty.
            if end_bytes > 0 {
                let at = lower as usize;
                let end = end_bytes as usize;
                buffer.resize(len + temp.len(), 0);
                buffer.copy_within(at..at + end, at + temp.len());
            }
        } else if bit_size == 0 {
            buffer.drain(lower as usize..=old_upper as usize);
        } else if upper < old_upper {
            buffer.drain((upper + 1) as usize..=old_upper as usize);
        } else if upper > old_upper && end_bytes > 0 {
            let diff = (upper - old_upper) as usize;
            let from = (old_upper + 1) as usize;
            buffer.resize(len + diff, 0);
            buffer.copy_within(from..from + end_bytes as usize, (upper + 1) as usize);
        }
    } else {
        let byte_size = (bit_size / 8) as usize;
        if temp.len() < byte_size {
            temp.resize(byte_size, 0);
        } else if temp.len() > byte_size {
            if overflow != OverflowPolicy::Truncate {
                return Err(AccessorError::ValueTooLong {
                    len: temp.len(),
                    byte_size,
                    data_type,
                });
            }
            temp.truncate(byte_size);
        }
    }

    if bit_size != 0 {
        assign(buffer, lower as usize, &temp);
    }
    Ok(())
}
