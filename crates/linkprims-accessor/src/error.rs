use crate::types::DataType;

/// Errors raised while reading or writing a field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessorError {
    /// The field lies (partly) outside the buffer.
    #[error("{len} byte buffer insufficient to {op} {data_type} at bit_offset {bit_offset} with bit_size {bit_size}")]
    BufferTooSmall {
        op: &'static str,
        len: usize,
        data_type: DataType,
        bit_offset: i64,
        bit_size: i64,
    },

    /// Only STRING and BLOCK fields may use a non-positive size.
    #[error("bit_size {bit_size} must be positive for data types other than STRING and BLOCK")]
    NonPositiveBitSize { bit_size: i64 },

    /// A negative offset can't be combined with a "rest of buffer" size.
    #[error("negative or zero bit_sizes ({bit_size}) cannot be given with negative bit_offsets ({bit_offset})")]
    NegativeOffsetWithVariableSize { bit_offset: i64, bit_size: i64 },

    #[error("bit_offset {bit_offset} is not byte aligned for data_type {data_type}")]
    NotByteAligned { bit_offset: i64, data_type: DataType },

    #[error("bit_size is {bit_size} but must be 32 or 64 for data_type FLOAT")]
    InvalidFloatSize { bit_size: i64 },

    /// Integers wider than 64 bits are not supported.
    #[error("bit_size {bit_size} exceeds 64 bits for data_type {data_type}")]
    BitSizeTooLarge { bit_size: i64, data_type: DataType },

    #[error("LITTLE_ENDIAN bitfield with bit_offset {bit_offset} and bit_size {bit_size} is invalid")]
    InvalidLittleEndianBitfield { bit_offset: i64, bit_size: i64 },

    /// Integer value outside the range allowed by the overflow policy.
    #[error("value of {value} invalid for {bit_size}-bit {data_type}")]
    Overflow {
        value: i128,
        bit_size: i64,
        data_type: DataType,
    },

    #[error("value of {len} bytes does not fit into {byte_size} bytes for data_type {data_type}")]
    ValueTooLong {
        len: usize,
        byte_size: usize,
        data_type: DataType,
    },

    #[error("cannot write {found} value to data_type {data_type}")]
    TypeMismatch {
        found: &'static str,
        data_type: DataType,
    },

    #[error("data_type {0} has no buffer representation")]
    Unsupported(DataType),

    #[error("bit_size {bit_size} must be positive for arrays")]
    NonPositiveArrayBitSize { bit_size: i64 },

    #[error("array_size {array_size} not a multiple of bit_size {bit_size}")]
    ArraySizeNotMultiple { array_size: i64, bit_size: i64 },

    #[error("too many values {count} for given array_size {array_size} and bit_size {bit_size}")]
    TooManyValues {
        count: usize,
        array_size: i64,
        bit_size: i64,
    },

    #[error("{op} does not support little endian bit fields with bit_size greater than 1-bit")]
    LittleEndianArrayBitfield { op: &'static str },

    /// A keyword that does not name a data type, byte order or policy.
    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, AccessorError>;
