use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::AccessorError;

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Int,
    Uint,
    Float,
    String,
    Block,
    /// Computed value with no bits in the buffer.
    Derived,
}

impl DataType {
    /// STRING and BLOCK fields hold raw bytes and may be variable sized.
    pub fn is_bytes(self) -> bool {
        matches!(self, Self::String | Self::Block)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::Uint)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::Uint => "UINT",
            Self::Float => "FLOAT",
            Self::String => "STRING",
            Self::Block => "BLOCK",
            Self::Derived => "DERIVED",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = AccessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INT" => Ok(Self::Int),
            "UINT" => Ok(Self::Uint),
            "FLOAT" => Ok(Self::Float),
            "STRING" => Ok(Self::String),
            "BLOCK" => Ok(Self::Block),
            "DERIVED" => Ok(Self::Derived),
            _ => Err(AccessorError::Unknown {
                kind: "data type",
                value: s.to_string(),
            }),
        }
    }
}

/// Byte order of a field or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    #[serde(rename = "BIG_ENDIAN")]
    Big,
    #[serde(rename = "LITTLE_ENDIAN")]
    Little,
}

impl Endianness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Big => "BIG_ENDIAN",
            Self::Little => "LITTLE_ENDIAN",
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endianness {
    type Err = AccessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BIG_ENDIAN" => Ok(Self::Big),
            "LITTLE_ENDIAN" => Ok(Self::Little),
            _ => Err(AccessorError::Unknown {
                kind: "endianness",
                value: s.to_string(),
            }),
        }
    }
}

/// What to do when an integer does not fit its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowPolicy {
    #[default]
    Error,
    /// Accept anything that fits the unsigned width of the field.
    ErrorAllowHex,
    /// Keep the low bits (two's complement wrap for INT).
    Truncate,
    /// Clamp to the type bounds.
    Saturate,
}

impl FromStr for OverflowPolicy {
    type Err = AccessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Self::Error),
            "ERROR_ALLOW_HEX" => Ok(Self::ErrorAllowHex),
            "TRUNCATE" => Ok(Self::Truncate),
            "SATURATE" => Ok(Self::Saturate),
            _ => Err(AccessorError::Unknown {
                kind: "overflow policy",
                value: s.to_string(),
            }),
        }
    }
}

/// A decoded field value.
///
/// Integers are held as `i128` so that the full range of both 64-bit INT and
/// 64-bit UINT fits.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i128),
    Float(f64),
    String(String),
    Block(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i128),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Raw bytes of a STRING or BLOCK value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s.as_bytes()),
            Self::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Block(_) => "block",
            Self::Array(_) => "array",
        }
    }

    /// Zero value for a data type, used to pad arrays.
    pub fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::Float => Self::Float(0.0),
            DataType::String => Self::String(String::new()),
            DataType::Block => Self::Block(Vec::new()),
            _ => Self::Int(0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Block(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v as i128)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Int(v as i128)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Block(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => {
                if let Ok(v) = i64::try_from(*v) {
                    serializer.serialize_i64(v)
                } else if let Ok(v) = u64::try_from(*v) {
                    serializer.serialize_u64(v)
                } else {
                    serializer.serialize_str(&v.to_string())
                }
            }
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::String(s) => serializer.serialize_str(s),
            Self::Block(_) => serializer.serialize_str(&self.to_string()),
            Self::Array(items) => items.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_parse_case_insensitive() {
        assert_eq!("uint".parse::<DataType>().unwrap(), DataType::Uint);
        assert_eq!(
            "LITTLE_ENDIAN".parse::<Endianness>().unwrap(),
            Endianness::Little
        );
        assert_eq!(
            "error_allow_hex".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::ErrorAllowHex
        );
        assert!("NIBBLE".parse::<DataType>().is_err());
    }

    #[test]
    fn test_value_serializes_wide_integers() {
        let json = serde_json::to_string(&Value::Int(u64::MAX as i128)).unwrap();
        assert_eq!(json, "18446744073709551615");
        let json = serde_json::to_string(&Value::Block(vec![0xDE, 0xAD])).unwrap();
        assert_eq!(json, "\"0xDEAD\"");
    }
}
