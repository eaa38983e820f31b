use std::collections::BTreeMap;

use serde::Serialize;

use linkprims_accessor::{BinaryAccessor, DataType, Endianness, OverflowPolicy, Value};

use crate::error::Result;

/// A named state value (`STATE <name> <value>`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemState {
    pub name: String,
    pub value: Value,
    /// Telemetry display color (GREEN, YELLOW, RED).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Set when a command state is marked HAZARDOUS; holds the description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hazardous: Option<String>,
}

/// One field of a packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub name: String,
    pub bit_offset: i64,
    pub bit_size: i64,
    pub data_type: DataType,
    pub endianness: Endianness,
    /// Total array size in bits. `Some(n <= 0)` means rest of buffer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_size: Option<i64>,
    pub overflow: OverflowPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units_full: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_string: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<ItemState>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Vec<String>>,
    pub overlap: bool,
    pub required: bool,
    #[serde(skip)]
    pub(crate) create_index: usize,
}

impl Item {
    pub fn new(
        name: impl Into<String>,
        bit_offset: i64,
        bit_size: i64,
        data_type: DataType,
        endianness: Endianness,
    ) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            bit_offset,
            bit_size,
            data_type,
            endianness,
            array_size: None,
            overflow: OverflowPolicy::Error,
            default: None,
            minimum: None,
            maximum: None,
            id_value: None,
            description: None,
            units_full: None,
            units: None,
            format_string: None,
            states: Vec::new(),
            meta: BTreeMap::new(),
            overlap: false,
            required: false,
            create_index: 0,
        }
    }

    pub fn with_array_size(mut self, array_size: i64) -> Self {
        self.array_size = Some(array_size);
        self
    }

    pub fn with_id_value(mut self, id_value: Value) -> Self {
        self.id_value = Some(id_value);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Little-endian integer that does not sit on whole aligned bytes.
    pub fn little_endian_bit_field(&self) -> bool {
        self.endianness == Endianness::Little
            && self.data_type.is_integer()
            && !(self.bit_offset % 8 == 0 && matches!(self.bit_size, 8 | 16 | 32 | 64))
    }

    /// First bit after this item, used by the overlap check. Variable sized
    /// items return their (non-positive) size, i.e. "the end".
    pub(crate) fn next_bit_offset(&self) -> i64 {
        if let Some(array_size) = self.array_size {
            return if array_size > 0 {
                self.bit_offset + array_size
            } else {
                array_size
            };
        }
        if self.bit_offset > 0 && self.little_endian_bit_field() {
            // bit_offset names the most significant bit of the field.
            let remaining = 8 - (self.bit_offset % 8);
            if self.bit_size > remaining {
                return self.bit_offset + remaining;
            }
        }
        if self.bit_size > 0 {
            self.bit_offset + self.bit_size
        } else {
            self.bit_size
        }
    }

    /// Read this item from `buffer`. DERIVED items have no bits and read as
    /// `None`.
    pub fn read(&self, buffer: &[u8]) -> Result<Option<Value>> {
        if self.data_type == DataType::Derived {
            return Ok(None);
        }
        let value = match self.array_size {
            Some(array_size) => Value::Array(BinaryAccessor::read_array(
                self.bit_offset,
                self.bit_size,
                self.data_type,
                array_size,
                buffer,
                self.endianness,
            )?),
            None => BinaryAccessor::read(
                self.bit_offset,
                self.bit_size,
                self.data_type,
                buffer,
                self.endianness,
            )?,
        };
        Ok(Some(value))
    }

    /// Write `value` into `buffer` honouring the item's overflow policy.
    pub fn write(&self, value: &Value, buffer: &mut Vec<u8>) -> Result<()> {
        if self.data_type == DataType::Derived {
            return Ok(());
        }
        match (self.array_size, value) {
            (Some(array_size), Value::Array(values)) => BinaryAccessor::write_array(
                values,
                self.bit_offset,
                self.bit_size,
                self.data_type,
                array_size,
                buffer,
                self.endianness,
                self.overflow,
            )?,
            (Some(array_size), single) => BinaryAccessor::write_array(
                std::slice::from_ref(single),
                self.bit_offset,
                self.bit_size,
                self.data_type,
                array_size,
                buffer,
                self.endianness,
                self.overflow,
            )?,
            (None, value) => BinaryAccessor::write(
                value,
                self.bit_offset,
                self.bit_size,
                self.data_type,
                buffer,
                self.endianness,
                self.overflow,
            )?,
        }
        Ok(())
    }

    /// Name of the state matching `value`, if any.
    pub fn state_name(&self, value: &Value) -> Option<&str> {
        self.states
            .iter()
            .find(|state| &state.value == value)
            .map(|state| state.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_bit_offset_for_little_endian_bitfield() {
        let item = Item::new("FIELD", 12, 12, DataType::Uint, Endianness::Little);
        assert!(item.little_endian_bit_field());
        assert_eq!(item.next_bit_offset(), 16);

        let word = Item::new("WORD", 16, 16, DataType::Uint, Endianness::Little);
        assert!(!word.little_endian_bit_field());
        assert_eq!(word.next_bit_offset(), 32);

        let rest = Item::new("REST", 32, 0, DataType::Block, Endianness::Big);
        assert_eq!(rest.next_bit_offset(), 0);
    }

    #[test]
    fn test_derived_items_read_none() {
        let item = Item::new("CALC", 0, 0, DataType::Derived, Endianness::Big);
        assert_eq!(item.read(&[1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn test_array_item_read_write() {
        let item = Item::new("ARR", 8, 8, DataType::Uint, Endianness::Big).with_array_size(24);
        let mut buffer = vec![0u8; 4];
        item.write(
            &Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            &mut buffer,
        )
        .unwrap();
        assert_eq!(buffer, vec![0, 1, 2, 3]);
        assert_eq!(
            item.read(&buffer).unwrap(),
            Some(Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn test_state_lookup() {
        let mut item = Item::new("MODE", 0, 8, DataType::Uint, Endianness::Big);
        item.states.push(ItemState {
            name: "SAFE".to_string(),
            value: Value::Int(0),
            color: None,
            hazardous: None,
        });
        assert_eq!(item.state_name(&Value::Int(0)), Some("SAFE"));
        assert_eq!(item.state_name(&Value::Int(1)), None);
    }
}
