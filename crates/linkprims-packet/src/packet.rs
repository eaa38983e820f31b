use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use linkprims_accessor::{DataType, Endianness, Value};

use crate::error::{PacketError, Result};
use crate::item::Item;

/// Commands and telemetry live in separate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PacketKind {
    Command,
    Telemetry,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("Command"),
            Self::Telemetry => f.write_str("Telemetry"),
        }
    }
}

/// Compiled packet template.
///
/// Built by [`crate::PacketConfig`] and shared read-only behind an `Arc` once
/// finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketDef {
    pub target_name: String,
    pub packet_name: String,
    pub description: Option<String>,
    pub default_endianness: Endianness,
    items: Vec<Item>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    pub defined_length_bits: i64,
    #[serde(skip)]
    pos_bit_size: i64,
    #[serde(skip)]
    neg_bit_size: i64,
    pub fixed_size: bool,
    pub short_buffer_allowed: bool,
    pub hazardous: bool,
    pub hazardous_description: Option<String>,
    pub messages_disabled: bool,
    pub hidden: bool,
    pub disabled: bool,
    #[serde(rename = "virtual")]
    pub virtual_packet: bool,
    pub restricted: bool,
    pub ignore_overlap: bool,
    pub meta: BTreeMap<String, Vec<String>>,
    pub response: Option<(String, String)>,
    pub error_response: Option<(String, String)>,
    #[serde(skip)]
    next_create_index: usize,
}

impl PacketDef {
    pub fn new(
        target_name: impl Into<String>,
        packet_name: impl Into<String>,
        default_endianness: Endianness,
    ) -> Self {
        Self {
            target_name: target_name.into().to_ascii_uppercase(),
            packet_name: packet_name.into().to_ascii_uppercase(),
            description: None,
            default_endianness,
            items: Vec::new(),
            index: HashMap::new(),
            defined_length_bits: 0,
            pos_bit_size: 0,
            neg_bit_size: 0,
            fixed_size: true,
            short_buffer_allowed: false,
            hazardous: false,
            hazardous_description: None,
            messages_disabled: false,
            hidden: false,
            disabled: false,
            virtual_packet: false,
            restricted: false,
            ignore_overlap: false,
            meta: BTreeMap::new(),
            response: None,
            error_response: None,
            next_create_index: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Items ordered by bit offset; negative (end-relative) offsets sort last.
    pub fn sorted_items(&self) -> &[Item] {
        &self.items
    }

    /// Items with an identification value, in bit order.
    pub fn id_items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|item| item.id_value.is_some())
    }

    pub fn has_id_items(&self) -> bool {
        self.id_items().next().is_some()
    }

    /// Defined length in whole bytes.
    pub fn defined_length(&self) -> usize {
        ((self.defined_length_bits + 7) / 8) as usize
    }

    pub fn get_item(&self, name: &str) -> Result<&Item> {
        self.index
            .get(&name.to_ascii_uppercase())
            .map(|i| &self.items[*i])
            .ok_or_else(|| PacketError::UnknownItem(name.to_string()))
    }

    pub fn get_item_mut(&mut self, name: &str) -> Result<&mut Item> {
        match self.index.get(&name.to_ascii_uppercase()) {
            Some(i) => Ok(&mut self.items[*i]),
            None => Err(PacketError::UnknownItem(name.to_string())),
        }
    }

    pub fn contains_item(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_uppercase())
    }

    /// Add an item at its own bit offset, replacing any item of the same name.
    pub fn define(&mut self, mut item: Item) -> &Item {
        item.name = item.name.to_ascii_uppercase();
        if let Some(existing) = self.index.get(&item.name).copied() {
            self.items.remove(existing);
        }
        item.create_index = self.next_create_index;
        self.next_create_index += 1;

        if (item.data_type != DataType::Derived && item.bit_size <= 0)
            || item.array_size.is_some_and(|size| size <= 0)
        {
            self.fixed_size = false;
        }

        let mut update_needed = false;
        if item.bit_offset >= 0 {
            if item.bit_size > 0 {
                let end = match item.array_size {
                    Some(size) if size >= 0 => item.bit_offset + size,
                    Some(_) => item.bit_offset,
                    None => item.bit_offset + item.bit_size,
                };
                if end > self.pos_bit_size {
                    self.pos_bit_size = end;
                    update_needed = true;
                }
            } else if item.bit_offset > self.pos_bit_size {
                self.pos_bit_size = item.bit_offset;
                update_needed = true;
            }
        } else if item.bit_offset.abs() > self.neg_bit_size {
            self.neg_bit_size = item.bit_offset.abs();
            update_needed = true;
        }
        if update_needed {
            self.defined_length_bits = self.pos_bit_size + self.neg_bit_size;
        }

        let name = item.name.clone();
        self.items.push(item);
        self.items
            .sort_by_key(|item| (item.bit_offset < 0, item.bit_offset, item.create_index));
        self.reindex();
        &self.items[self.index[&name]]
    }

    /// Add an item after the last defined bit. DERIVED items go at offset 0.
    pub fn append(&mut self, mut item: Item) -> Result<&Item> {
        if !self.fixed_size {
            return Err(PacketError::AppendAfterVariable);
        }
        item.bit_offset = if item.data_type == DataType::Derived {
            0
        } else {
            self.defined_length_bits
        };
        Ok(self.define(item))
    }

    pub fn delete_item(&mut self, name: &str) -> Result<Item> {
        let index = self
            .index
            .get(&name.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| PacketError::UnknownItem(name.to_string()))?;
        let item = self.items.remove(index);
        self.reindex();
        Ok(item)
    }

    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.name.clone(), i))
            .collect();
    }

    /// Describe every undeclared bit overlap between consecutive items.
    ///
    /// Items flagged OVERLAP are exempt. DERIVED items own no bits.
    pub fn check_bit_offsets(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut expected_next: Option<i64> = None;
        let mut previous: Option<&Item> = None;
        for item in self.items.iter().filter(|i| i.data_type != DataType::Derived) {
            if let (Some(expected), Some(prev)) = (expected_next, previous) {
                if item.bit_offset < expected && !item.overlap {
                    problems.push(format!(
                        "Bit definition overlap at bit offset {} for packet {} {} items {} and {}",
                        item.bit_offset, self.target_name, self.packet_name, item.name, prev.name
                    ));
                }
            }
            expected_next = Some(item.next_bit_offset());
            previous = Some(item);
        }
        problems
    }

    /// True when `buffer` carries this packet's identification values.
    ///
    /// Virtual packets never identify; packets without id items match
    /// anything.
    pub fn identify(&self, buffer: &[u8]) -> bool {
        if self.virtual_packet {
            return false;
        }
        self.id_items().all(|item| match item.read(buffer) {
            Ok(value) => value.as_ref() == item.id_value.as_ref(),
            Err(_) => false,
        })
    }

    /// Values of the id items as found in `buffer`; unreadable items are
    /// `None`.
    pub fn read_id_values(&self, buffer: &[u8]) -> Vec<Option<Value>> {
        self.id_items()
            .map(|item| item.read(buffer).ok().flatten())
            .collect()
    }

    /// Key of this packet in the per-target id lookup table.
    pub fn id_key(&self) -> String {
        if self.has_id_items() {
            id_key(&self.id_items().map(|i| i.id_value.clone()).collect::<Vec<_>>())
        } else {
            CATCHALL.to_string()
        }
    }
}

/// Lookup key used for packets without id items.
pub const CATCHALL: &str = "CATCHALL";

pub(crate) fn id_key(values: &[Option<Value>]) -> String {
    format!("{values:?}")
}

/// A packet instance: an owned byte buffer plus, once identified, the
/// definition that describes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    def: Option<Arc<PacketDef>>,
    pub buffer: Vec<u8>,
    pub target_name: Option<String>,
    pub packet_name: Option<String>,
    pub received_time: Option<SystemTime>,
    /// Replayed from storage rather than received live.
    pub stored: bool,
    pub extra: Option<serde_json::Value>,
}

impl Packet {
    /// Unidentified bytes straight off a link.
    pub fn raw(buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: buffer.into(),
            ..Self::default()
        }
    }

    /// A fresh instance of `def` with a zeroed buffer of the defined length.
    pub fn from_def(def: Arc<PacketDef>) -> Self {
        let buffer = vec![0u8; def.defined_length()];
        Self::identified(def, buffer)
    }

    /// Attach `def` to existing bytes.
    pub fn identified(def: Arc<PacketDef>, buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            target_name: Some(def.target_name.clone()),
            packet_name: Some(def.packet_name.clone()),
            def: Some(def),
            buffer: buffer.into(),
            ..Self::default()
        }
    }

    pub fn definition(&self) -> Option<&Arc<PacketDef>> {
        self.def.as_ref()
    }

    pub fn set_definition(&mut self, def: Arc<PacketDef>) {
        self.target_name = Some(def.target_name.clone());
        self.packet_name = Some(def.packet_name.clone());
        self.def = Some(def);
    }

    /// Forget any identification.
    pub fn clear_identity(&mut self) {
        self.def = None;
        self.target_name = None;
        self.packet_name = None;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn require_def(&self) -> Result<Arc<PacketDef>> {
        self.def.clone().ok_or_else(|| {
            PacketError::Undefined(format!(
                "{} {}",
                self.target_name.as_deref().unwrap_or("UNKNOWN"),
                self.packet_name.as_deref().unwrap_or("UNKNOWN")
            ))
        })
    }

    /// Read a named item from the buffer.
    pub fn read(&self, name: &str) -> Result<Option<Value>> {
        let def = self.require_def()?;
        def.get_item(name)?.read(&self.buffer)
    }

    /// Write a named item into the buffer.
    pub fn write(&mut self, name: &str, value: &Value) -> Result<()> {
        let def = self.require_def()?;
        def.get_item(name)?.write(value, &mut self.buffer)
    }

    /// Read every item as `(name, value)` pairs in bit order.
    pub fn read_all(&self) -> Result<Vec<(String, Option<Value>)>> {
        let def = self.require_def()?;
        def.sorted_items()
            .iter()
            .map(|item| Ok((item.name.clone(), item.read(&self.buffer)?)))
            .collect()
    }

    /// Write every item's default value (ID parameters included).
    pub fn restore_defaults(&mut self) -> Result<()> {
        let def = self.require_def()?;
        if self.buffer.len() < def.defined_length() {
            self.buffer.resize(def.defined_length(), 0);
        }
        for item in def.sorted_items() {
            if let Some(default) = &item.default {
                if matches!(default, Value::Array(values) if values.is_empty()) {
                    continue;
                }
                item.write(default, &mut self.buffer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> PacketDef {
        let mut def = PacketDef::new("inst", "health", Endianness::Big);
        def.append(
            Item::new("APID", 0, 16, DataType::Uint, Endianness::Big).with_id_value(Value::Int(1)),
        )
        .unwrap();
        def.append(Item::new("TEMP", 0, 16, DataType::Int, Endianness::Big))
            .unwrap();
        def.append(Item::new("TAIL", 0, -16, DataType::Block, Endianness::Big))
            .unwrap();
        def
    }

    #[test]
    fn test_append_lays_items_out_in_order() {
        let def = health();
        assert_eq!(def.target_name, "INST");
        assert_eq!(def.get_item("temp").unwrap().bit_offset, 16);
        assert_eq!(def.get_item("TAIL").unwrap().bit_offset, 32);
        assert_eq!(def.defined_length_bits, 32);
        assert!(!def.fixed_size);
    }

    #[test]
    fn test_append_after_variable_item_fails() {
        let mut def = health();
        let err = def
            .append(Item::new("MORE", 0, 8, DataType::Uint, Endianness::Big))
            .unwrap_err();
        assert!(matches!(err, PacketError::AppendAfterVariable));
    }

    #[test]
    fn test_negative_offsets_count_into_defined_length() {
        let mut def = PacketDef::new("INST", "CRC", Endianness::Big);
        def.define(Item::new("HDR", 0, 16, DataType::Uint, Endianness::Big));
        def.define(Item::new("CRC", -16, 16, DataType::Uint, Endianness::Big));
        assert_eq!(def.defined_length_bits, 32);
        assert_eq!(def.sorted_items()[1].name, "CRC");
    }

    #[test]
    fn test_redefine_replaces_item() {
        let mut def = PacketDef::new("INST", "P", Endianness::Big);
        def.define(Item::new("A", 0, 8, DataType::Uint, Endianness::Big));
        def.define(Item::new("A", 8, 8, DataType::Uint, Endianness::Big));
        assert_eq!(def.sorted_items().len(), 1);
        assert_eq!(def.get_item("A").unwrap().bit_offset, 8);
        def.delete_item("a").unwrap();
        assert!(def.get_item("A").is_err());
    }

    #[test]
    fn test_check_bit_offsets_reports_overlap() {
        let mut def = PacketDef::new("INST", "P", Endianness::Big);
        def.define(Item::new("A", 0, 16, DataType::Uint, Endianness::Big));
        def.define(Item::new("B", 8, 16, DataType::Uint, Endianness::Big));
        let problems = def.check_bit_offsets();
        assert_eq!(
            problems,
            vec!["Bit definition overlap at bit offset 8 for packet INST P items B and A"]
        );

        def.get_item_mut("B").unwrap().overlap = true;
        assert!(def.check_bit_offsets().is_empty());
    }

    #[test]
    fn test_identify_by_id_items() {
        let def = health();
        assert!(def.identify(&[0x00, 0x01, 0, 0]));
        assert!(!def.identify(&[0x00, 0x02, 0, 0]));
        assert!(!def.identify(&[0x00]));
        assert_eq!(def.id_key(), id_key(&[Some(Value::Int(1))]));
        assert_eq!(def.read_id_values(&[0x00, 0x01]), vec![Some(Value::Int(1))]);

        let mut virt = health();
        virt.virtual_packet = true;
        assert!(!virt.identify(&[0x00, 0x01, 0, 0]));
    }

    #[test]
    fn test_packet_instance_read_write() {
        let def = Arc::new(health());
        let mut packet = Packet::from_def(def);
        assert_eq!(packet.len(), 4);
        packet.write("TEMP", &Value::Int(-2)).unwrap();
        assert_eq!(packet.read("TEMP").unwrap(), Some(Value::Int(-2)));
        assert_eq!(packet.target_name.as_deref(), Some("INST"));
        assert!(Packet::raw(vec![1, 2]).read("TEMP").is_err());
    }

    #[test]
    fn test_restore_defaults_writes_id_values() {
        let mut def = PacketDef::new("INST", "CMD", Endianness::Big);
        def.append(
            Item::new("OPCODE", 0, 8, DataType::Uint, Endianness::Big)
                .with_default(Value::Int(7))
                .with_id_value(Value::Int(7)),
        )
        .unwrap();
        let mut packet = Packet::from_def(Arc::new(def));
        packet.restore_defaults().unwrap();
        assert_eq!(packet.buffer, vec![7]);
    }
}
