use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use linkprims_accessor::{DataType, Endianness, OverflowPolicy, Value};

use crate::error::{ConfigError, PacketError, Result};
use crate::item::{Item, ItemState};
use crate::packet::{id_key, PacketDef, PacketKind, CATCHALL};
use crate::parser::{
    convert_to_value, handle_defined_constants, handle_none, hex_to_bytes, parse_int, ConfigLine,
    ConfigParser,
};

/// Arrays with this many elements or more get a performance warning.
const BIG_ARRAY_SIZE: i64 = 100_000;

/// Keywords that belong to the value-conversion and limits layers. They are
/// accepted so existing definitions load, but have no effect here.
const PACKET_LEVEL_SKIPPED: &[&str] = &[
    "PROCESSOR",
    "ACCESSOR",
    "VALIDATOR",
    "TEMPLATE",
    "TEMPLATE_FILE",
    "SCREEN",
    "RELATED_ITEM",
];
const ITEM_LEVEL_SKIPPED: &[&str] = &[
    "READ_CONVERSION",
    "WRITE_CONVERSION",
    "POLY_READ_CONVERSION",
    "POLY_WRITE_CONVERSION",
    "SEG_POLY_READ_CONVERSION",
    "SEG_POLY_WRITE_CONVERSION",
    "LIMITS",
    "LIMITS_RESPONSE",
    "KEY",
    "VARIABLE_BIT_SIZE",
];
const ITEM_KEYWORDS: &[&str] = &[
    "ITEM",
    "PARAMETER",
    "ID_ITEM",
    "ID_PARAMETER",
    "ARRAY_ITEM",
    "ARRAY_PARAMETER",
    "APPEND_ITEM",
    "APPEND_PARAMETER",
    "APPEND_ID_ITEM",
    "APPEND_ID_PARAMETER",
    "APPEND_ARRAY_ITEM",
    "APPEND_ARRAY_PARAMETER",
];

/// Packets of one target, in definition order.
#[derive(Debug, Clone, Default)]
pub struct TargetPackets {
    order: Vec<String>,
    packets: HashMap<String, Arc<PacketDef>>,
    id_values: HashMap<String, Arc<PacketDef>>,
}

impl TargetPackets {
    pub fn get(&self, packet_name: &str) -> Option<&Arc<PacketDef>> {
        self.packets.get(&packet_name.to_ascii_uppercase())
    }

    /// Packets in the order they were first defined.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PacketDef>> {
        self.order.iter().filter_map(|name| self.packets.get(name))
    }

    pub fn first(&self) -> Option<&Arc<PacketDef>> {
        self.iter().next()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up the packet whose id values produced `key`, falling back to
    /// the packet without id items.
    pub fn lookup_id(&self, key: &str) -> Option<&Arc<PacketDef>> {
        self.id_values
            .get(key)
            .or_else(|| self.id_values.get(CATCHALL))
    }

    /// Insert or replace a packet. Returns true when a packet was replaced.
    pub(crate) fn insert(&mut self, def: Arc<PacketDef>) -> bool {
        let name = def.packet_name.clone();
        let replaced = self.packets.insert(name.clone(), def).is_some();
        if !replaced {
            self.order.push(name);
        }
        replaced
    }

    pub(crate) fn update_id_values(&mut self, def: &Arc<PacketDef>) {
        self.id_values
            .retain(|_, existing| existing.packet_name != def.packet_name);
        self.id_values.insert(def.id_key(), Arc::clone(def));
    }
}

/// Target name to packets, for one [`PacketKind`].
#[derive(Debug, Clone, Default)]
pub struct PacketTable {
    targets: BTreeMap<String, TargetPackets>,
}

impl PacketTable {
    pub fn target(&self, target_name: &str) -> Option<&TargetPackets> {
        self.targets.get(&target_name.to_ascii_uppercase())
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn packet(&self, target_name: &str, packet_name: &str) -> Option<&Arc<PacketDef>> {
        self.target(target_name)?.get(packet_name)
    }

    pub(crate) fn entry(&mut self, target_name: &str) -> &mut TargetPackets {
        self.targets
            .entry(target_name.to_ascii_uppercase())
            .or_default()
    }
}

/// Compiles command and telemetry definition files.
#[derive(Debug, Clone)]
pub struct PacketConfig {
    pub commands: PacketTable,
    pub telemetry: PacketTable,
    pub warnings: Vec<String>,
    current: Option<(PacketKind, PacketDef)>,
    current_item: Option<String>,
    skipping_conversion: bool,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketConfig {
    /// An empty config holding only the `UNKNOWN UNKNOWN` packets.
    pub fn new() -> Self {
        let mut config = Self {
            commands: PacketTable::default(),
            telemetry: PacketTable::default(),
            warnings: Vec::new(),
            current: None,
            current_item: None,
            skipping_conversion: false,
        };
        for kind in [PacketKind::Command, PacketKind::Telemetry] {
            let unknown = Arc::new(PacketDef::new("UNKNOWN", "UNKNOWN", Endianness::Big));
            config.table_mut(kind).entry("UNKNOWN").insert(unknown);
        }
        config
    }

    pub fn table(&self, kind: PacketKind) -> &PacketTable {
        match kind {
            PacketKind::Command => &self.commands,
            PacketKind::Telemetry => &self.telemetry,
        }
    }

    fn table_mut(&mut self, kind: PacketKind) -> &mut PacketTable {
        match kind {
            PacketKind::Command => &mut self.commands,
            PacketKind::Telemetry => &mut self.telemetry,
        }
    }

    /// Process one definition file for `target_name`. Partials (files whose
    /// name starts with `_`) are only ever included by other files.
    pub fn process_file(&mut self, path: &Path, target_name: &str) -> Result<()> {
        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('_'));
        if is_partial {
            debug!(?path, "skipping partial definition file");
            return Ok(());
        }
        let lines = ConfigParser::new().parse_file(path)?;
        self.process_lines(&lines, target_name)
    }

    /// Process definition text. `filename` is only used in error messages.
    pub fn process_str(&mut self, text: &str, filename: &str, target_name: &str) -> Result<()> {
        let lines = ConfigParser::new().parse_str(text, filename)?;
        self.process_lines(&lines, target_name)
    }

    fn process_lines(&mut self, lines: &[ConfigLine], target_name: &str) -> Result<()> {
        self.current = None;
        self.current_item = None;
        self.skipping_conversion = false;

        let target_name = target_name.to_ascii_uppercase();
        for line in lines {
            if let Err(err) = self.process_line(line, &target_name) {
                self.current = None;
                self.current_item = None;
                return Err(err);
            }
        }
        self.finish_packet()
    }

    /// Add or replace a packet after the config has been built.
    pub fn dynamic_add_packet(&mut self, def: PacketDef, kind: PacketKind, affect_ids: bool) {
        let def = Arc::new(def);
        let entry = self.table_mut(kind).entry(&def.target_name);
        entry.insert(Arc::clone(&def));
        if affect_ids {
            entry.update_id_values(&def);
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    fn finish_packet(&mut self) -> Result<()> {
        self.current_item = None;
        let Some((kind, def)) = self.current.take() else {
            return Ok(());
        };
        if !def.ignore_overlap {
            let problems = def.check_bit_offsets();
            if !problems.is_empty() {
                return Err(PacketError::Overlap(problems.join("\n")));
            }
        }
        let def = Arc::new(def);
        let entry = self.table_mut(kind).entry(&def.target_name);
        entry.insert(Arc::clone(&def));
        if !def.virtual_packet {
            entry.update_id_values(&def);
        }
        Ok(())
    }

    fn packet_mut(&mut self, line: &ConfigLine) -> std::result::Result<(PacketKind, &mut PacketDef), ConfigError> {
        match self.current.as_mut() {
            Some((kind, def)) => Ok((*kind, def)),
            None => Err(line.error(format!("No current packet for {}", line.keyword), "")),
        }
    }

    fn item_mut(&mut self, line: &ConfigLine) -> std::result::Result<(PacketKind, &mut Item), ConfigError> {
        let name = self
            .current_item
            .clone()
            .ok_or_else(|| line.error(format!("No current item for {}", line.keyword), ""))?;
        let (kind, def) = self.packet_mut(line)?;
        let item = def
            .get_item_mut(&name)
            .map_err(|err| line.error(err.to_string(), ""))?;
        Ok((kind, item))
    }

    fn process_line(&mut self, line: &ConfigLine, target_name: &str) -> Result<()> {
        let keyword = line.keyword.as_str();
        if self.skipping_conversion {
            if matches!(
                keyword,
                "GENERIC_READ_CONVERSION_END" | "GENERIC_WRITE_CONVERSION_END"
            ) {
                line.verify_num_parameters(0, Some(0), keyword)?;
                self.skipping_conversion = false;
            }
            return Ok(());
        }

        match keyword {
            "COMMAND" | "TELEMETRY" => {
                self.finish_packet()?;
                self.start_packet(line, target_name)?;
            }
            "SELECT_COMMAND" | "SELECT_TELEMETRY" => {
                self.finish_packet()?;
                self.select_packet(line, target_name)?;
            }
            "LIMITS_GROUP" | "LIMITS_GROUP_ITEM" => self.skip(line),
            kw if ITEM_KEYWORDS.contains(&kw) => {
                self.current_item = None;
                let warnings = {
                    let (kind, def) = self.packet_mut(line)?;
                    let (name, warnings) = parse_item(line, def, kind)?;
                    self.current_item = Some(name);
                    warnings
                };
                for warning in warnings {
                    self.warn(warning);
                }
            }
            "SELECT_ITEM" | "SELECT_PARAMETER" | "DELETE_ITEM" | "DELETE_PARAMETER" => {
                self.select_or_delete_item(line)?;
            }
            "META" => {
                let usage = "META <META NAME> <META VALUES (optional)>";
                line.verify_num_parameters(1, None, usage)?;
                let name = line.params[0].to_ascii_uppercase();
                let values = line.params[1..].to_vec();
                if self.current_item.is_some() {
                    self.item_mut(line)?.1.meta.insert(name, values);
                } else {
                    self.packet_mut(line)?.1.meta.insert(name, values);
                }
            }
            kw if PACKET_LEVEL_SKIPPED.contains(&kw) => {
                self.packet_mut(line)?;
                self.skip(line);
            }
            kw if ITEM_LEVEL_SKIPPED.contains(&kw) => {
                self.item_mut(line)?;
                self.skip(line);
            }
            "GENERIC_READ_CONVERSION_START" | "GENERIC_WRITE_CONVERSION_START" => {
                self.item_mut(line)?;
                line.verify_num_parameters(0, Some(2), keyword)?;
                self.skip(line);
                self.skipping_conversion = true;
            }
            "ALLOW_SHORT" | "HAZARDOUS" | "DISABLE_MESSAGES" | "HIDDEN" | "DISABLED"
            | "VIRTUAL" | "RESTRICTED" | "IGNORE_OVERLAP" | "RESPONSE" | "ERROR_RESPONSE" => {
                self.packet_modifier(line)?;
            }
            "STATE" | "REQUIRED" | "UNITS" | "FORMAT_STRING" | "DESCRIPTION"
            | "MINIMUM_VALUE" | "MAXIMUM_VALUE" | "DEFAULT_VALUE" | "OVERFLOW" | "OVERLAP" => {
                let warning = self.item_modifier(line)?;
                if let Some(warning) = warning {
                    self.warn(warning);
                }
            }
            _ => {
                return Err(line
                    .error(format!("Unknown keyword '{keyword}'"), "")
                    .into())
            }
        }
        Ok(())
    }

    fn skip(&mut self, line: &ConfigLine) {
        self.warn(format!(
            "{} is not supported and was ignored ({}:{})",
            line.keyword, line.filename, line.line_number
        ));
    }

    fn start_packet(&mut self, line: &ConfigLine, process_target: &str) -> Result<()> {
        let kind = if line.keyword == "COMMAND" {
            PacketKind::Command
        } else {
            PacketKind::Telemetry
        };
        let usage = format!(
            "{} <TARGET NAME> <PACKET NAME> <ENDIANNESS> <DESCRIPTION (Optional)>",
            line.keyword
        );
        line.verify_num_parameters(3, Some(4), &usage)?;
        line.verify_parameter_naming(2, &usage)?;

        let target_name = if process_target == "SYSTEM" {
            line.params[0].to_ascii_uppercase()
        } else {
            process_target.to_string()
        };
        let packet_name = line.params[1].to_ascii_uppercase();
        let endianness = parse_endianness(line, &line.params[2], &usage)?;

        let mut def = PacketDef::new(&target_name, &packet_name, endianness);
        if let Some(description) = line.params.get(3) {
            def.description = Some(description.clone());
        }
        if self.table(kind).packet(&target_name, &packet_name).is_some() {
            self.warn(format!("{kind} packet {target_name} {packet_name} redefined."));
        }
        self.current = Some((kind, def));
        Ok(())
    }

    fn select_packet(&mut self, line: &ConfigLine, process_target: &str) -> Result<()> {
        let usage = format!("{} <TARGET NAME> <PACKET NAME>", line.keyword);
        line.verify_num_parameters(2, Some(2), &usage)?;
        let kind = if line.keyword.contains("COMMAND") {
            PacketKind::Command
        } else {
            PacketKind::Telemetry
        };
        let target_name = if process_target == "SYSTEM" {
            line.params[0].to_ascii_uppercase()
        } else {
            process_target.to_string()
        };
        let def = self
            .table(kind)
            .packet(&target_name, &line.params[1])
            .ok_or_else(|| line.error("Packet not found", usage.as_str()))?;
        self.current = Some((kind, PacketDef::clone(def)));
        Ok(())
    }

    fn select_or_delete_item(&mut self, line: &ConfigLine) -> Result<()> {
        let (kind, def) = self.packet_mut(line)?;
        let noun = line.keyword.split('_').nth(1).unwrap_or_default();
        if kind == PacketKind::Command && noun == "ITEM" {
            return Err(line
                .error(format!("{} only applies to telemetry packets", line.keyword), "")
                .into());
        }
        if kind == PacketKind::Telemetry && noun == "PARAMETER" {
            return Err(line
                .error(format!("{} only applies to command packets", line.keyword), "")
                .into());
        }
        let usage = format!("{} <{noun} NAME>", line.keyword);
        line.verify_num_parameters(1, Some(1), &usage)?;

        let name = line.params[0].to_ascii_uppercase();
        let not_found = || {
            line.error(
                format!(
                    "{} not found in {} packet {} {}",
                    line.params[0],
                    kind.to_string().to_ascii_lowercase(),
                    def.target_name,
                    def.packet_name
                ),
                usage.as_str(),
            )
        };
        if line.keyword.starts_with("SELECT") {
            if !def.contains_item(&name) {
                return Err(not_found().into());
            }
            self.current_item = Some(name);
        } else {
            if !def.contains_item(&name) {
                return Err(not_found().into());
            }
            def.delete_item(&name)?;
            self.current_item = None;
        }
        Ok(())
    }

    fn packet_modifier(&mut self, line: &ConfigLine) -> Result<()> {
        let keyword = line.keyword.as_str();
        let (kind, def) = self.packet_mut(line)?;
        match keyword {
            "ALLOW_SHORT" => def.short_buffer_allowed = true,
            "HAZARDOUS" => {
                line.verify_num_parameters(0, Some(1), "HAZARDOUS <HAZARDOUS DESCRIPTION (Optional)>")?;
                def.hazardous = true;
                def.hazardous_description = line.params.first().cloned();
            }
            "DISABLE_MESSAGES" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.messages_disabled = true;
            }
            "HIDDEN" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.hidden = true;
            }
            "DISABLED" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.hidden = true;
                def.disabled = true;
            }
            "VIRTUAL" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.hidden = true;
                def.disabled = true;
                def.virtual_packet = true;
            }
            "RESTRICTED" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.restricted = true;
            }
            "IGNORE_OVERLAP" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                def.ignore_overlap = true;
            }
            "RESPONSE" | "ERROR_RESPONSE" => {
                let usage = format!("{keyword} <Target Name> <Packet Name>");
                line.verify_num_parameters(2, Some(2), &usage)?;
                if kind == PacketKind::Telemetry {
                    return Err(line
                        .error(format!("{keyword} only applies to command packets"), usage)
                        .into());
                }
                let response = (
                    line.params[0].to_ascii_uppercase(),
                    line.params[1].to_ascii_uppercase(),
                );
                if keyword == "RESPONSE" {
                    def.response = Some(response);
                } else {
                    def.error_response = Some(response);
                }
            }
            _ => unreachable!("packet modifier keywords are matched by the caller"),
        }
        Ok(())
    }

    /// Apply an item modifier. Returns a warning to record, if any.
    fn item_modifier(&mut self, line: &ConfigLine) -> Result<Option<String>> {
        let keyword = line.keyword.as_str();
        let (kind, item) = self.item_mut(line)?;
        let command_only = |line: &ConfigLine| -> std::result::Result<(), ConfigError> {
            if kind == PacketKind::Telemetry {
                return Err(line.error(
                    format!("{} only applies to command parameters", line.keyword),
                    "",
                ));
            }
            Ok(())
        };

        match keyword {
            "STATE" => return parse_state(line, kind, item).map_err(Into::into),
            "REQUIRED" => {
                line.verify_num_parameters(0, Some(0), "REQUIRED")?;
                command_only(line)?;
                item.required = true;
            }
            "UNITS" => {
                line.verify_num_parameters(
                    2,
                    Some(2),
                    "UNITS <FULL UNITS NAME> <ABBREVIATED UNITS NAME>",
                )?;
                item.units_full = Some(line.params[0].clone());
                item.units = Some(line.params[1].clone());
            }
            "FORMAT_STRING" => {
                let usage = "FORMAT_STRING <PRINTF STYLE STRING>";
                line.verify_num_parameters(1, Some(1), usage)?;
                if !line.params[0].contains('%') {
                    return Err(line
                        .error(
                            format!(
                                "Invalid FORMAT_STRING specified for type {}: {}",
                                item.data_type, line.params[0]
                            ),
                            usage,
                        )
                        .into());
                }
                item.format_string = Some(line.params[0].clone());
            }
            "DESCRIPTION" => {
                line.verify_num_parameters(1, Some(1), "DESCRIPTION <DESCRIPTION>")?;
                item.description = Some(line.params[0].clone());
            }
            "MINIMUM_VALUE" | "MAXIMUM_VALUE" => {
                command_only(line)?;
                let usage = format!("{keyword} <{} VALUE>", &keyword[..7]);
                line.verify_num_parameters(1, Some(1), &usage)?;
                let value = coerce(
                    handle_defined_constants(&line.params[0], item.data_type, item.bit_size),
                    item.data_type,
                );
                if keyword == "MINIMUM_VALUE" {
                    item.minimum = Some(value);
                } else {
                    item.maximum = Some(value);
                }
            }
            "DEFAULT_VALUE" => {
                command_only(line)?;
                line.verify_num_parameters(1, Some(1), "DEFAULT_VALUE <DEFAULT VALUE>")?;
                item.default = Some(if item.data_type.is_bytes() {
                    string_value(line, 0, item.data_type)
                } else {
                    coerce(
                        handle_defined_constants(&line.params[0], item.data_type, item.bit_size),
                        item.data_type,
                    )
                });
            }
            "OVERFLOW" => {
                let usage =
                    "OVERFLOW <OVERFLOW VALUE - ERROR, ERROR_ALLOW_HEX, TRUNCATE, or SATURATE>";
                line.verify_num_parameters(1, Some(1), usage)?;
                item.overflow = line.params[0]
                    .parse::<OverflowPolicy>()
                    .map_err(|err| line.error(err.to_string(), usage))?;
            }
            "OVERLAP" => {
                line.verify_num_parameters(0, Some(0), "OVERLAP")?;
                item.overlap = true;
            }
            _ => unreachable!("item modifier keywords are matched by the caller"),
        }
        Ok(None)
    }
}

fn parse_endianness(
    line: &ConfigLine,
    value: &str,
    usage: &str,
) -> std::result::Result<Endianness, ConfigError> {
    value.parse::<Endianness>().map_err(|_| {
        line.error(
            format!(
                "Invalid endianness {}. Must be BIG_ENDIAN or LITTLE_ENDIAN.",
                value.to_ascii_uppercase()
            ),
            usage,
        )
    })
}

/// Numeric values take the type of the item they belong to.
fn coerce(value: Value, data_type: DataType) -> Value {
    match (data_type, value) {
        (DataType::Float, Value::Int(v)) => Value::Float(v as f64),
        (_, value) => value,
    }
}

/// STRING/BLOCK literal. An unquoted `0x...` value is binary data.
fn string_value(line: &ConfigLine, index: usize, data_type: DataType) -> Value {
    let raw = line.param(index);
    let bytes = if !line.is_quoted(index) && raw.to_ascii_uppercase().starts_with("0X") {
        hex_to_bytes(raw)
    } else {
        None
    };
    match (data_type, bytes) {
        (DataType::Block, Some(bytes)) => Value::Block(bytes),
        (DataType::Block, None) => Value::Block(raw.as_bytes().to_vec()),
        (_, Some(bytes)) => {
            // Match what a STRING read returns for the same bytes.
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            match String::from_utf8(bytes[..end].to_vec()) {
                Ok(s) => Value::String(s),
                Err(err) => Value::Block(err.into_bytes()),
            }
        }
        (_, None) => Value::String(raw.to_string()),
    }
}

fn item_usage(line: &ConfigLine) -> String {
    let keyword = line.keyword.as_str();
    let append = keyword.contains("APPEND");
    let array = keyword.contains("ARRAY");
    let mut usage = format!("{keyword} <ITEM NAME> ");
    if !append {
        usage.push_str("<BIT OFFSET> ");
    }
    usage.push_str(if array {
        "<ARRAY ITEM BIT SIZE> "
    } else {
        "<BIT SIZE> "
    });
    if keyword.contains("ITEM") {
        usage.push_str("<TYPE: INT/UINT/FLOAT/STRING/BLOCK/DERIVED> ");
    } else if array {
        usage.push_str("<TYPE: INT/UINT/FLOAT/STRING/BLOCK> ");
    } else {
        let type_index = if append { 2 } else { 3 };
        let data_type = line.params.get(type_index).map(|t| t.to_ascii_uppercase());
        if matches!(
            data_type.as_deref(),
            Some("INT" | "UINT" | "FLOAT" | "DERIVED")
        ) {
            usage.push_str("<TYPE: INT/UINT/FLOAT/DERIVED> <MIN VALUE> <MAX VALUE> ");
        } else {
            usage.push_str("<TYPE: STRING/BLOCK> ");
        }
        if !keyword.contains("ID") {
            usage.push_str("<DEFAULT_VALUE> ");
        }
    }
    if array {
        usage.push_str("<TOTAL ARRAY BIT SIZE> ");
    }
    if keyword.contains("ID") {
        usage.push_str(if keyword.contains("PARAMETER") {
            "<DEFAULT AND ID VALUE> "
        } else {
            "<ID VALUE> "
        });
    }
    usage.push_str("<DESCRIPTION (Optional)> <ENDIANNESS (Optional)>");
    usage
}

/// Parse an item definition line into `def`. Returns the item name and any
/// warnings.
fn parse_item(
    line: &ConfigLine,
    def: &mut PacketDef,
    kind: PacketKind,
) -> std::result::Result<(String, Vec<String>), ConfigError> {
    let keyword = line.keyword.as_str();
    let usage = item_usage(line);
    if keyword.contains("ITEM") && kind == PacketKind::Command {
        return Err(line.error("ITEM types are only valid with TELEMETRY", usage));
    }
    if keyword.contains("PARAMETER") && kind == PacketKind::Telemetry {
        return Err(line.error("PARAMETER types are only valid with COMMAND", usage));
    }

    let max_options = usage.matches('<').count();
    line.verify_num_parameters(max_options - 2, Some(max_options), &usage)?;
    line.verify_parameter_naming(1, &usage)?;

    let append = keyword.contains("APPEND");
    let array = keyword.contains("ARRAY");
    let is_id = keyword.contains("ID_");
    let params = &line.params;
    if array && (params[0].contains('[') || params[0].contains(']')) {
        return Err(line.error(
            format!("ARRAY items cannot have brackets in their name: {}", params[0]),
            usage,
        ));
    }

    let mut warnings = Vec::new();
    let name = params[0].to_ascii_uppercase();
    if def.contains_item(&name) {
        let message = format!("{} {} {} redefined.", def.target_name, def.packet_name, name);
        warnings.push(message);
    }

    let int_param = |index: usize, what: &str| {
        parse_int(&params[index])
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| line.error(format!("Invalid {what} '{}'", params[index]), usage.as_str()))
    };

    let bit_offset = if append { 0 } else { int_param(1, "bit offset")? };
    let size_index = if append { 1 } else { 2 };
    let bit_size = int_param(size_index, "bit size")?;
    let type_index = size_index + 1;
    let data_type = params[type_index]
        .parse::<DataType>()
        .map_err(|err| line.error(err.to_string(), usage.as_str()))?;
    let endianness = if params.len() >= max_options {
        parse_endianness(line, &params[max_options - 1], &usage)?
    } else {
        def.default_endianness
    };

    let mut item = Item::new(&name, bit_offset, bit_size, data_type, endianness);

    if array {
        let array_size = int_param(type_index + 1, "array size")?;
        if bit_size > 0 && array_size / bit_size >= BIG_ARRAY_SIZE {
            warnings.push(format!(
                "Performance Issue!\nIn {}:{} your definition of:\n{}\ncreates an array with {} elements. Consider creating a BLOCK if this is binary data.",
                line.filename,
                line.line_number,
                line.line,
                array_size / bit_size
            ));
        }
        item.array_size = Some(array_size);
    }

    let numeric = matches!(data_type, DataType::Int | DataType::Uint | DataType::Float);
    if kind == PacketKind::Command {
        if array {
            item.default = Some(Value::Array(Vec::new()));
        } else if numeric || data_type == DataType::Derived {
            if numeric {
                let limit = |index: usize| {
                    handle_none(&params[index])
                        .map(|v| coerce(handle_defined_constants(v, data_type, bit_size), data_type))
                };
                item.minimum = limit(type_index + 1);
                item.maximum = limit(type_index + 2);
                item.default = Some(coerce(
                    handle_defined_constants(&params[type_index + 3], data_type, bit_size),
                    data_type,
                ));
            } else {
                item.default = Some(convert_to_value(&params[type_index + 3]));
            }
        } else {
            item.default = Some(string_value(line, type_index + 1, data_type));
        }
    }

    if is_id {
        if data_type == DataType::Derived {
            return Err(line.error("DERIVED data type not allowed for Identifier", usage));
        }
        item.id_value = if keyword.contains("PARAMETER") {
            item.default.clone()
        } else if data_type.is_bytes() {
            Some(string_value(line, type_index + 1, data_type))
        } else {
            Some(coerce(
                handle_defined_constants(&params[type_index + 1], data_type, bit_size),
                data_type,
            ))
        };
    }

    if params.len() >= max_options - 1 {
        item.description = Some(params[max_options - 2].clone());
    }

    if append {
        def.append(item)
            .map_err(|err| line.error(err.to_string(), usage.as_str()))?;
    } else {
        def.define(item);
    }
    Ok((name, warnings))
}

fn parse_state(
    line: &ConfigLine,
    kind: PacketKind,
    item: &mut Item,
) -> std::result::Result<Option<String>, ConfigError> {
    let usage = "STATE <STATE NAME> <STATE VALUE> <COLOR or HAZARDOUS (Optional)> <HAZARDOUS DESCRIPTION (Optional)>";
    line.verify_num_parameters(2, Some(4), usage)?;
    let name = line.params[0].to_ascii_uppercase();
    let value = if item.data_type.is_bytes() {
        string_value(line, 1, item.data_type)
    } else {
        coerce(
            handle_defined_constants(&line.params[1], item.data_type, item.bit_size),
            item.data_type,
        )
    };

    let mut state = ItemState {
        name: name.clone(),
        value,
        color: None,
        hazardous: None,
    };
    if let Some(extra) = line.params.get(2) {
        let extra = extra.to_ascii_uppercase();
        match kind {
            PacketKind::Telemetry => {
                if !matches!(extra.as_str(), "GREEN" | "YELLOW" | "RED") {
                    return Err(line.error(
                        format!("Invalid state color {extra}. Must be one of GREEN, YELLOW, RED."),
                        usage,
                    ));
                }
                state.color = Some(extra);
            }
            PacketKind::Command => match extra.as_str() {
                "HAZARDOUS" => {
                    state.hazardous = Some(line.params.get(3).cloned().unwrap_or_default());
                }
                "DISABLE_MESSAGES" => {}
                _ => {
                    return Err(line.error(
                        format!("HAZARDOUS or DISABLE_MESSAGES expected as third parameter instead of {extra}"),
                        usage,
                    ))
                }
            },
        }
    }

    let mut warning = None;
    if let Some(existing) = item.states.iter().position(|s| s.name == name) {
        warning = Some(format!(
            "Duplicate state defined on line {}: {}",
            line.line_number, line.line
        ));
        item.states.remove(existing);
    } else if item.states.iter().any(|s| s.value == state.value) {
        warning = Some(format!(
            "Duplicate state value defined on line {}: {}",
            line.line_number, line.line
        ));
    }
    item.states.push(state);
    Ok(warning)
}

/// Hash key of `values` read from a buffer, comparable with
/// [`PacketDef::id_key`].
pub(crate) fn read_id_key(def: &PacketDef, buffer: &[u8]) -> String {
    id_key(&def.read_id_values(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TLM: &str = r#"
TELEMETRY INST HEALTH_STATUS BIG_ENDIAN "Health and status"
  APPEND_ID_ITEM CCSDSAPID 16 UINT 1 "Packet id"
  APPEND_ITEM TEMP1 16 INT "Temperature #1"
    UNITS Celsius C
    FORMAT_STRING "%0.2f"
    POLY_READ_CONVERSION 0 1
  APPEND_ITEM MODE 8 UINT
    STATE SAFE 0 GREEN
    STATE ACTIVE 1 YELLOW
TELEMETRY INST ADCS BIG_ENDIAN
  APPEND_ID_ITEM CCSDSAPID 16 UINT 2
  APPEND_ITEM Q1 32 FLOAT
"#;

    const CMD: &str = r#"
COMMAND INST COLLECT BIG_ENDIAN "Start collect"
  APPEND_ID_PARAMETER OPCODE 8 UINT 0 255 7 "Opcode"
  APPEND_PARAMETER DURATION 32 FLOAT 0.0 10.0 1 "Duration"
    UNITS Seconds s
  APPEND_PARAMETER LABEL 64 STRING "NONE" "Label"
  APPEND_PARAMETER RAW 16 BLOCK 0xBEEF
  HAZARDOUS "Moves things"
"#;

    fn compile(text: &str) -> PacketConfig {
        let mut config = PacketConfig::new();
        config.process_str(text, "inst.txt", "INST").unwrap();
        config
    }

    #[test]
    fn test_unknown_packets_predefined() {
        let config = PacketConfig::new();
        assert!(config.commands.packet("UNKNOWN", "UNKNOWN").is_some());
        assert!(config.telemetry.packet("UNKNOWN", "UNKNOWN").is_some());
    }

    #[test]
    fn test_telemetry_layout_and_modifiers() {
        let config = compile(TLM);
        let def = config.telemetry.packet("INST", "HEALTH_STATUS").unwrap();
        assert_eq!(def.description.as_deref(), Some("Health and status"));
        assert_eq!(def.defined_length(), 5);

        let temp = def.get_item("TEMP1").unwrap();
        assert_eq!(temp.bit_offset, 16);
        assert_eq!(temp.units.as_deref(), Some("C"));
        assert_eq!(temp.format_string.as_deref(), Some("%0.2f"));
        assert_eq!(temp.description.as_deref(), Some("Temperature #1"));

        let mode = def.get_item("MODE").unwrap();
        assert_eq!(mode.states.len(), 2);
        assert_eq!(mode.states[1].color.as_deref(), Some("YELLOW"));

        let id = def.get_item("CCSDSAPID").unwrap();
        assert_eq!(id.id_value, Some(Value::Int(1)));
        assert!(config
            .warnings
            .iter()
            .any(|w| w.starts_with("POLY_READ_CONVERSION is not supported")));

        let names: Vec<_> = config
            .telemetry
            .target("INST")
            .unwrap()
            .iter()
            .map(|d| d.packet_name.clone())
            .collect();
        assert_eq!(names, vec!["HEALTH_STATUS", "ADCS"]);
    }

    #[test]
    fn test_command_parameters() {
        let config = compile(CMD);
        let def = config.commands.packet("INST", "COLLECT").unwrap();
        assert!(def.hazardous);
        assert_eq!(def.hazardous_description.as_deref(), Some("Moves things"));

        let opcode = def.get_item("OPCODE").unwrap();
        assert_eq!(opcode.default, Some(Value::Int(7)));
        assert_eq!(opcode.id_value, Some(Value::Int(7)));
        assert_eq!(opcode.maximum, Some(Value::Int(255)));

        let duration = def.get_item("DURATION").unwrap();
        assert_eq!(duration.default, Some(Value::Float(1.0)));
        assert_eq!(duration.units_full.as_deref(), Some("Seconds"));

        let label = def.get_item("LABEL").unwrap();
        assert_eq!(label.default, Some(Value::String("NONE".to_string())));
        let raw = def.get_item("RAW").unwrap();
        assert_eq!(raw.default, Some(Value::Block(vec![0xBE, 0xEF])));
    }

    #[test]
    fn test_item_keyword_kind_checks() {
        let mut config = PacketConfig::new();
        let err = config
            .process_str(
                "COMMAND INST C BIG_ENDIAN\n  APPEND_ITEM X 8 UINT\n",
                "bad.txt",
                "INST",
            )
            .unwrap_err();
        let PacketError::Config(err) = err else {
            panic!("expected config error");
        };
        assert_eq!(err.message, "ITEM types are only valid with TELEMETRY");
        assert_eq!(err.line_number, 2);
    }

    #[test]
    fn test_unknown_keyword_is_error() {
        let mut config = PacketConfig::new();
        let err = config
            .process_str("TELEMETRY INST T BIG_ENDIAN\n  BOGUS 1\n", "bad.txt", "INST")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown keyword 'BOGUS'"));
    }

    #[test]
    fn test_item_without_packet_is_error() {
        let mut config = PacketConfig::new();
        let err = config
            .process_str("APPEND_ITEM X 8 UINT\n", "bad.txt", "INST")
            .unwrap_err();
        assert!(err.to_string().contains("No current packet for APPEND_ITEM"));
    }

    #[test]
    fn test_overlap_rejected_unless_allowed() {
        let overlapping = "TELEMETRY INST T BIG_ENDIAN\n  ITEM A 0 16 UINT\n  ITEM B 8 16 UINT\n";
        let mut config = PacketConfig::new();
        let err = config
            .process_str(overlapping, "t.txt", "INST")
            .unwrap_err();
        assert!(matches!(err, PacketError::Overlap(_)));

        let allowed = format!("{overlapping}    OVERLAP\n");
        compile(&allowed);
        let ignored = "TELEMETRY INST T BIG_ENDIAN\n  IGNORE_OVERLAP\n  ITEM A 0 16 UINT\n  ITEM B 8 16 UINT\n";
        compile(ignored);
    }

    #[test]
    fn test_generic_conversion_block_skipped() {
        let text = "TELEMETRY INST T BIG_ENDIAN\n  APPEND_ITEM A 8 UINT\n    GENERIC_READ_CONVERSION_START FLOAT 32\n      value * 2\n    GENERIC_READ_CONVERSION_END\n  APPEND_ITEM B 8 UINT\n";
        let config = compile(text);
        let def = config.telemetry.packet("INST", "T").unwrap();
        assert_eq!(def.get_item("B").unwrap().bit_offset, 8);
    }

    #[test]
    fn test_select_and_delete() {
        let mut config = compile(TLM);
        config
            .process_str(
                "SELECT_TELEMETRY INST HEALTH_STATUS\n  SELECT_ITEM TEMP1\n    DESCRIPTION \"Updated\"\n  DELETE_ITEM MODE\n",
                "patch.txt",
                "INST",
            )
            .unwrap();
        let def = config.telemetry.packet("INST", "HEALTH_STATUS").unwrap();
        assert_eq!(
            def.get_item("TEMP1").unwrap().description.as_deref(),
            Some("Updated")
        );
        assert!(def.get_item("MODE").is_err());

        let err = config
            .process_str("SELECT_TELEMETRY INST NOPE\n", "patch.txt", "INST")
            .unwrap_err();
        assert!(err.to_string().contains("Packet not found"));
    }

    #[test]
    fn test_id_hash_and_catchall() {
        let mut config = compile(TLM);
        config
            .process_str("TELEMETRY INST OTHER BIG_ENDIAN\n  APPEND_ITEM X 8 UINT\n", "o.txt", "INST")
            .unwrap();
        let target = config.telemetry.target("INST").unwrap();
        let health = target.get("HEALTH_STATUS").unwrap();
        let key = read_id_key(target.first().unwrap(), &[0x00, 0x02, 0, 0, 0, 0]);
        assert_eq!(target.lookup_id(&key).unwrap().packet_name, "ADCS");
        assert_eq!(target.lookup_id(&health.id_key()).unwrap().packet_name, "HEALTH_STATUS");
        let key = read_id_key(target.first().unwrap(), &[0x00, 0x09]);
        assert_eq!(target.lookup_id(&key).unwrap().packet_name, "OTHER");
    }

    #[test]
    fn test_virtual_packets_stay_out_of_id_hash() {
        let config = compile("TELEMETRY INST V BIG_ENDIAN\n  VIRTUAL\n  APPEND_ITEM X 8 UINT\n");
        let target = config.telemetry.target("INST").unwrap();
        assert!(target.get("V").unwrap().virtual_packet);
        assert!(target.lookup_id(CATCHALL).is_none());
    }

    #[test]
    fn test_system_target_takes_name_from_line() {
        let mut config = PacketConfig::new();
        config
            .process_str("TELEMETRY other pkt LITTLE_ENDIAN\n  APPEND_ITEM X 8 UINT\n", "s.txt", "SYSTEM")
            .unwrap();
        let def = config.telemetry.packet("OTHER", "PKT").unwrap();
        assert_eq!(def.default_endianness, Endianness::Little);
        assert_eq!(def.get_item("X").unwrap().endianness, Endianness::Little);
    }
}
