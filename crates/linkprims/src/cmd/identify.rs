use std::path::Path;

use linkprims_packet::parser::hex_to_bytes;
use linkprims_packet::{System, Value};
use serde::Serialize;

use crate::cmd::IdentifyArgs;
use crate::exit::{io_error, packet_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{hex_preview, print_rows, OutputFormat};

const PREVIEW_BYTES: usize = 36;

#[derive(Serialize)]
struct IdentifyOutput {
    identified: bool,
    target: Option<String>,
    packet: Option<String>,
    length: usize,
    items: Vec<ItemValue>,
}

#[derive(Serialize)]
struct ItemValue {
    name: String,
    value: Option<Value>,
}

pub fn run(args: IdentifyArgs, format: OutputFormat) -> CliResult<i32> {
    let buffer = hex_to_bytes(&args.hex)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid hex bytes: {}", args.hex)))?;
    let targets = if args.targets.is_empty() {
        discover_targets(&args.definitions)?
    } else {
        args.targets
    };
    let system = System::new(&targets, &args.definitions)
        .map_err(|err| packet_error("compiling definitions failed", err))?;

    let Some(packet) = system.identify(&buffer, &targets) else {
        let out = IdentifyOutput {
            identified: false,
            target: None,
            packet: None,
            length: buffer.len(),
            items: Vec::new(),
        };
        let rows = vec![vec![
            "UNKNOWN".to_string(),
            "UNKNOWN".to_string(),
            hex_preview(&buffer, PREVIEW_BYTES),
        ]];
        print_rows(&out, &["TARGET", "PACKET", "DATA"], rows, format);
        return Ok(DATA_INVALID);
    };

    let items = packet
        .read_all()
        .map_err(|err| packet_error("reading packet items failed", err))?
        .into_iter()
        .map(|(name, value)| ItemValue { name, value })
        .collect::<Vec<_>>();
    let target = packet.target_name.clone().unwrap_or_default();
    let name = packet.packet_name.clone().unwrap_or_default();
    let rows = items
        .iter()
        .map(|item| {
            vec![
                target.clone(),
                name.clone(),
                item.name.clone(),
                item.value.as_ref().map(ToString::to_string).unwrap_or_default(),
            ]
        })
        .collect();
    let out = IdentifyOutput {
        identified: true,
        target: Some(target),
        packet: Some(name),
        length: buffer.len(),
        items,
    };
    print_rows(&out, &["TARGET", "PACKET", "ITEM", "VALUE"], rows, format);
    Ok(SUCCESS)
}

/// Every folder directly under `dir`, sorted.
fn discover_targets(dir: &Path) -> CliResult<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| io_error(&format!("reading {}", dir.display()), err))?;
    let mut targets = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| io_error("reading definitions", err))?;
        if entry.path().is_dir() {
            targets.push(entry.file_name().to_string_lossy().to_ascii_uppercase());
        }
    }
    targets.sort();
    if targets.is_empty() {
        return Err(CliError::new(
            USAGE,
            format!("no target folders found in {}", dir.display()),
        ));
    }
    Ok(targets)
}
