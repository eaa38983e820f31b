use linkprims_packet::{PacketKind, System};
use serde::Serialize;

use crate::cmd::PacketsArgs;
use crate::exit::{packet_error, CliResult, SUCCESS};
use crate::output::{print_rows, OutputFormat};

#[derive(Serialize)]
struct PacketRow {
    target: String,
    packet: String,
    kind: PacketKind,
    length: usize,
    items: usize,
    id_items: Vec<String>,
    description: Option<String>,
}

pub fn run(args: PacketsArgs, format: OutputFormat) -> CliResult<i32> {
    let system = System::new(&args.targets, &args.definitions)
        .map_err(|err| packet_error("compiling definitions failed", err))?;
    let kind = if args.commands {
        PacketKind::Command
    } else {
        PacketKind::Telemetry
    };

    let mut packets = Vec::new();
    for target in system.target_names() {
        let defs = match system.packets(kind, &target) {
            Ok(defs) => defs,
            // A target may define only commands or only telemetry.
            Err(linkprims_packet::PacketError::UnknownTarget { .. }) => continue,
            Err(err) => return Err(packet_error("listing packets failed", err)),
        };
        packets.extend(defs.iter().map(|def| PacketRow {
            target: def.target_name.clone(),
            packet: def.packet_name.clone(),
            kind,
            length: def.defined_length(),
            items: def.sorted_items().len(),
            id_items: def.id_items().map(|item| item.name.clone()).collect(),
            description: def.description.clone(),
        }));
    }

    let rows = packets
        .iter()
        .map(|row| {
            vec![
                row.target.clone(),
                row.packet.clone(),
                row.length.to_string(),
                row.items.to_string(),
                row.id_items.join(","),
                row.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_rows(
        &packets,
        &["TARGET", "PACKET", "LENGTH", "ITEMS", "ID_ITEMS", "DESCRIPTION"],
        rows,
        format,
    );
    for warning in system.warnings() {
        tracing::warn!(%warning, "definition warning");
    }
    Ok(SUCCESS)
}
