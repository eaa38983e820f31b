use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use linkprims_packet::{Packet, PacketDef, PacketKind, System};

use crate::args::Args;
use crate::burst::{BurstCore, Reduced};
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol};

/// Frames fixed-length packets by identifying each one against the
/// definitions of the interface's targets.
#[derive(Debug)]
pub struct FixedProtocol {
    core: BurstCore,
    min_id_size: usize,
    kind: PacketKind,
    unknown_raise: bool,
    system: Option<Arc<System>>,
    target_names: Vec<String>,
    identified: Option<(Arc<PacketDef>, SystemTime)>,
}

impl FixedProtocol {
    pub fn new(
        min_id_size: usize,
        discard_leading_bytes: usize,
        sync_pattern: Option<Vec<u8>>,
        telemetry: bool,
        fill_fields: bool,
        unknown_raise: bool,
        allow_empty_data: Option<bool>,
    ) -> Self {
        Self {
            core: BurstCore::new(discard_leading_bytes, sync_pattern, fill_fields, allow_empty_data),
            min_id_size,
            kind: if telemetry {
                PacketKind::Telemetry
            } else {
                PacketKind::Command
            },
            unknown_raise,
            system: None,
            target_names: Vec::new(),
            identified: None,
        }
    }

    /// `min_id_size discard_leading_bytes sync_pattern telemetry fill_fields
    /// unknown_raise allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("FIXED", values, 7)?;
        let min_id_size = args.required(0, "min_id_size")?;
        let min_id_size = linkprims_packet::parser::parse_int(min_id_size)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                ProtocolError::invalid("FIXED", format!("invalid min_id_size {min_id_size}"))
            })?;
        Ok(Self::new(
            min_id_size,
            args.size(1, "discard_leading_bytes", 0)?,
            args.hex(2, "sync_pattern")?,
            args.flag(3, "telemetry", true)?,
            args.flag(4, "fill_fields", false)?,
            args.flag(5, "unknown_raise", false)?,
            args.opt_flag(6, "allow_empty_data")?,
        ))
    }
}

struct Identifier<'a> {
    system: Option<&'a System>,
    kind: PacketKind,
    target_names: &'a [String],
    min_id_size: usize,
    unknown_raise: bool,
    identified: &'a mut Option<(Arc<PacketDef>, SystemTime)>,
}

impl Identifier<'_> {
    fn reduce(&mut self, data: &mut BytesMut, discard: usize) -> Result<Reduced> {
        if data.len() < self.min_id_size {
            return Ok(Reduced::Stop);
        }
        let found = match self.system {
            Some(system) if !self.target_names.is_empty() && data.len() >= discard => {
                system.identify_kind(self.kind, &data[discard..], self.target_names)
            }
            _ => None,
        };

        match found {
            Some(def) => {
                let length = def.defined_length() + discard;
                if length > data.len() {
                    return Ok(Reduced::Stop);
                }
                *self.identified = Some((def, SystemTime::now()));
                Ok(Reduced::Frame(data.split_to(length)))
            }
            None if self.unknown_raise => Err(ProtocolError::Framing(
                "Unknown data received by FixedProtocol".to_string(),
            )),
            None => {
                *self.identified = None;
                Ok(Reduced::Frame(data.split()))
            }
        }
    }
}

impl Protocol for FixedProtocol {
    fn name(&self) -> &'static str {
        "FIXED"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
        self.system = link.system.clone();
        self.target_names = match self.kind {
            PacketKind::Telemetry => link.tlm_target_names.clone(),
            PacketKind::Command => link.cmd_target_names.clone(),
        };
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        let mut identifier = Identifier {
            system: self.system.as_deref(),
            kind: self.kind,
            target_names: &self.target_names,
            min_id_size: self.min_id_size,
            unknown_raise: self.unknown_raise,
            identified: &mut self.identified,
        };
        self.core
            .read(data, at_tail, |buffer, discard| identifier.reduce(buffer, discard))
    }

    fn read_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        match &self.identified {
            Some((def, received_time)) => {
                packet.set_definition(def.clone());
                packet.received_time = Some(*received_time);
            }
            None => {
                packet.clear_identity();
                packet.received_time = None;
            }
        }
        Ok(Outcome::Ready(packet))
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        self.core.write_packet(&mut packet)?;
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        Ok(Outcome::Ready(self.core.write_data(data)?))
    }

    fn reset(&mut self) {
        self.core.reset();
        self.identified = None;
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;

    const INST_TLM: &str = r#"
TELEMETRY INST STATUS BIG_ENDIAN
  APPEND_ID_ITEM PKTID 8 UINT 1
  APPEND_ITEM VALUE 16 UINT
TELEMETRY INST EVENT BIG_ENDIAN
  APPEND_ID_ITEM PKTID 8 UINT 2
  APPEND_ITEM CODE 32 UINT
"#;

    fn make_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "linkprims-fixed-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn system(dir: &Path) -> Arc<System> {
        let path = dir.join("INST/cmd_tlm/tlm.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, INST_TLM).unwrap();
        Arc::new(System::new(&["INST"], dir).unwrap())
    }

    fn attached(system: Arc<System>, unknown_raise: bool) -> FixedProtocol {
        let mut protocol = FixedProtocol::new(1, 0, None, true, false, unknown_raise, None);
        protocol.attach(&LinkInfo {
            name: "INST_INT".to_string(),
            tlm_target_names: vec!["INST".to_string()],
            system: Some(system),
            ..LinkInfo::default()
        });
        protocol
    }

    #[test]
    fn test_cuts_identified_packets() {
        let dir = make_temp_dir("cut");
        let mut protocol = attached(system(&dir), false);

        let input = [0x01, 0x00, 0x2A, 0x02, 0x00, 0x00];
        let Outcome::Ready(frame) = protocol.read_data(BytesMut::from(&input[..]), true).unwrap()
        else {
            panic!("expected a frame");
        };
        assert_eq!(frame.as_ref(), &[0x01, 0x00, 0x2A]);
        let Outcome::Ready(packet) = protocol.read_packet(Packet::raw(frame.to_vec())).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!(packet.packet_name.as_deref(), Some("STATUS"));
        assert!(packet.received_time.is_some());

        // EVENT needs five bytes; only three are buffered.
        assert_eq!(protocol.read_data(BytesMut::new(), true).unwrap(), Outcome::Stop);
        let Outcome::Ready(frame) = protocol
            .read_data(BytesMut::from(&[0x00, 0x07][..]), true)
            .unwrap()
        else {
            panic!("expected a frame");
        };
        assert_eq!(frame.as_ref(), &[0x02, 0x00, 0x00, 0x00, 0x07]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unknown_data() {
        let dir = make_temp_dir("unknown");
        let system = system(&dir);

        let mut lenient = attached(system.clone(), false);
        assert_eq!(
            lenient.read_data(BytesMut::from(&[0x09, 0x01][..]), true).unwrap(),
            Outcome::Ready(BytesMut::from(&[0x09, 0x01][..]))
        );
        let Outcome::Ready(packet) = lenient.read_packet(Packet::raw(vec![0x09, 0x01])).unwrap()
        else {
            panic!("expected a packet");
        };
        assert!(packet.packet_name.is_none());

        let mut strict = attached(system, true);
        let err = strict
            .read_data(BytesMut::from(&[0x09, 0x01][..]), true)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown data received by FixedProtocol");
        std::fs::remove_dir_all(dir).unwrap();
    }
}
