use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use tracing::{debug, info};

use crate::error::{PacketError, Result};
use crate::packet::{Packet, PacketDef, PacketKind};
use crate::packet_config::{read_id_key, PacketConfig};
use crate::target::Target;

static INSTANCE: Mutex<Option<Arc<System>>> = Mutex::new(None);

/// Limits applied while loading definition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    /// Maximum bytes allowed per definition file.
    pub max_definition_file_size: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_definition_file_size: 16 * 1024 * 1024,
        }
    }
}

/// Compiled command and telemetry definitions for a set of targets.
#[derive(Debug)]
pub struct System {
    targets: BTreeMap<String, Target>,
    config: RwLock<PacketConfig>,
}

impl System {
    /// Build an unshared system from `<dir>/<TARGET>` folders.
    pub fn new<S: AsRef<str>>(target_names: &[S], dir: &Path) -> Result<Self> {
        Self::with_config(target_names, dir, SystemConfig::default())
    }

    pub fn with_config<S: AsRef<str>>(
        target_names: &[S],
        dir: &Path,
        system_config: SystemConfig,
    ) -> Result<Self> {
        let mut targets = BTreeMap::new();
        let mut config = PacketConfig::new();

        for name in target_names {
            let target = Target::new(name.as_ref(), dir)?;
            let mut errors = Vec::new();
            for file in &target.cmd_tlm_files {
                let size = std::fs::metadata(file)?.len();
                if size > system_config.max_definition_file_size {
                    return Err(PacketError::FileTooLarge {
                        path: file.clone(),
                        size,
                        max: system_config.max_definition_file_size,
                    });
                }
                if let Err(err) = config.process_file(file, &target.name) {
                    errors.push(format!("Error processing {}:\n{err}", file.display()));
                }
            }
            if !errors.is_empty() {
                return Err(PacketError::Definition {
                    target: target.name,
                    errors,
                });
            }
            debug!(target = %target.name, "compiled target definitions");
            targets.insert(target.name.clone(), target);
        }

        info!(
            targets = targets.len(),
            warnings = config.warnings.len(),
            "system definitions loaded"
        );
        Ok(Self {
            targets,
            config: RwLock::new(config),
        })
    }

    /// The process-wide system. The first call builds it; later calls return
    /// the same handle and ignore their arguments.
    pub fn instance<S: AsRef<str>>(target_names: &[S], dir: &Path) -> Result<Arc<Self>> {
        let mut instance = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(system) = instance.as_ref() {
            return Ok(Arc::clone(system));
        }
        let system = Arc::new(Self::new(target_names, dir)?);
        *instance = Some(Arc::clone(&system));
        Ok(system)
    }

    fn read_config(&self) -> RwLockReadGuard<'_, PacketConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of the loaded targets, sorted.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(&name.to_ascii_uppercase())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.read_config().warnings.clone()
    }

    pub fn packet(&self, kind: PacketKind, target_name: &str, packet_name: &str) -> Result<Arc<PacketDef>> {
        let config = self.read_config();
        let packets = config
            .table(kind)
            .target(target_name)
            .ok_or_else(|| PacketError::UnknownTarget {
                kind,
                target: target_name.to_ascii_uppercase(),
            })?;
        packets
            .get(packet_name)
            .cloned()
            .ok_or_else(|| PacketError::UnknownPacket {
                kind,
                target: target_name.to_ascii_uppercase(),
                packet: packet_name.to_ascii_uppercase(),
            })
    }

    /// All packets of a target in definition order.
    pub fn packets(&self, kind: PacketKind, target_name: &str) -> Result<Vec<Arc<PacketDef>>> {
        let config = self.read_config();
        let packets = config
            .table(kind)
            .target(target_name)
            .ok_or_else(|| PacketError::UnknownTarget {
                kind,
                target: target_name.to_ascii_uppercase(),
            })?;
        Ok(packets.iter().cloned().collect())
    }

    /// Identify raw telemetry. An empty `target_names` searches every target.
    pub fn identify<S: AsRef<str>>(&self, buffer: &[u8], target_names: &[S]) -> Option<Packet> {
        self.identify_kind(PacketKind::Telemetry, buffer, target_names)
            .map(|def| Packet::identified(def, buffer))
    }

    /// Find the definition matching `buffer`, trying targets in order.
    pub fn identify_kind<S: AsRef<str>>(
        &self,
        kind: PacketKind,
        buffer: &[u8],
        target_names: &[S],
    ) -> Option<Arc<PacketDef>> {
        let config = self.read_config();
        let table = config.table(kind);
        let names: Vec<String> = if target_names.is_empty() {
            table.target_names()
        } else {
            target_names
                .iter()
                .map(|name| name.as_ref().to_ascii_uppercase())
                .collect()
        };

        for name in &names {
            let Some(packets) = table.target(name) else {
                continue;
            };
            let unique_id_mode = self.targets.get(name).is_some_and(|target| match kind {
                PacketKind::Command => target.cmd_unique_id_mode,
                PacketKind::Telemetry => target.tlm_unique_id_mode,
            });
            let found = if unique_id_mode {
                packets.iter().find(|def| def.identify(buffer)).cloned()
            } else {
                packets
                    .first()
                    .and_then(|first| packets.lookup_id(&read_id_key(first, buffer)))
                    .cloned()
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Add or replace packets after construction. Nothing is removed.
    pub fn dynamic_update(&self, packets: Vec<PacketDef>, kind: PacketKind, affect_ids: bool) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        for def in packets {
            debug!(
                target = %def.target_name,
                packet = %def.packet_name,
                %kind,
                "dynamic packet update"
            );
            config.dynamic_add_packet(def, kind, affect_ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use linkprims_accessor::{DataType, Endianness, Value};

    use super::*;
    use crate::item::Item;

    const INST_TLM: &str = r#"
TELEMETRY INST HEALTH_STATUS BIG_ENDIAN
  APPEND_ID_ITEM PKTID 8 UINT 1
  APPEND_ITEM TEMP 16 UINT
TELEMETRY INST EVENT BIG_ENDIAN
  APPEND_ID_ITEM PKTID 8 UINT 2
  APPEND_ITEM CODE 8 UINT
"#;

    fn make_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "linkprims-system-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents.as_bytes()).unwrap();
    }

    #[test]
    fn test_identify_by_id_hash() {
        let dir = make_temp_dir("hash");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let system = System::new(&["INST"], &dir).unwrap();

        let packet = system.identify(&[2, 0x7F], &["INST"]).unwrap();
        assert_eq!(packet.packet_name.as_deref(), Some("EVENT"));
        assert_eq!(packet.read("CODE").unwrap(), Some(Value::Int(0x7F)));

        let packet = system.identify(&[1, 0, 42], &[] as &[&str]).unwrap();
        assert_eq!(packet.packet_name.as_deref(), Some("HEALTH_STATUS"));

        assert!(system.identify(&[9, 0, 0], &["INST"]).is_none());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_identify_unique_id_mode() {
        let dir = make_temp_dir("unique");
        write(&dir, "INST/target.txt", "TLM_UNIQUE_ID_MODE\n");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let system = System::new(&["INST"], &dir).unwrap();
        assert!(system.target("inst").unwrap().tlm_unique_id_mode);

        let packet = system.identify(&[2, 1], &["INST"]).unwrap();
        assert_eq!(packet.packet_name.as_deref(), Some("EVENT"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_lookups_and_errors() {
        let dir = make_temp_dir("lookups");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let system = System::new(&["INST"], &dir).unwrap();

        assert_eq!(system.target_names(), vec!["INST"]);
        let names: Vec<_> = system
            .packets(PacketKind::Telemetry, "INST")
            .unwrap()
            .iter()
            .map(|def| def.packet_name.clone())
            .collect();
        assert_eq!(names, vec!["HEALTH_STATUS", "EVENT"]);

        assert!(matches!(
            system.packet(PacketKind::Command, "INST", "HEALTH_STATUS"),
            Err(PacketError::UnknownTarget { .. })
        ));
        assert!(matches!(
            system.packet(PacketKind::Telemetry, "INST", "NOPE"),
            Err(PacketError::UnknownPacket { .. })
        ));
        assert!(system
            .packet(PacketKind::Telemetry, "UNKNOWN", "UNKNOWN")
            .is_ok());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_definition_errors_are_collected() {
        let dir = make_temp_dir("errors");
        write(&dir, "INST/cmd_tlm/a.txt", "TELEMETRY INST A BIG_ENDIAN\n  BOGUS\n");
        write(&dir, "INST/cmd_tlm/b.txt", "ITEM X 0 8 UINT\n");
        let err = System::new(&["INST"], &dir).unwrap_err();
        let PacketError::Definition { target, errors } = err else {
            panic!("expected definition error");
        };
        assert_eq!(target, "INST");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Error processing"));
        assert!(errors[0].contains("Unknown keyword 'BOGUS'"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_size_limit() {
        let dir = make_temp_dir("size");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let err = System::with_config(
            &["INST"],
            &dir,
            SystemConfig {
                max_definition_file_size: 16,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PacketError::FileTooLarge { max: 16, .. }));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_dynamic_update_is_additive() {
        let dir = make_temp_dir("dynamic");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let system = System::new(&["INST"], &dir).unwrap();

        let mut def = PacketDef::new("INST", "DYN", Endianness::Big);
        def.append(
            Item::new("PKTID", 0, 8, DataType::Uint, Endianness::Big).with_id_value(Value::Int(3)),
        )
        .unwrap();
        system.dynamic_update(vec![def], PacketKind::Telemetry, true);

        assert_eq!(system.packets(PacketKind::Telemetry, "INST").unwrap().len(), 3);
        let packet = system.identify(&[3], &["INST"]).unwrap();
        assert_eq!(packet.packet_name.as_deref(), Some("DYN"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_instance_is_shared() {
        let dir = make_temp_dir("instance");
        write(&dir, "INST/cmd_tlm/tlm.txt", INST_TLM);
        let first = System::instance(&["INST"], &dir).unwrap();
        let second = System::instance(&["OTHER"], &dir).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
