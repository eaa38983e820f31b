use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, PacketError, Result};
use crate::parser::{ConfigLine, ConfigParser};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A target's folder: `target.txt` settings plus the definition files to
/// compile.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub dir: PathBuf,
    /// Library files named by `REQUIRE`, resolved against `lib/`.
    pub requires: Vec<PathBuf>,
    pub ignored_parameters: Vec<String>,
    pub ignored_items: Vec<String>,
    /// Definition files in processing order.
    pub cmd_tlm_files: Vec<PathBuf>,
    pub cmd_unique_id_mode: bool,
    pub tlm_unique_id_mode: bool,
    pub language: Option<String>,
    /// `target_id.txt`, else a hex FNV-1a hash of the definition files.
    pub id: String,
}

impl Target {
    /// Load target `name` from `<base_dir>/<NAME>`.
    pub fn new(name: &str, base_dir: &Path) -> Result<Self> {
        let name = name.to_ascii_uppercase();
        let dir = base_dir.join(&name);
        if !dir.is_dir() {
            return Err(PacketError::TargetNotFound(dir));
        }

        let mut target = Self {
            name,
            dir,
            requires: Vec::new(),
            ignored_parameters: Vec::new(),
            ignored_items: Vec::new(),
            cmd_tlm_files: Vec::new(),
            cmd_unique_id_mode: false,
            tlm_unique_id_mode: false,
            language: None,
            id: String::new(),
        };

        let target_txt = target.dir.join("target.txt");
        let mut explicit = Vec::new();
        if target_txt.is_file() {
            for line in ConfigParser::new().parse_file(&target_txt)? {
                if let Some(file) = target.process_line(&line)? {
                    explicit.push(file);
                }
            }
        }

        let cmd_tlm = target.dir.join("cmd_tlm");
        let mut discovered = Vec::new();
        if cmd_tlm.is_dir() {
            collect_txt_files(&cmd_tlm, &mut discovered)?;
            discovered.sort();
        }
        target.cmd_tlm_files = if explicit.is_empty() {
            discovered
        } else {
            let partials = discovered.into_iter().filter(|path| is_partial(path));
            let mut files = explicit;
            for partial in partials {
                if !files.contains(&partial) {
                    files.push(partial);
                }
            }
            files
        };

        target.id = match std::fs::read_to_string(target.dir.join("target_id.txt")) {
            Ok(id) => id.trim().to_string(),
            Err(_) => target.content_hash()?,
        };
        debug!(
            target = %target.name,
            files = target.cmd_tlm_files.len(),
            id = %target.id,
            "loaded target"
        );
        Ok(target)
    }

    /// Apply one `target.txt` line. Returns an explicitly listed definition
    /// file.
    fn process_line(&mut self, line: &ConfigLine) -> std::result::Result<Option<PathBuf>, ConfigError> {
        let keyword = line.keyword.as_str();
        match keyword {
            "REQUIRE" => {
                let usage = "REQUIRE <FILENAME>";
                line.verify_num_parameters(1, Some(1), usage)?;
                self.requires.push(self.dir.join("lib").join(&line.params[0]));
            }
            "IGNORE_PARAMETER" | "IGNORE_ITEM" => {
                let usage = format!("{keyword} <NAME>");
                line.verify_num_parameters(1, Some(1), &usage)?;
                let name = line.params[0].to_ascii_uppercase();
                if keyword == "IGNORE_PARAMETER" {
                    self.ignored_parameters.push(name);
                } else {
                    self.ignored_items.push(name);
                }
            }
            "COMMANDS" | "TELEMETRY" => {
                let usage = format!("{keyword} <FILENAME>");
                line.verify_num_parameters(1, Some(1), &usage)?;
                let path = self.dir.join("cmd_tlm").join(&line.params[0]);
                if !path.is_file() {
                    return Err(line.error(format!("{} not found", line.params[0]), usage));
                }
                return Ok(Some(path));
            }
            "CMD_UNIQUE_ID_MODE" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                self.cmd_unique_id_mode = true;
            }
            "TLM_UNIQUE_ID_MODE" => {
                line.verify_num_parameters(0, Some(0), keyword)?;
                self.tlm_unique_id_mode = true;
            }
            "LANGUAGE" => {
                line.verify_num_parameters(1, Some(1), "LANGUAGE <python | ruby>")?;
                self.language = Some(line.params[0].to_ascii_lowercase());
            }
            _ => {
                return Err(line.error(format!("Unknown keyword '{keyword}'"), ""));
            }
        }
        Ok(None)
    }

    fn content_hash(&self) -> Result<String> {
        let mut hash = FNV_OFFSET_BASIS;
        for file in &self.cmd_tlm_files {
            hash = fnv1a(hash, &std::fs::read(file)?);
        }
        Ok(format!("{hash:016x}"))
    }
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('_'))
}

fn collect_txt_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_txt_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "txt") {
            files.push(path);
        }
    }
    Ok(())
}
