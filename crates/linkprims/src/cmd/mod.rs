use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod bridge;
pub mod bridge_setup;
pub mod identify;
pub mod packets;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a bridge from a configuration file until interrupted.
    Bridge(BridgeArgs),
    /// Write a default bridge configuration.
    BridgeSetup(BridgeSetupArgs),
    /// Compile target definitions and list their packets.
    Packets(PacketsArgs),
    /// Identify raw telemetry bytes against target definitions.
    Identify(IdentifyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Bridge(args) => bridge::run(args, format),
        Command::BridgeSetup(args) => bridge_setup::run(args),
        Command::Packets(args) => packets::run(args, format),
        Command::Identify(args) => identify::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BridgeArgs {
    /// Bridge configuration file.
    pub config: PathBuf,
    /// Override a configuration VARIABLE (NAME=VALUE, repeatable).
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
    /// Directory of target definition folders used to identify telemetry.
    #[arg(long, value_name = "DIR", env = "LINKPRIMS_DEFINITIONS")]
    pub definitions: Option<PathBuf>,
    /// Target to load from --definitions (repeatable).
    #[arg(long = "target", value_name = "NAME", requires = "definitions")]
    pub targets: Vec<String>,
    /// Stop after running this long (e.g. 30s, 500ms). Default: until Ctrl-C.
    #[arg(long)]
    pub duration: Option<String>,
}

#[derive(Args, Debug)]
pub struct BridgeSetupArgs {
    /// Where to write the configuration.
    pub path: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct PacketsArgs {
    /// Directory of target definition folders.
    pub definitions: PathBuf,
    /// Targets to compile.
    #[arg(required = true)]
    pub targets: Vec<String>,
    /// List command packets instead of telemetry.
    #[arg(long)]
    pub commands: bool,
}

#[derive(Args, Debug)]
pub struct IdentifyArgs {
    /// Directory of target definition folders.
    pub definitions: PathBuf,
    /// Packet bytes as hex (e.g. 0x1ACFFC1D0001).
    pub hex: String,
    /// Target to search (repeatable). Default: every target in the directory.
    #[arg(long = "target", value_name = "NAME")]
    pub targets: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_var(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{value}'")),
    }
}
