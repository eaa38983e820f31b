mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "linkprims", version, about = "Command and telemetry link CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true, env = "LINKPRIMS_FORMAT")]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        global = true,
        env = "LINKPRIMS_LOG_LEVEL"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bridge_subcommand() {
        let cli = Cli::try_parse_from([
            "linkprims",
            "bridge",
            "bridge.txt",
            "--var",
            "router_port=2951",
            "--var",
            "baud_rate=9600",
        ])
        .expect("bridge args should parse");

        let Command::Bridge(args) = cli.command else {
            panic!("expected bridge command");
        };
        assert_eq!(args.vars.len(), 2);
        assert_eq!(args.vars[0], ("router_port".to_string(), "2951".to_string()));
    }

    #[test]
    fn rejects_malformed_variable() {
        let err = Cli::try_parse_from(["linkprims", "bridge", "bridge.txt", "--var", "novalue"])
            .expect_err("variable without '=' should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn targets_require_definitions() {
        let err = Cli::try_parse_from(["linkprims", "bridge", "bridge.txt", "--target", "INST"])
            .expect_err("--target without --definitions should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_identify_subcommand() {
        let cli = Cli::try_parse_from([
            "linkprims",
            "identify",
            "targets",
            "0x0100FF",
            "--target",
            "INST",
        ])
        .expect("identify args should parse");
        assert!(matches!(cli.command, Command::Identify(_)));
    }
}
