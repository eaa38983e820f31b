use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use linkprims_interface::{Bridge, BridgeConfig};
use linkprims_packet::System;
use tracing::info;

use crate::cmd::BridgeArgs;
use crate::exit::{interface_error, packet_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_rows, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: BridgeArgs, format: OutputFormat) -> CliResult<i32> {
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;
    let overrides: HashMap<String, String> = args.vars.into_iter().collect();
    let config = BridgeConfig::from_file(&args.config, &overrides)
        .map_err(|err| interface_error("bridge configuration failed", err))?;

    let system = match &args.definitions {
        Some(dir) => Some(
            System::instance(&args.targets, dir)
                .map_err(|err| packet_error("loading definitions failed", err))?,
        ),
        None => None,
    };

    let mut bridge =
        Bridge::new(&config, system).map_err(|err| interface_error("bridge setup failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    bridge
        .start()
        .map_err(|err| interface_error("bridge start failed", err))?;
    info!(
        interfaces = config.interfaces().len(),
        routers = config.routers().len(),
        "Bridge running"
    );

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    bridge.shutdown();
    print_statuses(&bridge, format);
    Ok(SUCCESS)
}

fn print_statuses(bridge: &Bridge, format: OutputFormat) {
    let statuses = bridge.statuses();
    let rows = statuses
        .iter()
        .map(|status| {
            vec![
                status.name.clone(),
                status.stream.clone(),
                status.read_count.to_string(),
                status.write_count.to_string(),
                status.bytes_read.to_string(),
                status.bytes_written.to_string(),
            ]
        })
        .collect();
    print_rows(
        &statuses,
        &["NAME", "STREAM", "READS", "WRITES", "BYTES_READ", "BYTES_WRITTEN"],
        rows,
        format,
    );
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }
}
