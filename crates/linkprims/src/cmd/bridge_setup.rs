use linkprims_interface::BridgeConfig;

use crate::cmd::BridgeSetupArgs;
use crate::exit::{interface_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: BridgeSetupArgs) -> CliResult<i32> {
    if args.path.exists() && !args.force {
        return Err(CliError::new(
            USAGE,
            format!("{} already exists (use --force to overwrite)", args.path.display()),
        ));
    }
    BridgeConfig::generate_default(&args.path)
        .map_err(|err| interface_error("writing bridge configuration failed", err))?;
    println!("Wrote {}", args.path.display());
    Ok(SUCCESS)
}
