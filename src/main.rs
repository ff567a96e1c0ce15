use clap::Parser;

use mqtt_adapter::args::Args;
use mqtt_adapter::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    mqtt_adapter::bootstrap(args.log, &args.log_level)?;

    mqtt_adapter::cli::run::main(args)
}
