/// SST training / evaluation entry point
use clap::Parser;
use sst::cli::{run, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!("=== SST - Single-Stream Temporal action proposals ===");
    log::info!("Method: {}", args.method_name);

    run(args)
}
