use anyhow::Result;
use clap::Parser;
use gslurm::config::load_config;
use tracing_subscriber::filter::LevelFilter;

mod cli;
mod commands;

fn main() -> Result<()> {
    let args = cli::GInfo::parse();
    let _guard = gslurm::core::logging::init("ginfo", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;
    commands::handle_info(&config, &args)
}
