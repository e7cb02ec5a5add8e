use anyhow::Result;
use clap::{CommandFactory, Parser};
use gslurm::config::load_config;
use tracing_subscriber::filter::LevelFilter;

mod cli;
mod commands;

fn main() -> Result<()> {
    let args = cli::GBatch::parse();

    if let Some(cli::Commands::Completions { shell }) = args.commands {
        let mut cmd = cli::GBatch::command();
        return gslurm::utils::generate_completions(shell, &mut cmd, "gbatch");
    }

    let _guard = gslurm::core::logging::init("gbatch", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;

    commands::handle_add(&config, args.add_args)
}
