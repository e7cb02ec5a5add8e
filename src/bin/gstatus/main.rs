use anyhow::{bail, Context, Result};
use clap::Parser;
use gslurm::config::load_config;
use gslurm::core::status::StatusRefresher;
use gslurm::utils::parse_partitions;
use tracing_subscriber::filter::LevelFilter;

mod cli;

fn main() -> Result<()> {
    let args = cli::GStatus::parse();
    let _guard = gslurm::core::logging::init("gstatus", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;

    let partitions = parse_partitions(&args.partitions)?;
    let refresher = StatusRefresher::new(config.catalog(), config.store(), config.layout());

    if let Some(report_file) = &args.from_file {
        let [partition] = partitions.as_slice() else {
            bail!("--from-file takes exactly one partition");
        };
        let report = std::fs::read_to_string(report_file)
            .with_context(|| format!("Failed to read {}", report_file.display()))?;
        refresher.apply_report(partition, &report)?;
        return Ok(());
    }

    let source = config.status_source();
    let mut failed = Vec::new();
    for partition in &partitions {
        if let Err(e) = refresher.refresh(&source, partition) {
            tracing::error!("Failed to refresh partition '{}': {:#}", partition, e);
            failed.push(partition.as_str());
        }
    }

    if !failed.is_empty() {
        bail!("Could not refresh: {}", failed.join(", "));
    }
    Ok(())
}
