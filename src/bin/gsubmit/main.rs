use anyhow::{bail, Result};
use clap::Parser;
use gslurm::config::load_config;
use gslurm::core::batch::{HandOff, SbatchSubmitter};
use gslurm::utils::parse_partitions;
use tracing_subscriber::filter::LevelFilter;

mod cli;

fn main() -> Result<()> {
    let args = cli::GSubmit::parse();
    let _guard = gslurm::core::logging::init("gsubmit", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;

    let partitions = parse_partitions(&args.partitions)?;
    let today = chrono::Local::now().date_naive();
    let hand_off = HandOff::new(
        config.catalog(),
        config.store(),
        config.layout(),
        config.submit.clone(),
    );

    if args.dry_run {
        for partition in &partitions {
            for script in hand_off.preview(partition, today)? {
                println!("# {}\n{}", script.path.display(), script.text);
            }
        }
        return Ok(());
    }

    let submitter = SbatchSubmitter::new(config.submit.command.clone());
    let mut failed = 0;
    for partition in &partitions {
        let report = hand_off.submit_partition(&submitter, partition, today)?;
        for assignment in &report.submitted {
            println!(
                "{}\t{}\t{}\t{}",
                assignment.submission.external_id.as_deref().unwrap_or("-"),
                assignment.job.display_name(),
                assignment.partition,
                assignment.host
            );
        }
        failed += report.failed.len();
    }

    if failed > 0 {
        bail!("{failed} assignment(s) could not be submitted and were kept for a later run");
    }
    Ok(())
}
