use anyhow::Result;
use clap::Parser;
use gslurm::config::load_config;
use gslurm::core::scheduler::{SchedulePlan, SchedulerBuilder};
use gslurm::utils::parse_partitions;
use tabled::{settings::Style, Table, Tabled};
use tracing_subscriber::filter::LevelFilter;

mod cli;

#[derive(Tabled)]
struct PlacementRow {
    #[tabled(rename = "JOBID")]
    id: u64,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PRIO")]
    priority: i32,
    #[tabled(rename = "PARTITION")]
    partition: String,
    #[tabled(rename = "NODE")]
    host: String,
    #[tabled(rename = "GRES")]
    gres: String,
}

fn print_plan(plan: &SchedulePlan, dry_run: bool) {
    let rows: Vec<PlacementRow> = plan
        .assignments
        .values()
        .flatten()
        .map(|a| PlacementRow {
            id: a.job.id,
            name: a.job.display_name(),
            priority: a.job.priority,
            partition: a.partition.clone(),
            host: a.host.clone(),
            gres: format!("gpu:{}:{}", a.gpu_type, a.num_gpus),
        })
        .collect();

    if !rows.is_empty() {
        println!("{}", Table::new(&rows).with(Style::blank()));
    }
    println!(
        "{} {} job(s), {} still pending",
        if dry_run { "Would assign" } else { "Assigned" },
        rows.len(),
        plan.pending.len()
    );
}

fn main() -> Result<()> {
    let args = cli::GSched::parse();
    let _guard = gslurm::core::logging::init("gsched", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;

    let partitions = parse_partitions(&args.partitions)?;
    let scheduler = SchedulerBuilder::new(config.layout())
        .with_catalog(config.catalog())
        .with_store(config.store())
        .with_queue_path(args.queue)
        .build();

    let plan = scheduler.run_pass(&partitions, args.dry_run)?;
    print_plan(&plan, args.dry_run);
    Ok(())
}
