use anyhow::Result;
use clap::Parser;
use gslurm::config::load_config;
use gslurm::core::job::{Assignment, Job};
use gslurm::utils::{parse_partitions, truncate};
use tabled::{settings::Style, Table, Tabled};
use tracing_subscriber::filter::LevelFilter;

mod cli;

use cli::SortField;

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "JOBID")]
    id: u64,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PRIO")]
    priority: i32,
    #[tabled(rename = "GPUS")]
    num_gpus: u32,
    #[tabled(rename = "TYPES")]
    gpu_types: String,
    #[tabled(rename = "MEM")]
    min_mem: String,
    #[tabled(rename = "COMMAND")]
    command: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.display_name(),
            priority: job.priority,
            num_gpus: job.num_gpus.get(),
            gpu_types: job.gpu_types.to_string(),
            min_mem: match job.min_gpu_mem_gb {
                0 => "-".to_string(),
                gb => format!("{gb}G"),
            },
            command: truncate(&job.commands.join(" && "), 40),
        }
    }
}

#[derive(Tabled)]
struct AssignmentRow {
    #[tabled(rename = "JOBID")]
    id: u64,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PARTITION")]
    partition: String,
    #[tabled(rename = "NODE")]
    host: String,
    #[tabled(rename = "GRES")]
    gres: String,
    #[tabled(rename = "SLURMID")]
    external_id: String,
}

impl From<&Assignment> for AssignmentRow {
    fn from(a: &Assignment) -> Self {
        Self {
            id: a.job.id,
            name: a.job.display_name(),
            partition: a.partition.clone(),
            host: a.host.clone(),
            gres: format!("gpu:{}:{}", a.gpu_type, a.num_gpus),
            external_id: a
                .submission
                .external_id
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

fn select_jobs(mut jobs: Vec<Job>, args: &cli::GQueue) -> Vec<Job> {
    if let Some(keys) = &args.keys {
        let keys: Vec<&str> = keys.split(',').map(str::trim).collect();
        jobs.retain(|job| keys.contains(&job.key.as_str()));
    }

    match args.sort {
        SortField::Queue => {
            // Same ordering as the scheduling pass: priority descending, stable.
            jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        SortField::Id => jobs.sort_by_key(|job| job.id),
        SortField::Priority => jobs.sort_by_key(|job| job.priority),
        SortField::Gpus => jobs.sort_by_key(|job| job.num_gpus),
        SortField::Name => jobs.sort_by_key(|job| job.display_name()),
    }

    let limit = args.limit.unsigned_abs() as usize;
    if limit == 0 || limit >= jobs.len() {
        return jobs;
    }
    if args.limit > 0 {
        jobs.truncate(limit);
        jobs
    } else {
        jobs.split_off(jobs.len() - limit)
    }
}

fn main() -> Result<()> {
    let args = cli::GQueue::parse();
    let _guard = gslurm::core::logging::init("gqueue", LevelFilter::from(args.verbosity))?;
    let config = load_config(args.config.as_ref())?;

    let layout = config.layout();
    let store = config.store();
    let queue_path = args.queue.clone().unwrap_or_else(|| layout.queue_path());
    let jobs: Vec<Job> = store.read_optional(&queue_path)?.unwrap_or_default();

    let jobs = select_jobs(jobs, &args);
    if jobs.is_empty() {
        println!("No pending jobs.");
    } else {
        let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
        println!("{}", Table::new(rows).with(Style::blank()));
    }

    if let Some(list) = &args.partitions {
        let mut rows = Vec::new();
        for partition in parse_partitions(list)? {
            let assignments: Vec<Assignment> = store
                .read_optional(&layout.assignments_path(&partition))?
                .unwrap_or_default();
            rows.extend(assignments.iter().map(AssignmentRow::from));
        }
        println!();
        if rows.is_empty() {
            println!("No assignments waiting for submission.");
        } else {
            println!("{}", Table::new(rows).with(Style::blank()));
        }
    }

    Ok(())
}
