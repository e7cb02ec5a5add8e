use crate::cli::AddArgs;
use anyhow::{anyhow, Result};
use gslurm::config::Config;
use gslurm::core::catalog::Catalog;
use gslurm::core::job::{GpuConstraint, Job, JobIdGenerator};
use gslurm::core::sweep;
use gslurm::utils::parse_selection;

pub fn handle_add(config: &Config, args: AddArgs) -> Result<()> {
    let command_file = args
        .commands
        .ok_or_else(|| anyhow!("--commands is required"))?;
    let commands = sweep::read_commands(&command_file)?;
    if commands.is_empty() {
        return Err(anyhow!("{} contains no commands", command_file.display()));
    }

    let hyperparams = match &args.hyperparams {
        Some(path) => sweep::read_hyperparams(path)?,
        None => sweep::Hyperparams::new(),
    };
    let command_sets = sweep::expand(&commands, &hyperparams)?;

    let key = args.key.unwrap_or_else(|| {
        command_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
    });
    let gpu_types: GpuConstraint = args.gpu_type.parse()?;

    let catalog = config.catalog();
    warn_unschedulable(&catalog, &gpu_types, args.min_gpu_mem, &args.cuda_version);

    let template = Job::builder(key)
        .name(args.name)
        .gpu_types(gpu_types)
        .min_gpu_mem_gb(args.min_gpu_mem)
        .num_gpus(args.num_gpus)
        .priority(args.priority)
        .env(args.env)
        .work_dir(args.work_dir)
        .cuda_version(args.cuda_version);

    let mut ids = JobIdGenerator::new();
    let mut jobs = sweep::build_jobs(&template, command_sets, &mut ids)?;

    if let Some(selection) = &args.select {
        let keep = parse_selection(selection)?;
        jobs.retain(|job| keep.contains(&job.number));
        if jobs.is_empty() {
            return Err(anyhow!("Selection '{}' matches no job of the sweep", selection));
        }
    }

    let store = config.store();
    if let Some(output) = &args.output {
        store.write(output, &jobs)?;
        println!("Wrote {} job(s) to {}", jobs.len(), output.display());
        return Ok(());
    }

    let queue_path = args.queue.unwrap_or_else(|| config.layout().queue_path());
    let added = jobs.len();
    let queued = store.update(&queue_path, |queue: &mut Vec<Job>| {
        queue.extend(jobs);
        Ok(queue.len())
    })?;

    println!(
        "Queued {} job(s) in {} ({} pending)",
        added,
        queue_path.display(),
        queued
    );
    Ok(())
}

/// Jobs that nothing in the catalog can run are still queued, but say so.
fn warn_unschedulable(catalog: &Catalog, gpu_types: &GpuConstraint, min_mem: u32, cuda: &str) {
    if let GpuConstraint::Types(types) = gpu_types {
        for gpu_type in types.iter().filter(|t| !catalog.is_known_gpu(t)) {
            tracing::warn!("Unknown GPU type '{}' will never match", gpu_type);
        }
    }
    let fits = catalog
        .gpus_with_memory(min_mem)
        .into_iter()
        .any(|t| gpu_types.accepts(t));
    if !fits {
        tracing::warn!(
            "No GPU type satisfies '{}' with at least {} GB; jobs will stay pending",
            gpu_types,
            min_mem
        );
    }
    if catalog.library_path(cuda).is_err() {
        tracing::warn!("Unknown CUDA version '{}'; submission will fail", cuda);
    }
}
