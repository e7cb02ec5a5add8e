use crate::core::catalog::Catalog;
use crate::core::inventory::Inventory;
use crate::core::job::{GpuConstraint, Job};
use std::collections::BTreeSet;

/// A host that can take a job right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub gpu_type: String,
    pub count: u32,
    pub host: String,
    pub partition: String,
}

/// GPU types that satisfy both the job's type constraint and its memory floor.
///
/// Types the catalog does not know are never compatible.
pub fn compatible_types<'a>(catalog: &'a Catalog, job: &Job) -> BTreeSet<&'a str> {
    let with_memory = catalog.gpus_with_memory(job.min_gpu_mem_gb);
    match &job.gpu_types {
        GpuConstraint::Any => with_memory,
        GpuConstraint::Types(_) => with_memory
            .into_iter()
            .filter(|gpu_type| job.gpu_types.accepts(gpu_type))
            .collect(),
    }
}

/// Every `(partition, host, gpu type)` with enough free GPUs for `job`, in
/// inventory order.
pub fn find_candidates(catalog: &Catalog, inventory: &Inventory, job: &Job) -> Vec<Candidate> {
    let compatible = compatible_types(catalog, job);
    if compatible.is_empty() {
        return Vec::new();
    }
    let count = job.num_gpus.get();

    let mut candidates = Vec::new();
    for (partition, host, record) in inventory.hosts() {
        if record.is_fully_allocated() {
            continue;
        }
        for (gpu_type, &free) in &record.unused.counts {
            if free >= count && compatible.contains(gpu_type.as_str()) {
                candidates.push(Candidate {
                    gpu_type: gpu_type.clone(),
                    count,
                    host: host.to_string(),
                    partition: partition.to_string(),
                });
            }
        }
    }
    candidates
}
