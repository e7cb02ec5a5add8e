use crate::core::catalog::Catalog;
use crate::core::inventory::Inventory;
use crate::core::matcher::Candidate;
use anyhow::{anyhow, Result};

/// `partition weight x gpu weight`. A GPU type without a weight scores zero;
/// a partition without one is a configuration error.
pub fn score(catalog: &Catalog, candidate: &Candidate) -> Result<u64> {
    let partition_weight = catalog.partition_weight(&candidate.partition)?;
    let gpu_weight = catalog.gpu_weight(&candidate.gpu_type).unwrap_or(0);
    Ok(u64::from(partition_weight) * u64::from(gpu_weight))
}

/// The highest scoring candidate. Ties go to the one found first.
pub fn select<'a>(catalog: &Catalog, candidates: &'a [Candidate]) -> Result<Option<&'a Candidate>> {
    let mut best: Option<(u64, &Candidate)> = None;
    for candidate in candidates {
        let score = score(catalog, candidate)?;
        match best {
            Some((best_score, _)) if score <= best_score => {}
            _ => best = Some((score, candidate)),
        }
    }
    Ok(best.map(|(_, candidate)| candidate))
}

/// The inventory after reserving `candidate`; the input is left untouched.
pub fn reserve(inventory: &Inventory, candidate: &Candidate) -> Result<Inventory> {
    let mut next = inventory.clone();
    let record = next
        .host_mut(&candidate.partition, &candidate.host)
        .ok_or_else(|| {
            anyhow!(
                "Host '{}' not found in partition '{}'",
                candidate.host,
                candidate.partition
            )
        })?;
    record.reserve(&candidate.gpu_type, candidate.count)?;
    Ok(next)
}
