//! Parser for `pestat -G` partition reports.
//!
//! A report looks like
//!
//! ```text
//! Print only nodes in partition notchpeak-gpu
//! Hostname       Partition     Node Num_CPU  CPUload  Memsize  Freemem  GRES/node   Joblist
//!                              State Use/Tot  (15min)     (MB)     (MB)              JobID User GRES/job ...
//! notch001   notchpeak-gpu      mix  16  64   15.98   191000   120000 gpu:a100:2(S:0,1) 4242 alice gpu:a100:1
//! ```
//!
//! Only rows shaped like a host entry are used; everything else is skipped.

use crate::core::catalog::Catalog;
use crate::core::inventory::{GpuCounts, HostRecord, NodeState, PartitionInventory, GENERIC_GPU_KEY};
use regex::Regex;
use std::sync::LazyLock;

const HEADER_PREFIX: &str = "Hostname";
const MIN_HOST_FIELDS: usize = 9;

const HOST_FIELD: usize = 0;
const PARTITION_FIELD: usize = 1;
const STATE_FIELD: usize = 2;
const CPU_USED_FIELD: usize = 3;
const CPU_TOTAL_FIELD: usize = 4;
const GRES_FIELD: usize = 8;
const JOBLIST_START: usize = 9;

static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("annotation pattern is valid"));

static TYPED_GPU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^gpu:([A-Za-z0-9_.-]+):(\d+)$").expect("typed gpu pattern is valid")
});

static UNTYPED_GPU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^gpu:([A-Za-z0-9_.-]+)$").expect("untyped gpu pattern is valid"));

/// Parse a full report into the inventory of one partition.
///
/// Lines before the header and lines that are not host rows are ignored.
pub fn parse_report<I, S>(catalog: &Catalog, lines: I) -> PartitionInventory
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut inventory = PartitionInventory::new();
    let mut seen_header = false;

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with(HEADER_PREFIX) {
            seen_header = true;
            continue;
        }
        if !seen_header {
            continue;
        }

        match parse_host_row(catalog, line) {
            Some((host, record)) => inventory.insert(host, record),
            None => tracing::trace!("Skipping non-host line: {}", line),
        }
    }

    inventory
}

/// Parse one host row, or `None` if the line does not look like one.
pub fn parse_host_row(catalog: &Catalog, line: &str) -> Option<(String, HostRecord)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_HOST_FIELDS {
        return None;
    }
    // Header continuation lines and footers have text in the CPU columns
    if fields[CPU_USED_FIELD].parse::<u32>().is_err()
        || fields[CPU_TOTAL_FIELD].parse::<u32>().is_err()
    {
        return None;
    }

    let gpus = parse_capacity(catalog, fields[GRES_FIELD]);
    let used = parse_usage(&fields[JOBLIST_START..]);
    let record = HostRecord::new(
        fields[PARTITION_FIELD].to_lowercase(),
        NodeState::parse_reported(fields[STATE_FIELD]),
        gpus,
        used,
    );
    Some((fields[HOST_FIELD].to_string(), record))
}

/// GPU capacity from a GRES field such as `gpu:t4:3,gpu:v100:1(S:0-1)`.
///
/// Malformed tokens and types the catalog does not know are dropped.
pub fn parse_capacity(catalog: &Catalog, gres: &str) -> GpuCounts {
    let mut gpus = GpuCounts::new();
    for token in split_tokens(gres) {
        let Some(caps) = TYPED_GPU.captures(&token) else {
            tracing::debug!("Dropping malformed GRES token '{}'", token);
            continue;
        };
        let gpu_type = caps[1].to_lowercase();
        if !catalog.is_known_gpu(&gpu_type) {
            tracing::debug!("Dropping unknown GPU type '{}'", gpu_type);
            continue;
        }
        let Ok(count) = caps[2].parse::<u32>() else {
            continue;
        };
        *gpus.entry(gpu_type).or_insert(0) += count;
    }
    gpus
}

/// GPU usage summed over the job-list tokens of a host row.
///
/// Recognised tokens are `gpu:<type>:<n>`, `gpu:<type>` (one GPU) and
/// `gpu:<n>` (recorded under [`GENERIC_GPU_KEY`]); job ids and user names
/// are ignored.
pub fn parse_usage<S: AsRef<str>>(joblist: &[S]) -> GpuCounts {
    let mut used = GpuCounts::new();
    for field in joblist {
        for token in split_tokens(field.as_ref()) {
            if let Some((key, count)) = parse_usage_token(&token) {
                *used.entry(key).or_insert(0) += count;
            }
        }
    }
    used
}

fn parse_usage_token(token: &str) -> Option<(String, u32)> {
    if let Some(caps) = TYPED_GPU.captures(token) {
        let count = caps[2].parse().ok()?;
        return Some((caps[1].to_lowercase(), count));
    }
    let caps = UNTYPED_GPU.captures(token)?;
    match caps[1].parse::<u32>() {
        Ok(count) => Some((GENERIC_GPU_KEY.to_string(), count)),
        Err(_) => Some((caps[1].to_lowercase(), 1)),
    }
}

/// Strip parenthesised annotations (which may contain commas), then split on commas.
fn split_tokens(field: &str) -> Vec<String> {
    ANNOTATION
        .replace_all(field, "")
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
