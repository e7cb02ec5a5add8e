use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Static properties of one GPU model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    /// On-board memory in GB
    pub memory_gb: u32,
    /// Desirability weight used when scoring candidates (higher is better)
    pub weight: u32,
}

/// Static properties of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub weight: u32,
    /// Slurm account charged for jobs submitted to this partition
    #[serde(default)]
    pub account: Option<String>,
    /// Wall-time limit in Slurm format (e.g. "3-00:00:00")
    #[serde(default)]
    pub time_limit: Option<String>,
}

/// Immutable lookup tables consulted by the matcher, the allocator and the
/// batch hand-off.
///
/// A catalog is built once per process from the loaded configuration and passed
/// by reference; nothing mutates it afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    gpus: BTreeMap<String, GpuSpec>,
    partitions: BTreeMap<String, PartitionSpec>,
    cuda: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new(
        gpus: BTreeMap<String, GpuSpec>,
        partitions: BTreeMap<String, PartitionSpec>,
        cuda: BTreeMap<String, String>,
    ) -> Self {
        Self {
            gpus,
            partitions,
            cuda,
        }
    }

    pub fn with_gpu(mut self, gpu_type: impl Into<String>, memory_gb: u32, weight: u32) -> Self {
        self.gpus
            .insert(gpu_type.into(), GpuSpec { memory_gb, weight });
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>, weight: u32) -> Self {
        self.partitions.insert(
            partition.into(),
            PartitionSpec {
                weight,
                account: None,
                time_limit: None,
            },
        );
        self
    }

    pub fn with_partition_spec(mut self, partition: impl Into<String>, spec: PartitionSpec) -> Self {
        self.partitions.insert(partition.into(), spec);
        self
    }

    pub fn with_cuda(mut self, version: impl Into<String>, library_path: impl Into<String>) -> Self {
        self.cuda.insert(version.into(), library_path.into());
        self
    }

    pub fn gpu(&self, gpu_type: &str) -> Option<&GpuSpec> {
        self.gpus.get(gpu_type)
    }

    pub fn is_known_gpu(&self, gpu_type: &str) -> bool {
        self.gpus.contains_key(gpu_type)
    }

    /// All GPU types in catalog order.
    pub fn gpu_types(&self) -> impl Iterator<Item = &str> {
        self.gpus.keys().map(String::as_str)
    }

    pub fn gpu_weight(&self, gpu_type: &str) -> Option<u32> {
        self.gpus.get(gpu_type).map(|spec| spec.weight)
    }

    /// GPU types whose memory is at least `min_memory_gb`.
    pub fn gpus_with_memory(&self, min_memory_gb: u32) -> BTreeSet<&str> {
        self.gpus
            .iter()
            .filter(|(_, spec)| spec.memory_gb >= min_memory_gb)
            .map(|(gpu_type, _)| gpu_type.as_str())
            .collect()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    /// Priority weight of a partition.
    ///
    /// Only called for partitions that already produced a candidate, so a
    /// missing entry means the static tables are incomplete.
    pub fn partition_weight(&self, partition: &str) -> Result<u32> {
        self.partitions
            .get(partition)
            .map(|spec| spec.weight)
            .ok_or_else(|| {
                anyhow!(
                    "Partition '{}' has no priority weight configured; add it under [partitions.{}]",
                    partition,
                    partition
                )
            })
    }

    pub fn partition_account(&self, partition: &str) -> Result<&str> {
        self.partitions
            .get(partition)
            .and_then(|spec| spec.account.as_deref())
            .ok_or_else(|| anyhow!("Partition '{}' has no account configured", partition))
    }

    pub fn partition_time_limit(&self, partition: &str) -> Result<&str> {
        self.partitions
            .get(partition)
            .and_then(|spec| spec.time_limit.as_deref())
            .ok_or_else(|| anyhow!("Partition '{}' has no time limit configured", partition))
    }

    pub fn library_path(&self, cuda_version: &str) -> Result<&str> {
        self.cuda
            .get(cuda_version)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("Unknown CUDA version '{}'", cuda_version))
    }
}

pub fn default_gpus() -> BTreeMap<String, GpuSpec> {
    [
        ("a40", 48, 10),
        ("a100", 40, 10),
        ("3090", 24, 10),
        ("v100", 16, 8),
        ("titanv", 12, 6),
        ("p100", 16, 4),
        ("t4", 16, 4),
        ("2080ti", 11, 3),
        ("1080ti", 11, 2),
        ("p40", 24, 1),
    ]
    .into_iter()
    .map(|(name, memory_gb, weight)| (name.to_string(), GpuSpec { memory_gb, weight }))
    .collect()
}

pub fn default_partitions() -> BTreeMap<String, PartitionSpec> {
    [
        ("notchpeak-gpu", 10, "notchpeak-gpu", "3-00:00:00"),
        ("soc-gpu-kp", 10, "soc-gpu-kp", "14-00:00:00"),
        ("kingspeak-gpu", 10, "kingspeak-gpu", "3-00:00:00"),
        ("notchpeak-gpu-guest", 5, "owner-gpu-guest", "3-00:00:00"),
        ("kingspeak-gpu-guest", 5, "owner-gpu-guest", "3-00:00:00"),
    ]
    .into_iter()
    .map(|(name, weight, account, time_limit)| {
        (
            name.to_string(),
            PartitionSpec {
                weight,
                account: Some(account.to_string()),
                time_limit: Some(time_limit.to_string()),
            },
        )
    })
    .collect()
}

pub fn default_cuda_paths() -> BTreeMap<String, String> {
    [
        ("default", "/usr/local/cuda/lib64"),
        ("cu100", ""),
        ("cu110", "/usr/local/cuda-11/lib64"),
        ("cu113", "/usr/local/cuda-11.3/lib64"),
        ("cu114", "/usr/local/cuda-11.4/lib64"),
        ("cu900", ""),
    ]
    .into_iter()
    .map(|(version, path)| (version.to_string(), path.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_catalog() -> Catalog {
        Catalog::new(default_gpus(), default_partitions(), default_cuda_paths())
    }

    #[test]
    fn test_gpus_with_memory_filters_by_capacity() {
        let catalog = default_catalog();

        let large = catalog.gpus_with_memory(40);
        assert_eq!(large, BTreeSet::from(["a100", "a40"]));

        // No minimum means every known type qualifies
        assert_eq!(catalog.gpus_with_memory(0).len(), 10);
        assert!(catalog.gpus_with_memory(80).is_empty());
    }

    #[test]
    fn test_partition_weight_missing_is_error() {
        let catalog = Catalog::default().with_partition("p1", 7);
        assert_eq!(catalog.partition_weight("p1").unwrap(), 7);

        let err = catalog.partition_weight("p2").unwrap_err();
        assert!(err.to_string().contains("p2"));
    }

    #[test]
    fn test_default_tables_are_consistent() {
        let catalog = default_catalog();
        for partition in catalog.partitions() {
            assert!(catalog.partition_account(partition).is_ok());
            assert!(catalog.partition_time_limit(partition).is_ok());
        }
        assert_eq!(catalog.gpu_weight("v100"), Some(8));
        assert_eq!(catalog.library_path("default").unwrap(), "/usr/local/cuda/lib64");
        assert!(catalog.library_path("cu999").is_err());
    }
}
