use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString};

/// Usage key for job reservations that did not name a GPU type (`gpu:<count>`).
pub const GENERIC_GPU_KEY: &str = "gpu";

/// Per-type GPU counts, ordered by type name.
pub type GpuCounts = BTreeMap<String, u32>;

/// Node state as reported by the cluster's status tool.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(from = "String", into = "String")]
pub enum NodeState {
    Idle,
    Mix,
    Alloc,
    Comp,
    Drain,
    Drng,
    Down,
    Fail,
    Maint,
    Resv,
    Plnd,
    #[default]
    Unknown,
}

impl NodeState {
    /// Parse a reported state, ignoring the flag suffixes Slurm appends
    /// (`idle*` for not responding, `mix~` for powered down, ...).
    pub fn parse_reported(raw: &str) -> Self {
        raw.trim()
            .trim_end_matches(['*', '~', '#', '!', '%', '$', '@', '^', '-', '+'])
            .parse()
            .unwrap_or_default()
    }
}

impl From<String> for NodeState {
    fn from(value: String) -> Self {
        Self::parse_reported(&value)
    }
}

impl From<NodeState> for String {
    fn from(value: NodeState) -> Self {
        value.to_string()
    }
}

/// Derived allocation state stored alongside the free counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AllocState {
    /// Some capacity is free
    #[default]
    Mix,
    /// Every GPU on the host is in use
    Alloc,
}

/// Free GPUs on a host.
///
/// Serialized flat, the state next to the per-type counts:
/// `{"state": "mix", "a100": 2, "v100": 1}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnusedGpus {
    pub state: AllocState,
    #[serde(flatten)]
    pub counts: GpuCounts,
}

impl UnusedGpus {
    pub fn fully_allocated() -> Self {
        Self {
            state: AllocState::Alloc,
            counts: GpuCounts::new(),
        }
    }
}

/// GPU capacity and usage of one host, as of the last inventory refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostRecord {
    pub partition: String,
    pub state: NodeState,
    /// Total GPUs per type
    pub gpus: GpuCounts,
    /// GPUs held by running jobs, per type (may contain [`GENERIC_GPU_KEY`])
    pub used: GpuCounts,
    pub unused: UnusedGpus,
}

impl HostRecord {
    /// Build a record from reported capacity and usage, deriving free capacity.
    pub fn new(
        partition: impl Into<String>,
        state: NodeState,
        gpus: GpuCounts,
        used: GpuCounts,
    ) -> Self {
        let unused = derive_unused(&gpus, &used);
        Self {
            partition: partition.into(),
            state,
            gpus,
            used,
            unused,
        }
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.state == NodeState::Alloc || self.unused.state == AllocState::Alloc
    }

    pub fn total_gpus(&self) -> u32 {
        self.gpus.values().sum()
    }

    /// Free GPUs of `gpu_type`; zero when the host is fully allocated.
    pub fn free(&self, gpu_type: &str) -> u32 {
        if self.is_fully_allocated() {
            return 0;
        }
        self.unused.counts.get(gpu_type).copied().unwrap_or(0)
    }

    pub fn free_total(&self) -> u32 {
        if self.is_fully_allocated() {
            return 0;
        }
        self.unused.counts.values().sum()
    }

    /// GPUs of `gpu_type` in use, charging generic usage to the sole type of a
    /// single-type host.
    pub fn used_of(&self, gpu_type: &str) -> u32 {
        let explicit = self.used.get(gpu_type).copied().unwrap_or(0);
        match self.sole_gpu_type() {
            Some(sole) if sole == gpu_type => explicit + self.generic_used(),
            _ => explicit,
        }
    }

    fn generic_used(&self) -> u32 {
        self.used.get(GENERIC_GPU_KEY).copied().unwrap_or(0)
    }

    fn sole_gpu_type(&self) -> Option<&str> {
        sole_type(&self.gpus)
    }

    /// Take `count` GPUs of `gpu_type` out of the free pool.
    ///
    /// The count moves from `unused` to `used`; an exhausted type disappears
    /// from `unused`, and a host with nothing left becomes fully allocated.
    pub fn reserve(&mut self, gpu_type: &str, count: u32) -> Result<()> {
        let free = self.free(gpu_type);
        ensure!(
            count <= free,
            "Cannot reserve {} x {} on host with {} free",
            count,
            gpu_type,
            free
        );

        let remaining = free - count;
        if remaining == 0 {
            self.unused.counts.remove(gpu_type);
        } else {
            self.unused.counts.insert(gpu_type.to_string(), remaining);
        }
        *self.used.entry(gpu_type.to_string()).or_insert(0) += count;

        if self.unused.counts.values().all(|&n| n == 0) {
            self.unused = UnusedGpus::fully_allocated();
        }
        Ok(())
    }
}

fn sole_type(gpus: &GpuCounts) -> Option<&str> {
    if gpus.len() == 1 {
        gpus.keys().next().map(String::as_str)
    } else {
        None
    }
}

/// GPUs in use that count against the host's capacity: usage of types the
/// host has, plus generic usage. Usage of types missing from `gpus` (dropped
/// as unknown when parsing) is ignored.
pub fn attributable_used(gpus: &GpuCounts, used: &GpuCounts) -> u32 {
    used.iter()
        .filter(|(key, _)| key.as_str() == GENERIC_GPU_KEY || gpus.contains_key(key.as_str()))
        .map(|(_, &n)| n)
        .sum()
}

/// Free capacity per type: `total - used`, never negative.
///
/// A host whose usage reaches its capacity is fully allocated and lists no
/// per-type counts. Generic usage can only be attributed on single-type hosts;
/// on mixed hosts it still counts toward the fully allocated check.
pub fn derive_unused(gpus: &GpuCounts, used: &GpuCounts) -> UnusedGpus {
    let total: u32 = gpus.values().sum();
    if attributable_used(gpus, used) >= total {
        return UnusedGpus::fully_allocated();
    }

    let generic = used.get(GENERIC_GPU_KEY).copied().unwrap_or(0);
    let sole = sole_type(gpus);
    if generic > 0 && sole.is_none() {
        tracing::debug!(
            "{} GPU(s) in use without a type on a host with {} types; not attributed",
            generic,
            gpus.len()
        );
    }

    let counts = gpus
        .iter()
        .map(|(gpu_type, &capacity)| {
            let mut free = capacity.saturating_sub(used.get(gpu_type).copied().unwrap_or(0));
            if sole == Some(gpu_type.as_str()) {
                free = free.saturating_sub(generic);
            }
            (gpu_type.clone(), free)
        })
        .collect();

    UnusedGpus {
        state: AllocState::Mix,
        counts,
    }
}

/// Hosts of one partition keyed by host id. Persisted as one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionInventory {
    hosts: BTreeMap<String, HostRecord>,
}

impl PartitionInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, record: HostRecord) {
        self.hosts.insert(host.into(), record);
    }

    pub fn get(&self, host: &str) -> Option<&HostRecord> {
        self.hosts.get(host)
    }

    pub fn get_mut(&mut self, host: &str) -> Option<&mut HostRecord> {
        self.hosts.get_mut(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts in host-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostRecord)> {
        self.hosts.iter().map(|(host, record)| (host.as_str(), record))
    }
}

impl FromIterator<(String, HostRecord)> for PartitionInventory {
    fn from_iter<I: IntoIterator<Item = (String, HostRecord)>>(iter: I) -> Self {
        Self {
            hosts: iter.into_iter().collect(),
        }
    }
}

/// Multi-partition snapshot a scheduling pass works on.
///
/// Traversal is ordered by partition, then host, which makes candidate
/// enumeration (and therefore tie-breaking) deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    partitions: BTreeMap<String, PartitionInventory>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: impl Into<String>, inventory: PartitionInventory) {
        self.partitions.insert(partition.into(), inventory);
    }

    pub fn partition(&self, partition: &str) -> Option<&PartitionInventory> {
        self.partitions.get(partition)
    }

    pub fn host(&self, partition: &str, host: &str) -> Option<&HostRecord> {
        self.partitions.get(partition)?.get(host)
    }

    pub fn host_mut(&mut self, partition: &str, host: &str) -> Option<&mut HostRecord> {
        self.partitions.get_mut(partition)?.get_mut(host)
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&str, &PartitionInventory)> {
        self.partitions
            .iter()
            .map(|(partition, inventory)| (partition.as_str(), inventory))
    }

    /// Every host as `(partition, host, record)`.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &str, &HostRecord)> {
        self.partitions().flat_map(|(partition, inventory)| {
            inventory
                .iter()
                .map(move |(host, record)| (partition, host, record))
        })
    }

    pub fn into_partitions(self) -> BTreeMap<String, PartitionInventory> {
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, u32)]) -> GpuCounts {
        entries
            .iter()
            .map(|(gpu_type, n)| (gpu_type.to_string(), *n))
            .collect()
    }

    #[test]
    fn test_node_state_parse_reported() {
        assert_eq!(NodeState::parse_reported("mix"), NodeState::Mix);
        assert_eq!(NodeState::parse_reported("idle*"), NodeState::Idle);
        assert_eq!(NodeState::parse_reported("ALLOC"), NodeState::Alloc);
        assert_eq!(NodeState::parse_reported("drng@"), NodeState::Drng);
        assert_eq!(NodeState::parse_reported("weird"), NodeState::Unknown);
        assert_eq!(NodeState::Mix.to_string(), "mix");
    }

    #[test]
    fn test_derive_unused_partial_usage() {
        let unused = derive_unused(&counts(&[("t4", 3), ("v100", 1)]), &counts(&[("t4", 2)]));
        assert_eq!(unused.state, AllocState::Mix);
        assert_eq!(unused.counts, counts(&[("t4", 1), ("v100", 1)]));
    }

    #[test]
    fn test_derive_unused_fully_allocated_has_no_counts() {
        let unused = derive_unused(&counts(&[("a100", 4)]), &counts(&[("a100", 4)]));
        assert_eq!(unused, UnusedGpus::fully_allocated());

        // A host without GPUs is trivially fully allocated
        let unused = derive_unused(&GpuCounts::new(), &GpuCounts::new());
        assert_eq!(unused.state, AllocState::Alloc);
    }

    #[test]
    fn test_generic_usage_on_single_type_host() {
        let record = HostRecord::new(
            "p1",
            NodeState::Mix,
            counts(&[("v100", 2)]),
            counts(&[(GENERIC_GPU_KEY, 1)]),
        );
        assert_eq!(record.free("v100"), 1);
        assert_eq!(record.used_of("v100"), 1);
        assert_eq!(record.free("v100") + record.used_of("v100"), 2);
    }

    #[test]
    fn test_usage_of_unlisted_type_does_not_consume_capacity() {
        let gpus = counts(&[("a100", 2)]);
        let used = counts(&[("h999", 4)]);
        assert_eq!(attributable_used(&gpus, &used), 0);

        let record = HostRecord::new("p1", NodeState::Mix, gpus, used);
        assert!(!record.is_fully_allocated());
        assert_eq!(record.free("a100"), 2);
        assert_eq!(record.free("a100") + record.used_of("a100"), 2);
    }

    #[test]
    fn test_generic_usage_on_mixed_host_is_not_attributed() {
        let record = HostRecord::new(
            "p1",
            NodeState::Mix,
            counts(&[("t4", 2), ("v100", 2)]),
            counts(&[(GENERIC_GPU_KEY, 1)]),
        );
        assert_eq!(record.free("t4"), 2);
        assert_eq!(record.free("v100"), 2);
        assert!(!record.is_fully_allocated());
    }

    #[test]
    fn test_reserve_moves_capacity_and_drops_exhausted_type() {
        let mut record = HostRecord::new(
            "p1",
            NodeState::Mix,
            counts(&[("a100", 2), ("v100", 1)]),
            GpuCounts::new(),
        );

        record.reserve("a100", 2).unwrap();
        assert!(!record.unused.counts.contains_key("a100"));
        assert_eq!(record.used_of("a100"), 2);
        assert!(!record.is_fully_allocated());

        record.reserve("v100", 1).unwrap();
        assert!(record.is_fully_allocated());
        assert!(record.unused.counts.is_empty());
    }

    #[test]
    fn test_reserve_rejects_overbooking() {
        let mut record =
            HostRecord::new("p1", NodeState::Idle, counts(&[("a100", 1)]), GpuCounts::new());
        assert!(record.reserve("a100", 2).is_err());
        assert!(record.reserve("v100", 1).is_err());
        assert_eq!(record.free("a100"), 1);
    }

    #[test]
    fn test_host_record_json_shape() {
        let record = HostRecord::new(
            "p1",
            NodeState::Mix,
            counts(&[("a100", 2)]),
            counts(&[("a100", 1)]),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "partition": "p1",
                "state": "mix",
                "gpus": {"a100": 2},
                "used": {"a100": 1},
                "unused": {"state": "mix", "a100": 1}
            })
        );

        let back: HostRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_inventory_traversal_is_ordered() {
        let mut inventory = Inventory::new();
        for partition in ["p2", "p1"] {
            let hosts: PartitionInventory = ["h2", "h1"]
                .into_iter()
                .map(|host| {
                    (
                        host.to_string(),
                        HostRecord::new(partition, NodeState::Idle, GpuCounts::new(), GpuCounts::new()),
                    )
                })
                .collect();
            inventory.insert(partition, hosts);
        }

        let order: Vec<_> = inventory.hosts().map(|(p, h, _)| (p, h)).collect();
        assert_eq!(order, vec![("p1", "h1"), ("p1", "h2"), ("p2", "h1"), ("p2", "h2")]);
    }
}
