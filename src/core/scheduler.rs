use crate::core::allocator;
use crate::core::catalog::Catalog;
use crate::core::inventory::{Inventory, PartitionInventory};
use crate::core::job::{Assignment, Job, Submission};
use crate::core::matcher;
use crate::core::store::{DocumentStore, StateLayout};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Result of planning one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePlan {
    /// New assignments grouped by target partition, in placement order
    pub assignments: BTreeMap<String, Vec<Assignment>>,
    /// Jobs that found no free GPUs, in scheduling order
    pub pending: Vec<Job>,
    /// Inventory with every placement reserved
    pub inventory: Inventory,
}

impl SchedulePlan {
    pub fn assigned_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

/// Place jobs on the inventory, highest priority first.
///
/// Each placement is reserved before the next job is matched. Jobs of equal
/// priority keep their queue order.
pub fn plan(catalog: &Catalog, inventory: Inventory, mut jobs: Vec<Job>) -> Result<SchedulePlan> {
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut inventory = inventory;
    let mut assignments: BTreeMap<String, Vec<Assignment>> = BTreeMap::new();
    let mut pending = Vec::new();

    for job in jobs {
        let candidates = matcher::find_candidates(catalog, &inventory, &job);
        let Some(chosen) = allocator::select(catalog, &candidates)? else {
            tracing::debug!("No free GPUs for job {} ({}), deferring", job.id, job.key);
            pending.push(job);
            continue;
        };

        inventory = allocator::reserve(&inventory, chosen)?;
        tracing::info!(
            "Job {} ({}) -> {}/{} with {} x {}",
            job.id,
            job.key,
            chosen.partition,
            chosen.host,
            chosen.count,
            chosen.gpu_type
        );

        assignments
            .entry(chosen.partition.clone())
            .or_default()
            .push(Assignment {
                job,
                partition: chosen.partition.clone(),
                host: chosen.host.clone(),
                gpu_type: chosen.gpu_type.clone(),
                num_gpus: chosen.count,
                submission: Submission::default(),
            });
    }

    Ok(SchedulePlan {
        assignments,
        pending,
        inventory,
    })
}

/// Runs scheduling passes against the shared state documents.
pub struct Scheduler {
    catalog: Catalog,
    store: DocumentStore,
    layout: StateLayout,
    queue_path: PathBuf,
}

impl Scheduler {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn queue_path(&self) -> &PathBuf {
        &self.queue_path
    }

    /// Load the inventory of every partition in `partitions`.
    pub fn load_inventory(&self, partitions: &[String]) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        for partition in partitions {
            let path = self.layout.inventory_path(partition);
            let hosts: PartitionInventory = self
                .store
                .read(&path)
                .with_context(|| format!("Failed to load inventory of partition '{partition}'"))?;
            inventory.insert(partition.clone(), hosts);
        }
        Ok(inventory)
    }

    pub fn load_queue(&self) -> Result<Vec<Job>> {
        self.store
            .read(&self.queue_path)
            .with_context(|| format!("Failed to load job queue {}", self.queue_path.display()))
    }

    /// One scheduling pass over `partitions`.
    ///
    /// Everything is loaded before anything is written. With `dry_run` the
    /// plan is returned without touching any document.
    pub fn run_pass(&self, partitions: &[String], dry_run: bool) -> Result<SchedulePlan> {
        let inventory = self.load_inventory(partitions)?;
        let jobs = self.load_queue()?;
        let queued = jobs.len();

        let plan = plan(&self.catalog, inventory, jobs)?;
        tracing::info!(
            "Planned {} of {} queued job(s) across {} partition(s)",
            plan.assigned_count(),
            queued,
            partitions.len()
        );

        if dry_run {
            return Ok(plan);
        }
        self.persist(&plan)?;
        Ok(plan)
    }

    fn persist(&self, plan: &SchedulePlan) -> Result<()> {
        for (partition, assignments) in &plan.assignments {
            let path = self.layout.assignments_path(partition);
            self.store
                .update(&path, |existing: &mut Vec<Assignment>| {
                    if !existing.is_empty() {
                        tracing::warn!(
                            "Replacing {} assignment(s) in {} that were never submitted; re-queue them if needed: {}",
                            existing.len(),
                            path.display(),
                            describe_assignments(existing)
                        );
                    }
                    *existing = assignments.clone();
                    Ok(())
                })
                .with_context(|| format!("Failed to save assignments for partition '{partition}'"))?;
        }

        // Reservations are replayed onto the current documents so a refresh
        // that landed during the pass is kept.
        for (partition, assignments) in &plan.assignments {
            self.store
                .update(
                    &self.layout.inventory_path(partition),
                    |hosts: &mut PartitionInventory| {
                        apply_reservations(hosts, assignments);
                        Ok(())
                    },
                )
                .with_context(|| format!("Failed to save inventory of partition '{partition}'"))?;
        }

        let assigned: HashSet<u64> = plan
            .assignments
            .values()
            .flatten()
            .map(|a| a.job.id)
            .collect();
        self.store
            .update(&self.queue_path, |queue: &mut Vec<Job>| {
                *queue = residual_queue(std::mem::take(queue), &plan.pending, &assigned);
                Ok(())
            })
            .with_context(|| format!("Failed to save job queue {}", self.queue_path.display()))?;
        Ok(())
    }
}

/// `job <id> (<name>)` for each assignment, comma separated.
pub fn describe_assignments(assignments: &[Assignment]) -> String {
    assignments
        .iter()
        .map(|a| format!("job {} ({})", a.job.id, a.job.display_name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reserve every assignment on `hosts`. A host that vanished or no longer has
/// the GPUs free is left as reported.
fn apply_reservations(hosts: &mut PartitionInventory, assignments: &[Assignment]) {
    for assignment in assignments {
        let Some(record) = hosts.get_mut(&assignment.host) else {
            tracing::warn!(
                "Host '{}' disappeared from partition '{}' during the pass",
                assignment.host,
                assignment.partition
            );
            continue;
        };
        if let Err(e) = record.reserve(&assignment.gpu_type, assignment.num_gpus) {
            tracing::warn!(
                "Inventory of {}/{} changed during the pass: {:#}",
                assignment.partition,
                assignment.host,
                e
            );
        }
    }
}

/// The queue to store after a pass, given the document as it is now.
///
/// Pending jobs keep their scheduling order; jobs another process removed stay
/// removed, and jobs appended since the pass loaded the queue are kept at the end.
fn residual_queue(current: Vec<Job>, pending: &[Job], assigned: &HashSet<u64>) -> Vec<Job> {
    let present: HashSet<u64> = current.iter().map(|j| j.id).collect();
    let loaded: HashSet<u64> = pending
        .iter()
        .map(|j| j.id)
        .chain(assigned.iter().copied())
        .collect();

    let mut residual: Vec<Job> = pending
        .iter()
        .filter(|j| present.contains(&j.id))
        .cloned()
        .collect();
    let appended: Vec<Job> = current
        .into_iter()
        .filter(|j| !loaded.contains(&j.id))
        .collect();
    if !appended.is_empty() {
        tracing::info!("Keeping {} job(s) queued during the pass", appended.len());
    }
    residual.extend(appended);
    residual
}

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    catalog: Catalog,
    store: DocumentStore,
    layout: StateLayout,
    queue_path: Option<PathBuf>,
}

impl SchedulerBuilder {
    pub fn new(layout: StateLayout) -> Self {
        Self {
            catalog: Catalog::default(),
            store: DocumentStore::default(),
            layout,
            queue_path: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_store(mut self, store: DocumentStore) -> Self {
        self.store = store;
        self
    }

    /// Queue document to schedule from; defaults to the layout's queue.
    pub fn with_queue_path(mut self, path: Option<PathBuf>) -> Self {
        self.queue_path = path;
        self
    }

    pub fn build(self) -> Scheduler {
        let queue_path = self.queue_path.unwrap_or_else(|| self.layout.queue_path());
        Scheduler {
            catalog: self.catalog,
            store: self.store,
            layout: self.layout,
            queue_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::{GpuCounts, HostRecord, NodeState};
    use crate::core::job::GpuConstraint;
    use crate::core::store::RetryPolicy;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::tempdir;

    fn catalog() -> Catalog {
        Catalog::default()
            .with_gpu("a100", 40, 10)
            .with_gpu("v100", 16, 8)
            .with_gpu("t4", 16, 4)
            .with_partition("p1", 10)
            .with_partition("p2", 5)
    }

    fn record(partition: &str, gpus: &[(&str, u32)]) -> HostRecord {
        let gpus: GpuCounts = gpus.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        HostRecord::new(partition, NodeState::Idle, gpus, GpuCounts::new())
    }

    fn single_host_inventory() -> Inventory {
        let mut hosts = PartitionInventory::new();
        hosts.insert("h1", record("p1", &[("a100", 2)]));
        let mut inventory = Inventory::new();
        inventory.insert("p1", hosts);
        inventory
    }

    fn job(id: u64, gpu_type: &str, num_gpus: u32, priority: i32) -> Job {
        Job::builder(format!("job{id}"))
            .gpu_types(GpuConstraint::Types(BTreeSet::from([gpu_type.to_string()])))
            .num_gpus(num_gpus)
            .priority(priority)
            .command("true")
            .build(id)
            .unwrap()
    }

    #[test]
    fn test_higher_priority_job_takes_the_host() {
        let jobs = vec![job(1, "a100", 1, 5), job(2, "a100", 2, 10)];
        let plan = plan(&catalog(), single_host_inventory(), jobs).unwrap();

        let p1 = &plan.assignments["p1"];
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].job.id, 2);
        assert_eq!(p1[0].host, "h1");
        assert_eq!(p1[0].gpu_type, "a100");
        assert_eq!(p1[0].num_gpus, 2);
        assert!(!p1[0].submission.submitted);

        assert_eq!(plan.pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1]);
        assert!(plan.inventory.host("p1", "h1").unwrap().is_fully_allocated());
    }

    #[test]
    fn test_reservations_are_visible_to_later_jobs() {
        let jobs = vec![job(1, "a100", 1, 0), job(2, "a100", 1, 0), job(3, "a100", 1, 0)];
        let plan = plan(&catalog(), single_host_inventory(), jobs).unwrap();
        assert_eq!(plan.assigned_count(), 2);
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.pending[0].id, 3);
    }

    #[test]
    fn test_prefers_weighted_partition_and_gpu() {
        let mut p1 = PartitionInventory::new();
        p1.insert("h1", record("p1", &[("t4", 4)]));
        let mut p2 = PartitionInventory::new();
        p2.insert("h2", record("p2", &[("a100", 4)]));
        let mut inventory = Inventory::new();
        inventory.insert("p1", p1);
        inventory.insert("p2", p2);

        let any = Job::builder("any").build(1).unwrap();
        let plan = plan(&catalog(), inventory, vec![any]).unwrap();
        // p2 x a100 = 50 beats p1 x t4 = 40
        assert_eq!(plan.assignments["p2"][0].host, "h2");
    }

    #[test]
    fn test_missing_partition_weight_aborts_plan() {
        let mut hosts = PartitionInventory::new();
        hosts.insert("h1", record("p9", &[("a100", 2)]));
        let mut inventory = Inventory::new();
        inventory.insert("p9", hosts);

        assert!(plan(&catalog(), inventory, vec![job(1, "a100", 1, 0)]).is_err());
    }

    fn scheduler(root: &std::path::Path) -> Scheduler {
        SchedulerBuilder::new(StateLayout::new(root))
            .with_catalog(catalog())
            .with_store(DocumentStore::new(RetryPolicy::new(Duration::from_millis(5))))
            .build()
    }

    fn seed(scheduler: &Scheduler, jobs: &[Job]) {
        let store = DocumentStore::new(RetryPolicy::new(Duration::from_millis(5)));
        store
            .write(
                &scheduler.layout().inventory_path("p1"),
                single_host_inventory().partition("p1").unwrap(),
            )
            .unwrap();
        store.write(scheduler.queue_path(), jobs).unwrap();
    }

    #[test]
    fn test_run_pass_persists_outcome() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[job(1, "a100", 1, 5), job(2, "a100", 2, 10)]);

        let plan = scheduler.run_pass(&["p1".to_string()], false).unwrap();
        assert_eq!(plan.assigned_count(), 1);

        let store = DocumentStore::default();
        let assigned: Vec<Assignment> = store
            .read(&scheduler.layout().assignments_path("p1"))
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].job.id, 2);

        let queue: Vec<Job> = store.read(scheduler.queue_path()).unwrap();
        assert_eq!(queue.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1]);

        let inventory = scheduler.load_inventory(&["p1".to_string()]).unwrap();
        assert!(inventory.host("p1", "h1").unwrap().is_fully_allocated());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[job(1, "a100", 1, 5)]);

        let plan = scheduler.run_pass(&["p1".to_string()], true).unwrap();
        assert_eq!(plan.assigned_count(), 1);
        assert!(!scheduler.layout().assignments_path("p1").exists());
        assert_eq!(scheduler.load_queue().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_queue_leaves_documents_unchanged() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[]);
        let inventory_path = scheduler.layout().inventory_path("p1");
        let before = std::fs::read_to_string(&inventory_path).unwrap();

        let plan = scheduler.run_pass(&["p1".to_string()], false).unwrap();
        assert_eq!(plan.assigned_count(), 0);
        assert_eq!(std::fs::read_to_string(&inventory_path).unwrap(), before);
        assert!(!scheduler.layout().assignments_path("p1").exists());
    }

    #[test]
    fn test_missing_inventory_aborts_before_writes() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[job(1, "a100", 1, 5)]);

        let partitions = vec!["p1".to_string(), "p2".to_string()];
        let err = scheduler.run_pass(&partitions, false).unwrap_err();
        assert!(format!("{err:#}").contains("p2"));
        assert!(!scheduler.layout().assignments_path("p1").exists());
        assert_eq!(scheduler.load_queue().unwrap().len(), 1);
    }

    #[test]
    fn test_pass_keeps_jobs_and_refreshes_that_land_mid_pass() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[job(1, "a100", 1, 5)]);
        let store = DocumentStore::new(RetryPolicy::new(Duration::from_millis(5)));
        let layout = scheduler.layout().clone();

        // Holding the assignment document parks the pass after it has loaded everything
        let held = store.lock(&layout.assignments_path("p1")).unwrap();
        std::thread::scope(|scope| {
            let pass = scope.spawn(|| scheduler.run_pass(&["p1".to_string()], false));
            std::thread::sleep(Duration::from_millis(200));

            store
                .update(scheduler.queue_path(), |queue: &mut Vec<Job>| {
                    queue.push(job(2, "a100", 1, 0));
                    Ok(())
                })
                .unwrap();
            store
                .update(&layout.inventory_path("p1"), |hosts: &mut PartitionInventory| {
                    hosts.insert("h2", record("p1", &[("v100", 4)]));
                    Ok(())
                })
                .unwrap();

            drop(held);
            let plan = pass.join().unwrap().unwrap();
            assert_eq!(plan.assigned_count(), 1);
        });

        let queue: Vec<Job> = store.read(scheduler.queue_path()).unwrap();
        assert_eq!(queue.iter().map(|j| j.id).collect::<Vec<_>>(), vec![2]);

        let hosts: PartitionInventory = store.read(&layout.inventory_path("p1")).unwrap();
        assert_eq!(hosts.get("h1").unwrap().free("a100"), 1);
        assert_eq!(hosts.get("h2").unwrap().free("v100"), 4);
    }

    #[test]
    fn test_residual_queue_rebases_on_current_document() {
        let pending = vec![job(3, "a100", 1, 9), job(1, "a100", 1, 0)];
        let assigned = HashSet::from([2]);

        // Unchanged document: exactly the pending jobs, in scheduling order
        let current = vec![job(1, "a100", 1, 0), job(2, "a100", 1, 5), job(3, "a100", 1, 9)];
        let ids: Vec<u64> = residual_queue(current, &pending, &assigned)
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![3, 1]);

        // Job 1 removed elsewhere, job 4 appended
        let current = vec![job(2, "a100", 1, 5), job(3, "a100", 1, 9), job(4, "a100", 1, 0)];
        let ids: Vec<u64> = residual_queue(current, &pending, &assigned)
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_apply_reservations_skips_changed_hosts() {
        let mut hosts = PartitionInventory::new();
        hosts.insert("h1", record("p1", &[("a100", 1)]));
        let assignment = |host: &str, count: u32| Assignment {
            job: job(1, "a100", count, 0),
            partition: "p1".to_string(),
            host: host.to_string(),
            gpu_type: "a100".to_string(),
            num_gpus: count,
            submission: Submission::default(),
        };

        apply_reservations(&mut hosts, &[assignment("h1", 2), assignment("gone", 1)]);
        assert_eq!(hosts.get("h1").unwrap().free("a100"), 1);

        apply_reservations(&mut hosts, &[assignment("h1", 1)]);
        assert!(hosts.get("h1").unwrap().is_fully_allocated());
    }

    #[test]
    fn test_replaced_assignments_are_named() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        seed(&scheduler, &[job(1, "a100", 1, 5)]);
        let plan = scheduler.run_pass(&["p1".to_string()], true).unwrap();

        let stale = &plan.assignments["p1"];
        assert_eq!(describe_assignments(stale), "job 1 (job1_1_0)");
        assert_eq!(describe_assignments(&[]), "");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const TYPES: &[&str] = &["a100", "v100", "t4"];

        fn inventory_strategy() -> impl Strategy<Value = Inventory> {
            prop::collection::vec((0..2usize, 0..TYPES.len(), 1u32..5), 1..6).prop_map(|hosts| {
                let mut inventory = Inventory::new();
                for (i, (partition, gpu_type, count)) in hosts.into_iter().enumerate() {
                    let partition = ["p1", "p2"][partition];
                    let mut existing = inventory.partition(partition).cloned().unwrap_or_default();
                    existing.insert(format!("h{i}"), record(partition, &[(TYPES[gpu_type], count)]));
                    inventory.insert(partition, existing);
                }
                inventory
            })
        }

        fn jobs_strategy() -> impl Strategy<Value = Vec<Job>> {
            prop::collection::vec((0..TYPES.len(), 1u32..4, -2i32..3), 0..12).prop_map(|specs| {
                specs
                    .into_iter()
                    .enumerate()
                    .map(|(i, (gpu_type, num_gpus, priority))| {
                        job(i as u64, TYPES[gpu_type], num_gpus, priority)
                    })
                    .collect()
            })
        }

        proptest! {
            /// Every queued job ends up either assigned or pending, exactly once
            #[test]
            fn prop_jobs_are_conserved(inventory in inventory_strategy(), jobs in jobs_strategy()) {
                let plan = plan(&catalog(), inventory, jobs.clone()).unwrap();

                let mut seen: Vec<u64> = plan
                    .assignments
                    .values()
                    .flatten()
                    .map(|a| a.job.id)
                    .chain(plan.pending.iter().map(|j| j.id))
                    .collect();
                seen.sort_unstable();
                let mut expected: Vec<u64> = jobs.iter().map(|j| j.id).collect();
                expected.sort_unstable();
                prop_assert_eq!(seen, expected);
            }

            /// Same input, same plan
            #[test]
            fn prop_plan_is_deterministic(inventory in inventory_strategy(), jobs in jobs_strategy()) {
                let first = plan(&catalog(), inventory.clone(), jobs.clone()).unwrap();
                let second = plan(&catalog(), inventory, jobs).unwrap();
                prop_assert_eq!(first, second);
            }

            /// Reservations never exceed a host's capacity
            #[test]
            fn prop_no_overallocation(inventory in inventory_strategy(), jobs in jobs_strategy()) {
                let plan = plan(&catalog(), inventory.clone(), jobs).unwrap();

                let mut placed: BTreeMap<(String, String), u32> = BTreeMap::new();
                for assignment in plan.assignments.values().flatten() {
                    *placed
                        .entry((assignment.partition.clone(), assignment.host.clone()))
                        .or_insert(0) += assignment.num_gpus;
                }
                for ((partition, host), count) in placed {
                    let record = inventory.host(&partition, &host).unwrap();
                    prop_assert!(count <= record.total_gpus());
                }

                for (_, _, record) in plan.inventory.hosts() {
                    for (gpu_type, &total) in &record.gpus {
                        prop_assert_eq!(record.free(gpu_type) + record.used_of(gpu_type), total);
                    }
                }
            }
        }
    }
}
