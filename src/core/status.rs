use crate::core::catalog::Catalog;
use crate::core::inventory::PartitionInventory;
use crate::core::parser;
use crate::core::store::{DocumentStore, StateLayout};
use anyhow::{anyhow, Context, Result};
use std::process::Command;

pub const DEFAULT_STATUS_COMMAND: &str = "pestat";

pub fn default_status_args() -> Vec<String> {
    vec!["-G".to_string(), "-p".to_string()]
}

/// Produces the raw status report of one partition.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSource {
    fn report(&self, partition: &str) -> Result<String>;
}

/// Runs the cluster's status command, with the partition as last argument.
#[derive(Debug, Clone)]
pub struct PestatSource {
    command: String,
    args: Vec<String>,
}

impl PestatSource {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl Default for PestatSource {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_COMMAND, default_status_args())
    }
}

impl StatusSource for PestatSource {
    fn report(&self, partition: &str) -> Result<String> {
        tracing::debug!("Running {} {:?} {}", self.command, self.args, partition);
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(partition)
            .output()
            .with_context(|| format!("Failed to run '{}'", self.command))?;

        if !output.status.success() {
            return Err(anyhow!(
                "'{}' failed for partition '{}' ({}): {}",
                self.command,
                partition,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("'{}' produced non UTF-8 output", self.command))
    }
}

/// Rebuilds partition inventory documents from status reports.
pub struct StatusRefresher {
    catalog: Catalog,
    store: DocumentStore,
    layout: StateLayout,
}

impl StatusRefresher {
    pub fn new(catalog: Catalog, store: DocumentStore, layout: StateLayout) -> Self {
        Self {
            catalog,
            store,
            layout,
        }
    }

    /// Fetch a fresh report for `partition` and replace its inventory document.
    pub fn refresh(&self, source: &dyn StatusSource, partition: &str) -> Result<PartitionInventory> {
        let report = source.report(partition)?;
        self.apply_report(partition, &report)
    }

    /// Parse `report` and replace the inventory document of `partition`.
    pub fn apply_report(&self, partition: &str, report: &str) -> Result<PartitionInventory> {
        let inventory = parser::parse_report(&self.catalog, report.lines());
        if inventory.is_empty() {
            tracing::warn!("Status report for partition '{}' lists no hosts", partition);
        }

        let path = self.layout.inventory_path(partition);
        self.store
            .write(&path, &inventory)
            .with_context(|| format!("Failed to save inventory of partition '{partition}'"))?;
        tracing::info!(
            "Refreshed partition '{}': {} host(s), {} free GPU(s)",
            partition,
            inventory.len(),
            inventory.iter().map(|(_, r)| r.free_total()).sum::<u32>()
        );
        Ok(inventory)
    }
}
