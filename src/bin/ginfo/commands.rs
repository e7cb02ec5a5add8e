use crate::cli::{GInfo, OutputFormat};
use anyhow::Result;
use gslurm::config::Config;
use gslurm::core::inventory::{HostRecord, Inventory, NodeState, PartitionInventory};
use gslurm::utils::{format_counts, parse_partitions};
use owo_colors::OwoColorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Debug, Serialize, Tabled)]
pub struct HostRow {
    #[tabled(rename = "PARTITION")]
    pub partition: String,
    #[tabled(rename = "NODE")]
    pub host: String,
    #[tabled(rename = "STATE")]
    pub state: String,
    #[tabled(rename = "GPUS")]
    pub gpus: String,
    #[tabled(rename = "USED")]
    pub used: String,
    #[tabled(rename = "FREE")]
    pub free: String,
    #[tabled(rename = "NFREE")]
    pub free_total: u32,
}

impl HostRow {
    fn new(partition: &str, host: &str, record: &HostRecord) -> Self {
        let free = if record.is_fully_allocated() {
            "-".to_string()
        } else {
            format_counts(&record.unused.counts)
        };
        Self {
            partition: partition.to_string(),
            host: host.to_string(),
            state: record.state.to_string(),
            gpus: format_counts(&record.gpus),
            used: format_counts(&record.used),
            free,
            free_total: record.free_total(),
        }
    }
}

pub fn rows(inventory: &Inventory, free_only: bool) -> Vec<HostRow> {
    inventory
        .hosts()
        .filter(|(_, _, record)| !free_only || record.free_total() > 0)
        .map(|(partition, host, record)| HostRow::new(partition, host, record))
        .collect()
}

fn colorize_state(state: &str) -> String {
    match NodeState::parse_reported(state) {
        NodeState::Idle => state.green().to_string(),
        NodeState::Mix => state.yellow().to_string(),
        NodeState::Alloc => state.red().to_string(),
        _ => state.dimmed().to_string(),
    }
}

pub fn handle_info(config: &Config, args: &GInfo) -> Result<()> {
    let layout = config.layout();
    let partitions = match &args.partitions {
        Some(list) => parse_partitions(list)?,
        None => layout.inventory_partitions()?,
    };

    let store = config.store();
    let mut inventory = Inventory::new();
    for partition in &partitions {
        let hosts: PartitionInventory = store.read(&layout.inventory_path(partition))?;
        inventory.insert(partition.clone(), hosts);
    }

    let mut rows = rows(&inventory, args.free);
    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No hosts found. Run gstatus to refresh the inventory.");
                return Ok(());
            }
            for row in &mut rows {
                row.state = colorize_state(&row.state);
            }
            let free: u32 = rows.iter().map(|r| r.free_total).sum();
            println!("{}", Table::new(&rows).with(Style::blank()));
            println!("{} host(s), {} free GPU(s)", rows.len(), free);
        }
    }
    Ok(())
}
