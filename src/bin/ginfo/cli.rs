use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "ginfo",
    author,
    version = gslurm::core::version(),
    about = "Shows the GPU inventory of Slurm partitions."
)]
#[command(styles = gslurm::utils::STYLES)]
pub struct GInfo {
    /// Comma separated partitions (default: every partition with an inventory)
    pub partitions: Option<String>,

    #[arg(long, short = 'f', value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Only list hosts with free GPUs
    #[arg(long)]
    pub free: bool,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
}
