use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gstatus",
    author,
    version = gslurm::core::version(),
    about = "Refreshes the GPU inventory of Slurm partitions."
)]
#[command(styles = gslurm::utils::STYLES)]
pub struct GStatus {
    /// Comma separated partitions to refresh
    pub partitions: String,

    /// Parse a saved report instead of running the status command (single partition only)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub from_file: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}
