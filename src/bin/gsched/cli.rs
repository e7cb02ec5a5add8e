use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gsched",
    author,
    version = gslurm::core::version(),
    about = "Runs one scheduling pass, placing queued jobs on free GPUs."
)]
#[command(styles = gslurm::utils::STYLES)]
pub struct GSched {
    /// Comma separated partitions to schedule on
    pub partitions: String,

    /// Queue document to schedule from (default: the queue under the state root)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub queue: Option<PathBuf>,

    /// Show the placements without writing anything
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}
