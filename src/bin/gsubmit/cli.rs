use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gsubmit",
    author,
    version = gslurm::core::version(),
    about = "Hands scheduled assignments to sbatch."
)]
#[command(styles = gslurm::utils::STYLES)]
pub struct GSubmit {
    /// Comma separated partitions whose assignments to submit
    pub partitions: String,

    /// Print the batch scripts instead of submitting them
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}
