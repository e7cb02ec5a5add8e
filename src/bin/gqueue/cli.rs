use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gqueue",
    author,
    version = gslurm::core::version(),
    about = "Lists pending jobs and scheduled assignments."
)]
#[command(styles = gslurm::utils::STYLES)]
pub struct GQueue {
    #[arg(long, global = true, help = "Path to the config file", hide = true)]
    pub config: Option<PathBuf>,

    /// Read the queue from this file instead of the shared queue
    #[arg(long, short = 'q')]
    pub queue: Option<PathBuf>,

    /// Also list the assignments of these comma separated partitions
    #[arg(long, short = 'p')]
    pub partitions: Option<String>,

    #[arg(
        long,
        short = 'n',
        help = "Limit the number of jobs to display (positive: first N, negative: last N, 0: all)",
        value_parser = clap::value_parser!(i32),
        allow_hyphen_values = true,
        default_value = "0"
    )]
    pub limit: i32,

    #[arg(
        long,
        short = 'r',
        value_enum,
        help = "Sort jobs by field",
        default_value_t = SortField::Queue
    )]
    pub sort: SortField,

    #[arg(
        long,
        short = 'N',
        help = "Filter by a comma-separated list of job keys"
    )]
    pub keys: Option<String>,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SortField {
    /// Order the scheduler sees them in
    Queue,
    Id,
    Priority,
    Gpus,
    Name,
}
