use clap::Parser;
use clap_complete::Shell;
use gslurm::core::version;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gbatch",
    author,
    version = version(),
    about = "Expands a command file into GPU jobs and queues them for gsched."
)]
#[command(styles = gslurm::utils::STYLES)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub struct GBatch {
    #[command(subcommand)]
    pub commands: Option<Commands>,

    #[command(flatten)]
    pub add_args: AddArgs,

    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[arg(long, global = true, help = "Path to the config file")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Generate tab-completion scripts for your shell
    #[command(arg_required_else_help = true)]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// File with one command per line; `<name>` placeholders are filled from --hyperparams
    #[arg(long, short = 'c', required = true, value_hint = clap::ValueHint::FilePath)]
    pub commands: Option<PathBuf>,

    /// YAML mapping of placeholder name to a list of values, one job per position
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub hyperparams: Option<PathBuf>,

    /// Key shared by every job of this batch (default: command file name)
    #[arg(long, short = 'k')]
    pub key: Option<String>,

    /// Explicit job name (default: <key>_<id>_<number>)
    #[arg(long)]
    pub name: Option<String>,

    /// Accepted GPU types, comma separated, or "any"
    #[arg(long, short = 'g', default_value = "any")]
    pub gpu_type: String,

    /// Minimum GPU memory in GB
    #[arg(long, default_value_t = 0)]
    pub min_gpu_mem: u32,

    /// GPUs per job
    #[arg(long, short = 'n', default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub num_gpus: u32,

    /// Higher runs first
    #[arg(long, short = 'p', default_value_t = gslurm::core::job::DEFAULT_PRIORITY, allow_negative_numbers = true)]
    pub priority: i32,

    /// Virtualenv to activate (`<env>/bin/activate`)
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    pub env: Option<PathBuf>,

    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    pub work_dir: Option<PathBuf>,

    /// CUDA version label selecting LD_LIBRARY_PATH
    #[arg(long, default_value = gslurm::core::job::DEFAULT_CUDA_VERSION)]
    pub cuda_version: String,

    /// Only keep the jobs at these positions of the sweep, e.g. "0-3,7"
    #[arg(long)]
    pub select: Option<String>,

    /// Write the jobs to this file instead of adding them to the queue
    #[arg(long, short = 'o', value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Queue document to add to (default: the queue under the state root)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub queue: Option<PathBuf>,
}
