use crate::core::batch::SubmitSettings;
use crate::core::catalog::{
    default_cuda_paths, default_gpus, default_partitions, Catalog, GpuSpec, PartitionSpec,
};
use crate::core::get_config_dir;
use crate::core::get_data_dir;
use crate::core::status::{default_status_args, PestatSource, DEFAULT_STATUS_COMMAND};
use crate::core::store::{DocumentStore, RetryPolicy, StateLayout};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default = "default_gpus")]
    pub gpus: BTreeMap<String, GpuSpec>,
    #[serde(default = "default_partitions")]
    pub partitions: BTreeMap<String, PartitionSpec>,
    /// CUDA version label -> LD_LIBRARY_PATH
    #[serde(default = "default_cuda_paths")]
    pub cuda: BTreeMap<String, String>,
    #[serde(default)]
    pub submit: SubmitSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            lock: LockConfig::default(),
            status: StatusConfig::default(),
            gpus: default_gpus(),
            partitions: default_partitions(),
            cuda: default_cuda_paths(),
            submit: SubmitSettings::default(),
        }
    }
}

impl Config {
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.gpus.clone(), self.partitions.clone(), self.cuda.clone())
    }

    pub fn store(&self) -> DocumentStore {
        DocumentStore::new(self.lock.retry_policy())
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.state.root.clone())
    }

    pub fn status_source(&self) -> PestatSource {
        PestatSource::new(self.status.command.clone(), self.status.args.clone())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StateConfig {
    /// Directory holding inventories, the queue and assignment documents
    #[serde(default = "default_state_root")]
    pub root: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            root: default_state_root(),
        }
    }
}

fn default_state_root() -> PathBuf {
    get_data_dir()
        .map(|d| d.join("db"))
        .unwrap_or_else(|_| PathBuf::from("db"))
}

#[derive(Deserialize, Debug, Clone)]
pub struct LockConfig {
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Give up after this long; unset waits forever
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl LockConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(Duration::from_millis(self.retry_interval_ms));
        match self.max_wait_secs {
            Some(secs) => policy.with_max_wait(Duration::from_secs(secs)),
            None => policy,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            max_wait_secs: None,
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    10_000
}

#[derive(Deserialize, Debug, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_status_command")]
    pub command: String,
    /// Arguments placed before the partition name
    #[serde(default = "default_status_args")]
    pub args: Vec<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            command: default_status_command(),
            args: default_status_args(),
        }
    }
}

fn default_status_command() -> String {
    DEFAULT_STATUS_COMMAND.to_string()
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gslurm.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GSLURM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("status.args"),
        )
        .build()?
        .try_deserialize()
}
