use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PRIORITY: i32 = -1;
pub const DEFAULT_CUDA_VERSION: &str = "default";

/// GPU types a job accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuConstraint {
    /// Any type known to the catalog
    #[default]
    Any,
    Types(BTreeSet<String>),
}

impl GpuConstraint {
    pub fn accepts(&self, gpu_type: &str) -> bool {
        match self {
            GpuConstraint::Any => true,
            GpuConstraint::Types(types) => types.contains(gpu_type),
        }
    }
}

impl fmt::Display for GpuConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuConstraint::Any => write!(f, "any"),
            GpuConstraint::Types(types) => {
                let joined: Vec<&str> = types.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

impl FromStr for GpuConstraint {
    type Err = anyhow::Error;

    /// `any`, or a comma separated list of GPU types.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("any") {
            return Ok(GpuConstraint::Any);
        }
        let types: BTreeSet<String> = s
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if types.is_empty() {
            bail!("Empty GPU type list");
        }
        Ok(GpuConstraint::Types(types))
    }
}

/// A unit of work waiting for GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub id: u64,
    /// Groups the jobs of one submission
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub commands: Vec<String>,
    pub gpu_types: GpuConstraint,
    #[serde(default)]
    pub min_gpu_mem_gb: u32,
    pub num_gpus: NonZeroU32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Virtualenv activated before running the commands
    #[serde(default)]
    pub env: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_cuda_version")]
    pub cuda_version: String,
    /// Position within its batch
    #[serde(default)]
    pub number: u32,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_cuda_version() -> String {
    DEFAULT_CUDA_VERSION.to_string()
}

impl Job {
    pub fn builder(key: impl Into<String>) -> JobBuilder {
        JobBuilder::new(key)
    }

    /// Name used for the batch job and its log files.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}_{}_{}", self.key, self.id, self.number),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobBuilder {
    key: String,
    name: Option<String>,
    commands: Vec<String>,
    gpu_types: GpuConstraint,
    min_gpu_mem_gb: u32,
    num_gpus: u32,
    priority: i32,
    env: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    cuda_version: String,
    number: u32,
}

impl JobBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            commands: Vec::new(),
            gpu_types: GpuConstraint::Any,
            min_gpu_mem_gb: 0,
            num_gpus: 1,
            priority: DEFAULT_PRIORITY,
            env: None,
            work_dir: None,
            cuda_version: DEFAULT_CUDA_VERSION.to_string(),
            number: 0,
        }
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn gpu_types(mut self, gpu_types: GpuConstraint) -> Self {
        self.gpu_types = gpu_types;
        self
    }

    pub fn min_gpu_mem_gb(mut self, min_gpu_mem_gb: u32) -> Self {
        self.min_gpu_mem_gb = min_gpu_mem_gb;
        self
    }

    pub fn num_gpus(mut self, num_gpus: u32) -> Self {
        self.num_gpus = num_gpus;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn env(mut self, env: Option<PathBuf>) -> Self {
        self.env = env;
        self
    }

    pub fn work_dir(mut self, work_dir: Option<PathBuf>) -> Self {
        self.work_dir = work_dir;
        self
    }

    pub fn cuda_version(mut self, cuda_version: impl Into<String>) -> Self {
        self.cuda_version = cuda_version.into();
        self
    }

    pub fn number(mut self, number: u32) -> Self {
        self.number = number;
        self
    }

    pub fn build(self, id: u64) -> Result<Job> {
        let num_gpus = NonZeroU32::new(self.num_gpus)
            .ok_or_else(|| anyhow!("Job '{}' must request at least one GPU", self.key))?;
        Ok(Job {
            id,
            key: self.key,
            name: self.name,
            commands: self.commands,
            gpu_types: self.gpu_types,
            min_gpu_mem_gb: self.min_gpu_mem_gb,
            num_gpus,
            priority: self.priority,
            env: self.env,
            work_dir: self.work_dir,
            cuda_version: self.cuda_version,
            number: self.number,
        })
    }
}

/// Hands out job ids derived from the clock, strictly increasing within a process.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    last: u64,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0);
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Outcome of handing an assignment to the batch system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submission {
    pub submitted: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    /// Raw output of the submission command
    #[serde(default)]
    pub status: Option<String>,
}

/// A job placed on a host by a scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assignment {
    pub job: Job,
    pub partition: String,
    pub host: String,
    pub gpu_type: String,
    pub num_gpus: u32,
    #[serde(default)]
    pub submission: Submission,
}
