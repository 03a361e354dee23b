use crate::config::DeployerConfig;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecificationError {
    #[error("master memory must be positive, got {0} MiB")]
    MasterMemory(i64),
    #[error("worker memory must be positive, got {0} MiB")]
    WorkerMemory(i64),
    #[error("slots per worker must be positive, got {0}")]
    Slots(i64),
    #[error("at least one worker is required, got {0}")]
    WorkerCount(i64),
    #[error("{name} of {value} is too large")]
    TooLarge { name: &'static str, value: i64 },
    #[error("invalid memory size '{0}'")]
    MemorySize(String),
}

/// A process memory budget, e.g. `768m` or `1g`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mebibytes(mebibytes: u64) -> Self {
        Self(mebibytes * MIB)
    }

    pub const fn bytes(&self) -> u64 {
        self.0
    }

    pub const fn mebibytes(&self) -> u64 {
        self.0 / MIB
    }
}

impl FromStr for MemorySize {
    type Err = SpecificationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let value: u64 = number
            .parse()
            .map_err(|_| SpecificationError::MemorySize(input.to_owned()))?;
        let multiplier = match unit.trim().to_lowercase().as_str() {
            "" | "b" | "bytes" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            "t" | "tb" | "tib" => TIB,
            _ => return Err(SpecificationError::MemorySize(input.to_owned())),
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| SpecificationError::MemorySize(input.to_owned()))
    }
}

impl TryFrom<String> for MemorySize {
    type Error = SpecificationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemorySize> for String {
    fn from(value: MemorySize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 != 0 && self.0 % MIB == 0 {
            write!(f, "{}m", self.0 / MIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Position of the user jars relative to the shipped libraries on the job classpath
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserJarInclusion {
    #[serde(alias = "FIRST")]
    IncludeFirst,
    #[default]
    #[serde(alias = "LAST")]
    IncludeLast,
    /// user jars stay off the system classpath and are loaded by the job itself
    Disabled,
}

impl fmt::Display for UserJarInclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IncludeFirst => "INCLUDE_FIRST",
            Self::IncludeLast => "INCLUDE_LAST",
            Self::Disabled => "DISABLED",
        })
    }
}

/// Validated resource request for one per-job cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpecification {
    master_memory_mb: u32,
    worker_memory_mb: u32,
    worker_count: u32,
    slots_per_worker: u32,
}

impl ClusterSpecification {
    pub fn builder() -> ClusterSpecificationBuilder {
        ClusterSpecificationBuilder::default()
    }

    /// Build the specification described by the memory and slot settings of `config`
    pub fn from_config(config: &DeployerConfig) -> Result<Self, SpecificationError> {
        ClusterSpecificationBuilder::default()
            .master_memory_mb(mebibytes_as_i64(config.memory.master))
            .worker_memory_mb(mebibytes_as_i64(config.memory.worker))
            .worker_count(config.workers)
            .slots_per_worker(config.slots_per_worker)
            .build()
    }

    pub fn master_memory_mb(&self) -> u32 {
        self.master_memory_mb
    }

    pub fn worker_memory_mb(&self) -> u32 {
        self.worker_memory_mb
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn slots_per_worker(&self) -> u32 {
        self.slots_per_worker
    }

    /// Number of workers needed to run a job of the given parallelism
    pub fn workers_for(&self, parallelism: u32) -> u32 {
        self.worker_count
            .max(parallelism.div_ceil(self.slots_per_worker))
    }
}

fn mebibytes_as_i64(size: MemorySize) -> i64 {
    i64::try_from(size.mebibytes()).unwrap_or(i64::MAX)
}

/// Collects raw resource numbers, nothing is checked before `build`
#[derive(Clone, Debug)]
pub struct ClusterSpecificationBuilder {
    master_memory_mb: i64,
    worker_memory_mb: i64,
    worker_count: i64,
    slots_per_worker: i64,
}

impl Default for ClusterSpecificationBuilder {
    fn default() -> Self {
        Self {
            master_memory_mb: 768,
            worker_memory_mb: 1024,
            worker_count: 1,
            slots_per_worker: 1,
        }
    }
}

impl ClusterSpecificationBuilder {
    pub fn master_memory_mb(mut self, value: i64) -> Self {
        self.master_memory_mb = value;
        self
    }

    pub fn worker_memory_mb(mut self, value: i64) -> Self {
        self.worker_memory_mb = value;
        self
    }

    pub fn worker_count(mut self, value: i64) -> Self {
        self.worker_count = value;
        self
    }

    pub fn slots_per_worker(mut self, value: i64) -> Self {
        self.slots_per_worker = value;
        self
    }

    pub fn build(&self) -> Result<ClusterSpecification, SpecificationError> {
        Ok(ClusterSpecification {
            master_memory_mb: positive(
                self.master_memory_mb,
                "master memory",
                SpecificationError::MasterMemory,
            )?,
            worker_memory_mb: positive(
                self.worker_memory_mb,
                "worker memory",
                SpecificationError::WorkerMemory,
            )?,
            worker_count: positive(self.worker_count, "worker count", SpecificationError::WorkerCount)?,
            slots_per_worker: positive(self.slots_per_worker, "slots per worker", SpecificationError::Slots)?,
        })
    }
}

fn positive(
    value: i64,
    name: &'static str,
    error: fn(i64) -> SpecificationError,
) -> Result<u32, SpecificationError> {
    if value <= 0 {
        return Err(error(value));
    }

    u32::try_from(value).map_err(|_| SpecificationError::TooLarge { name, value })
}

/// Everything the deployment client needs to stage and submit one job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentRequest {
    specification: ClusterSpecification,
    user_jars: Vec<PathBuf>,
    user_jar_inclusion: UserJarInclusion,
    provided_lib_dirs: Vec<PathBuf>,
    lib_dir: PathBuf,
}

impl DeploymentRequest {
    pub fn new(
        specification: ClusterSpecification,
        config: &DeployerConfig,
        user_jars: Vec<PathBuf>,
    ) -> Self {
        Self {
            specification,
            user_jars,
            user_jar_inclusion: config.classpath_include_user_jar,
            provided_lib_dirs: config.provided_lib_dirs.clone().unwrap_or_default(),
            lib_dir: config.lib_dir.clone(),
        }
    }

    pub fn specification(&self) -> &ClusterSpecification {
        &self.specification
    }

    pub fn user_jars(&self) -> &[PathBuf] {
        &self.user_jars
    }

    pub fn user_jar_inclusion(&self) -> UserJarInclusion {
        self.user_jar_inclusion
    }

    pub fn provided_lib_dirs(&self) -> &[PathBuf] {
        &self.provided_lib_dirs
    }

    pub fn has_provided_lib_dirs(&self) -> bool {
        !self.provided_lib_dirs.is_empty()
    }

    pub fn lib_dir(&self) -> &PathBuf {
        &self.lib_dir
    }
}
