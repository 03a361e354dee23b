use crate::specification::{MemorySize, UserJarInclusion};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    fs::File,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Resource manager not supported: {0}")]
    UnsupportedCluster(String),
    #[error("Invalid parameter cluster.parameter.{name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read config")]
    Io(#[from] Error),
    #[error("Failed to parse config")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DeployerConfig {
    // total process memory of the master and of every worker
    #[serde(default)]
    pub memory: MemoryConfig,
    // budget for a single round trip with the resource manager
    #[serde(default = "default_ask_timeout", with = "duration")]
    pub ask_timeout: Duration,
    #[serde(default)]
    pub classpath_include_user_jar: UserJarInclusion,
    // directories already present on every node, `lib_dir` is not uploaded when set
    #[serde(default)]
    pub provided_lib_dirs: Option<Vec<PathBuf>>,
    // local library directory shipped with every job
    pub lib_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: i64,
    #[serde(default = "default_slots")]
    pub slots_per_worker: i64,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default = "default_master_memory")]
    pub master: MemorySize,
    #[serde(default = "default_worker_memory")]
    pub worker: MemorySize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            master: default_master_memory(),
            worker: default_worker_memory(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_interval", with = "duration")]
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_interval(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TeardownConfig {
    #[serde(default = "default_interval", with = "duration")]
    pub interval: Duration,
    #[serde(default = "default_teardown_timeout", with = "duration")]
    pub timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_teardown_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct StagingConfig {
    // globs of library files that are never uploaded
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl StagingConfig {
    /// Compile all exclude globs into a single matcher
    pub fn compile_excludes(&self) -> Result<GlobSet, ConfigErrors> {
        let mut builder = GlobSetBuilder::new();

        for pattern in self.exclude.iter() {
            builder.add(Glob::new(pattern)?);
        }

        Ok(builder.build()?)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // Name of the resource manager, see manager::load for the selection process
    pub name: String,
    // parameters handed to the resource manager session
    pub parameter: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "local".to_owned(),
            parameter: None,
        }
    }
}

impl ClusterConfig {
    pub fn get(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.parameter
            .as_ref()
            .and_then(|parameters| parameters.get(name))
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, ConfigErrors> {
        match self.get(name) {
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| ConfigErrors::InvalidParameter {
                    name: name.to_owned(),
                    reason: "must be a natural number".to_owned(),
                }),
            None => Ok(None),
        }
    }
}

impl DeployerConfig {
    /// Configuration with every optional setting at its default
    pub fn with_lib_dir(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: MemoryConfig::default(),
            ask_timeout: default_ask_timeout(),
            classpath_include_user_jar: UserJarInclusion::default(),
            provided_lib_dirs: None,
            lib_dir: lib_dir.into(),
            workers: default_workers(),
            slots_per_worker: default_slots(),
            monitor: MonitorConfig::default(),
            teardown: TeardownConfig::default(),
            staging: StagingConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }

    /// true if at least one provided library directory is configured
    pub fn has_provided_lib_dirs(&self) -> bool {
        self.provided_lib_dirs
            .as_ref()
            .is_some_and(|dirs| !dirs.is_empty())
    }

    /// Check the whole config and log every problem found, returns true if any check failed
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.lib_dir.is_dir() {
            error!(
                "lib_dir ({}) must be an existing directory",
                self.lib_dir.to_string_lossy()
            );
            contains_error = true;
        }

        if matches!(self.provided_lib_dirs, Some(ref dirs) if dirs.is_empty()) {
            warn!("provided_lib_dirs is empty, lib_dir will be uploaded for every job");
            self.provided_lib_dirs = None;
        }

        for dir in self.provided_lib_dirs.iter().flatten() {
            if !dir.is_dir() {
                error!(
                    "provided_lib_dirs entry {} is not a directory",
                    dir.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.memory.master.mebibytes() == 0 || self.memory.worker.mebibytes() == 0 {
            error!(
                "memory.master ({}) and memory.worker ({}) must be at least 1m",
                self.memory.master, self.memory.worker
            );
            contains_error = true;
        }

        if self.workers < 1 {
            error!("workers ({}) must be at least 1", self.workers);
            contains_error = true;
        }

        if self.slots_per_worker < 1 {
            error!("slots_per_worker ({}) must be at least 1", self.slots_per_worker);
            contains_error = true;
        }

        if self.monitor.poll_interval.is_zero() || self.teardown.interval.is_zero() {
            error!("monitor.poll_interval and teardown.interval cannot be 0");
            contains_error = true;
        }

        if self.teardown.interval > self.teardown.timeout {
            warn!(
                "teardown.interval ({:?}) is longer than teardown.timeout ({:?}), the application is polled only once",
                self.teardown.interval, self.teardown.timeout
            );
        }

        if let Err(e) = self.staging.compile_excludes() {
            error!("staging.exclude contains an invalid glob: {e}");
            contains_error = true;
        }

        self.cluster.name = self.cluster.name.to_lowercase();
        if self.cluster.name != "local" {
            error!(
                "cluster.name ({}) is not supported, please use `local` for now",
                self.cluster.name
            );
            contains_error = true;
        }

        contains_error
    }
}

/// primitive way to retrieve the tmp dir from the environment with default to /tmp
pub fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

fn default_master_memory() -> MemorySize {
    MemorySize::from_mebibytes(768)
}

fn default_worker_memory() -> MemorySize {
    MemorySize::from_mebibytes(1024)
}

const fn default_ask_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_teardown_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_workers() -> i64 {
    1
}

const fn default_slots() -> i64 {
    1
}

/// (de)serialize durations as `30 s`, `100ms`, `2m` or bare seconds
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (number, scale): (&str, fn(u64) -> Option<Duration>) =
            if let Some(stripped) = s.strip_suffix("ms") {
                (stripped, |millis| Some(Duration::from_millis(millis)))
            } else if let Some(stripped) = s.strip_suffix('s') {
                (stripped, |secs| Some(Duration::from_secs(secs)))
            } else if let Some(stripped) = s.strip_suffix('m') {
                (stripped, |mins| mins.checked_mul(60).map(Duration::from_secs))
            } else {
                (s, |secs| Some(Duration::from_secs(secs)))
            };

        number
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(scale)
            .ok_or_else(|| format!("Invalid duration: {s}"))
    }
}
