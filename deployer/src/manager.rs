pub mod local;

use crate::{
    config::{ClusterConfig, ConfigErrors},
    job::{JobId, JobResult},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("application was rejected: {0}")]
    Rejected(String),
    #[error("resource manager unreachable: {0}")]
    Transport(String),
    #[error("unknown application {0}")]
    UnknownApplication(ApplicationId),
    #[error("invalid application id '{0}'")]
    InvalidApplicationId(String),
}

/// Identifier handed out by the resource manager, `application_<cluster timestamp>_<sequence>`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationId {
    cluster_timestamp: u64,
    sequence: u32,
}

impl ApplicationId {
    pub const fn new(cluster_timestamp: u64, sequence: u32) -> Self {
        Self {
            cluster_timestamp,
            sequence,
        }
    }

    pub fn cluster_timestamp(&self) -> u64 {
        self.cluster_timestamp
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "application_{}_{:04}",
            self.cluster_timestamp, self.sequence
        )
    }
}

impl FromStr for ApplicationId {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("application_")
            .and_then(|rest| rest.split_once('_'))
            .and_then(|(timestamp, sequence)| {
                Some(Self::new(timestamp.parse().ok()?, sequence.parse().ok()?))
            })
            .ok_or_else(|| ManagerError::InvalidApplicationId(s.to_owned()))
    }
}

impl TryFrom<String> for ApplicationId {
    type Error = ManagerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ApplicationId> for String {
    fn from(value: ApplicationId) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    New,
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::Accepted => "ACCEPTED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalApplicationStatus {
    Undefined,
    Succeeded,
    Failed,
    Killed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationReport {
    pub id: ApplicationId,
    pub name: String,
    pub state: ApplicationState,
    pub final_status: FinalApplicationStatus,
    pub diagnostics: String,
    pub host: String,
}

/// Container limits of the cluster, in MiB
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub min_allocation_mb: u32,
    pub max_allocation_mb: u32,
    pub available_memory_mb: u64,
}

/// Everything the resource manager needs to launch one staged application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSubmission {
    pub id: ApplicationId,
    pub name: String,
    pub job_id: JobId,
    pub master_memory_mb: u32,
    pub worker_memory_mb: u32,
    pub workers: u32,
    pub slots_per_worker: u32,
    pub staging_root: PathBuf,
    pub job_file: PathBuf,
    // remote files localized on every container before start
    pub local_resources: Vec<PathBuf>,
    // directories already present on every node
    pub shared_lib_dirs: Vec<PathBuf>,
    pub classpath: Vec<String>,
    pub detached: bool,
}

impl ApplicationSubmission {
    pub fn total_memory_mb(&self) -> u64 {
        u64::from(self.master_memory_mb) + u64::from(self.worker_memory_mb) * u64::from(self.workers)
    }
}

/// Entry point to a resource manager, every deployment opens its own connection
pub trait ResourceManager: Send + Sync + fmt::Debug {
    fn connect(&self) -> Result<Box<dyn ManagerConnection>, ManagerError>;
}

/// RPC surface of a resource manager as seen by one client
pub trait ManagerConnection: Send + fmt::Debug {
    /// home directory of the submitting user on the shared filesystem
    fn home_directory(&mut self) -> Result<PathBuf, ManagerError>;

    fn cluster_resources(&mut self) -> Result<ClusterResources, ManagerError>;

    /// reserve an id for an application that is submitted later
    fn new_application(&mut self) -> Result<ApplicationId, ManagerError>;

    fn submit_application(&mut self, submission: ApplicationSubmission) -> Result<(), ManagerError>;

    fn application_report(&mut self, id: &ApplicationId) -> Result<ApplicationReport, ManagerError>;

    /// result of `job` once it reached a terminal state, None while it is still running
    fn job_result(
        &mut self,
        id: &ApplicationId,
        job: &JobId,
    ) -> Result<Option<JobResult>, ManagerError>;

    /// ask the application master to exit once its job is done
    fn stop_application(&mut self, id: &ApplicationId) -> Result<(), ManagerError>;

    fn kill_application(&mut self, id: &ApplicationId) -> Result<(), ManagerError>;
}

/// Start the resource manager session selected by `config.name`
pub fn load(config: &ClusterConfig) -> Result<Arc<dyn ResourceManager>, ConfigErrors> {
    match config.name.as_str() {
        "local" => Ok(Arc::new(local::LocalCluster::load(config)?)),
        _ => Err(ConfigErrors::UnsupportedCluster(config.name.clone())),
    }
}
