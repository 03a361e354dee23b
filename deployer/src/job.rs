use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Work performed by every parallel instance of a vertex
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operator {
    /// source that finishes without emitting anything
    NoDataSource,
    /// sink that drops every record
    DiscardingSink,
    /// reads a file registered with `JobDescriptor::register_cache_file`
    CacheFileReader { name: String },
    /// always fails with the given message
    Failing { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    Forward,
    Shuffle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobVertex {
    pub name: String,
    pub operator: Operator,
    pub parallelism: u32,
    // how records reach this vertex from the previous one, None for sources
    #[serde(default)]
    pub input: Option<Partitioning>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheFile {
    pub name: String,
    pub path: PathBuf,
}

/// Opaque unit of work handed to the resource manager together with the files it needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    #[serde(default = "JobId::generate")]
    pub id: JobId,
    pub name: String,
    pub vertices: Vec<JobVertex>,
    #[serde(default)]
    pub jars: Vec<PathBuf>,
    #[serde(default)]
    pub cache_files: Vec<CacheFile>,
}

impl JobDescriptor {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            parallelism: 1,
            vertices: Vec::new(),
            partitioning: Partitioning::Forward,
        }
    }

    pub fn add_jar(&mut self, jar: impl Into<PathBuf>) {
        self.jars.push(jar.into());
    }

    /// make a local file or directory available to the job under `name`
    pub fn register_cache_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.cache_files.push(CacheFile {
            name: name.into(),
            path: path.into(),
        });
    }

    pub fn max_parallelism(&self) -> u32 {
        self.vertices
            .iter()
            .map(|vertex| vertex.parallelism)
            .max()
            .unwrap_or(1)
    }
}

/// Chains vertices in the order they are added
#[derive(Clone, Debug)]
pub struct JobBuilder {
    name: String,
    parallelism: u32,
    vertices: Vec<JobVertex>,
    partitioning: Partitioning,
}

impl JobBuilder {
    /// parallelism of every vertex added after this call
    pub fn parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn source(self, operator: Operator) -> Self {
        self.push("Source", operator)
    }

    /// redistribute records randomly before the next vertex
    pub fn shuffle(mut self) -> Self {
        self.partitioning = Partitioning::Shuffle;
        self
    }

    pub fn operator(self, operator: Operator) -> Self {
        self.push("Map", operator)
    }

    pub fn sink(self, operator: Operator) -> Self {
        self.push("Sink", operator)
    }

    pub fn build(self) -> JobDescriptor {
        JobDescriptor {
            id: JobId::generate(),
            name: self.name,
            vertices: self.vertices,
            jars: Vec::new(),
            cache_files: Vec::new(),
        }
    }

    fn push(mut self, kind: &str, operator: Operator) -> Self {
        let input = if self.vertices.is_empty() {
            None
        } else {
            Some(self.partitioning)
        };

        self.vertices.push(JobVertex {
            name: format!("{kind}: {}", operator_name(&operator)),
            operator,
            parallelism: self.parallelism,
            input,
        });
        self.partitioning = Partitioning::Forward;
        self
    }
}

fn operator_name(operator: &Operator) -> &'static str {
    match operator {
        Operator::NoDataSource => "NoDataSource",
        Operator::DiscardingSink => "DiscardingSink",
        Operator::CacheFileReader { .. } => "CacheFileReader",
        Operator::Failing { .. } => "Failing",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

/// Cause of a job failure as reported by the cluster, kept verbatim
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedFailure {
    pub message: String,
    pub trace: String,
}

impl fmt::Display for SerializedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job {job} failed: {cause}")]
pub struct JobExecutionFailure {
    pub job: JobId,
    pub cause: SerializedFailure,
}

/// Terminal outcome of one job, a missing failure cause means success
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub application_status: ApplicationStatus,
    pub net_runtime: Duration,
    pub failure_cause: Option<SerializedFailure>,
}

impl JobResult {
    pub fn success(job_id: JobId, net_runtime: Duration) -> Self {
        Self {
            job_id,
            application_status: ApplicationStatus::Succeeded,
            net_runtime,
            failure_cause: None,
        }
    }

    pub fn failure(job_id: JobId, net_runtime: Duration, cause: SerializedFailure) -> Self {
        Self {
            job_id,
            application_status: ApplicationStatus::Failed,
            net_runtime,
            failure_cause: Some(cause),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_cause.is_none()
    }

    pub fn into_result(self) -> Result<Self, JobExecutionFailure> {
        match self.failure_cause {
            None => Ok(self),
            Some(cause) => Err(JobExecutionFailure {
                job: self.job_id,
                cause,
            }),
        }
    }
}
