pub mod handle;

use self::handle::ApplicationHandle;
use crate::{
    config::{ConfigErrors, DeployerConfig},
    job::{JobDescriptor, JobId},
    manager::{
        ApplicationId, ApplicationState, ApplicationSubmission, ClusterResources,
        ManagerConnection, ManagerError, ResourceManager,
    },
    monitor::JobResultFuture,
    specification::{ClusterSpecification, DeploymentRequest, SpecificationError},
    staging::{self, fs::SharedFileSystem, util::staging_root, ArtifactStager},
    teardown::{TeardownController, TeardownOutcome},
};
use globset::GlobSet;
use std::{
    fmt, io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Step of a deployment a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Allocation,
    Staging,
    Submission,
    Acceptance,
    Monitoring,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Allocation => "allocation",
            Self::Staging => "staging",
            Self::Submission => "submission",
            Self::Acceptance => "acceptance",
            Self::Monitoring => "monitoring",
            Self::Teardown => "teardown",
        })
    }
}

struct MaybeApplication<'a>(&'a Option<ApplicationId>);

impl fmt::Display for MaybeApplication<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{id}"),
            None => f.write_str("<unassigned application>"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Invalid cluster specification: {0}")]
    InvalidSpecification(#[from] SpecificationError),
    #[error("Staging {} for {app} failed: {source}", .path.to_string_lossy())]
    StagingIOError {
        app: ApplicationId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} was rejected during {stage}: {reason}", MaybeApplication(.app))]
    SubmissionRejected {
        app: Option<ApplicationId>,
        stage: Stage,
        reason: String,
    },
    #[error("Transport failure for {} during {stage}: {reason}", MaybeApplication(.app))]
    TransportError {
        app: Option<ApplicationId>,
        stage: Stage,
        reason: String,
    },
    #[error("{app} reached {state} without a result for job {job}: {diagnostics}")]
    MissingJobResult {
        app: ApplicationId,
        job: JobId,
        state: ApplicationState,
        diagnostics: String,
    },
}

impl DeployError {
    pub(crate) fn from_manager(error: ManagerError, app: Option<ApplicationId>, stage: Stage) -> Self {
        match error {
            ManagerError::Rejected(reason) => Self::SubmissionRejected { app, stage, reason },
            other => Self::TransportError {
                app,
                stage,
                reason: other.to_string(),
            },
        }
    }

    /// false for errors caused by the caller or the cluster refusing the job
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransportError { .. } | Self::StagingIOError { .. })
    }

    pub fn application_id(&self) -> Option<ApplicationId> {
        match self {
            Self::InvalidSpecification(_) => None,
            Self::StagingIOError { app, .. } | Self::MissingJobResult { app, .. } => Some(*app),
            Self::SubmissionRejected { app, .. } | Self::TransportError { app, .. } => *app,
        }
    }
}

/// Deploys per-job clusters on one resource manager
#[derive(Debug)]
pub struct ClusterDescriptor {
    config: DeployerConfig,
    manager: Arc<dyn ResourceManager>,
    fs: Arc<dyn SharedFileSystem>,
    excludes: GlobSet,
}

impl ClusterDescriptor {
    pub fn new(
        config: DeployerConfig,
        manager: Arc<dyn ResourceManager>,
        fs: Arc<dyn SharedFileSystem>,
    ) -> Result<Self, ConfigErrors> {
        let excludes = config.staging.compile_excludes()?;

        Ok(Self {
            config,
            manager,
            fs,
            excludes,
        })
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    /// cluster specification described by the configuration
    pub fn cluster_specification(&self) -> Result<ClusterSpecification, DeployError> {
        Ok(ClusterSpecification::from_config(&self.config)?)
    }

    /// Stage `job`, submit it and wait until the resource manager runs it.
    ///
    /// An attached handle keeps its connection for result retrieval, a detached one
    /// opens a fresh connection for every later call.
    #[instrument(skip_all, fields(job = %job.id, detached = detached), level = "info")]
    pub fn deploy_job_cluster(
        &self,
        specification: &ClusterSpecification,
        job: &JobDescriptor,
        detached: bool,
    ) -> Result<ApplicationHandle, DeployError> {
        let request = DeploymentRequest::new(*specification, &self.config, job.jars.clone());
        let workers = specification.workers_for(job.max_parallelism());

        let mut connection = self
            .manager
            .connect()
            .map_err(|e| DeployError::from_manager(e, None, Stage::Connect))?;

        let resources = connection
            .cluster_resources()
            .map_err(|e| DeployError::from_manager(e, None, Stage::Allocation))?;
        let (master_memory_mb, worker_memory_mb) =
            validate_cluster_resources(specification, workers, &resources)?;

        let id = connection
            .new_application()
            .map_err(|e| DeployError::from_manager(e, None, Stage::Allocation))?;
        let staged = connection
            .home_directory()
            .map_err(|e| DeployError::from_manager(e, Some(id), Stage::Staging))
            .and_then(|home| {
                ArtifactStager::new(&self.fs, &self.config, &self.excludes, home).stage(&request, job, id)
            });
        let manifest = match staged {
            Ok(manifest) => manifest,
            Err(e) => {
                // the reserved id would stay NEW otherwise
                abandon(&mut *connection, id);
                return Err(e);
            }
        };

        let submission = ApplicationSubmission {
            id,
            name: job.name.clone(),
            job_id: job.id,
            master_memory_mb,
            worker_memory_mb,
            workers,
            slots_per_worker: specification.slots_per_worker(),
            staging_root: manifest.root().to_path_buf(),
            job_file: manifest.job_file().to_path_buf(),
            local_resources: manifest.entries().values().cloned().collect(),
            shared_lib_dirs: manifest.shared_lib_dirs().to_vec(),
            classpath: manifest.classpath().to_vec(),
            detached,
        };

        debug!(app = %id, classpath = ?submission.classpath, "Submitting application");
        // the staging root goes away with the manifest on failure
        if let Err(e) = connection
            .submit_application(submission)
            .map_err(|e| DeployError::from_manager(e, Some(id), Stage::Submission))
            .and_then(|_| self.wait_for_running(&mut *connection, id))
        {
            abandon(&mut *connection, id);
            return Err(e);
        }

        let staging_root = manifest.persist();
        let connection = if detached {
            info!(app = %id, "Application submitted in detached mode, releasing connection");
            None
        } else {
            Some(connection)
        };

        info!(app = %id, "Deployed job cluster");

        Ok(ApplicationHandle::new(
            id,
            self.manager.clone(),
            connection,
            self.fs.clone(),
            staging_root,
            self.config.monitor.poll_interval,
        ))
    }

    /// wait until the application runs, bounded by the ask timeout
    fn wait_for_running(
        &self,
        connection: &mut dyn ManagerConnection,
        id: ApplicationId,
    ) -> Result<(), DeployError> {
        // unbounded if the timeout does not fit an instant
        let deadline = Instant::now().checked_add(self.config.ask_timeout);
        let mut last_state = ApplicationState::New;

        loop {
            let report = connection
                .application_report(&id)
                .map_err(|e| DeployError::from_manager(e, Some(id), Stage::Acceptance))?;

            if report.state != last_state {
                debug!(app = %id, state = %report.state, "Deployment progressed");
                last_state = report.state;
            }

            match report.state {
                ApplicationState::Running | ApplicationState::Finished => return Ok(()),
                ApplicationState::Failed | ApplicationState::Killed => {
                    error!(app = %id, state = %report.state, diagnostics = %report.diagnostics, "Application did not start");

                    return Err(DeployError::SubmissionRejected {
                        app: Some(id),
                        stage: Stage::Acceptance,
                        reason: format!(
                            "application switched to {} during deployment: {}",
                            report.state, report.diagnostics
                        ),
                    });
                }
                _ => {}
            }

            let poll_interval = self.config.monitor.poll_interval;
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DeployError::TransportError {
                            app: Some(id),
                            stage: Stage::Acceptance,
                            reason: format!(
                                "application still {} after {:?}",
                                report.state, self.config.ask_timeout
                            ),
                        });
                    }

                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };

            thread::sleep(pause);
        }
    }

    /// true if the library directory is present in the staging root of `id`
    pub fn verify_staging(&self, id: &ApplicationId) -> Result<bool, DeployError> {
        let home = self
            .manager
            .connect()
            .and_then(|mut connection| connection.home_directory())
            .map_err(|e| DeployError::from_manager(e, Some(*id), Stage::Staging))?;

        staging::verify_staging(self.fs.as_ref(), &home, &self.config, id).map_err(|source| {
            DeployError::StagingIOError {
                app: *id,
                path: staging_root(&home, id),
                source,
            }
        })
    }

    pub fn teardown_controller(&self) -> TeardownController {
        TeardownController::from_config(&self.config.teardown)
    }
}

/// kill an application that did not make it through deployment
fn abandon(connection: &mut dyn ManagerConnection, id: ApplicationId) {
    if let Err(e) = connection.kill_application(&id) {
        warn!(app = %id, error = %e, "Failed to kill application after failed deployment");
    }
}

/// Container sizes rounded up to the minimum allocation, rejected if the cluster cannot fit them
fn validate_cluster_resources(
    specification: &ClusterSpecification,
    workers: u32,
    resources: &ClusterResources,
) -> Result<(u32, u32), DeployError> {
    let normalize = |memory: u32| {
        let step = resources.min_allocation_mb.max(1);

        memory.div_ceil(step).saturating_mul(step)
    };
    let master = normalize(specification.master_memory_mb());
    let worker = normalize(specification.worker_memory_mb());
    let reject = |reason: String| DeployError::SubmissionRejected {
        app: None,
        stage: Stage::Allocation,
        reason,
    };

    for (role, memory) in [("master", master), ("worker", worker)] {
        if memory > resources.max_allocation_mb {
            return Err(reject(format!(
                "{role} container of {memory} MiB exceeds the maximum allocation of {} MiB",
                resources.max_allocation_mb
            )));
        }
    }

    let total = u64::from(master) + u64::from(worker) * u64::from(workers);
    if total > resources.available_memory_mb {
        return Err(reject(format!(
            "{total} MiB requested but only {} MiB available in the cluster",
            resources.available_memory_mb
        )));
    }

    if master != specification.master_memory_mb() || worker != specification.worker_memory_mb() {
        debug!(master = master, worker = worker, "Rounded container memory up to the minimum allocation");
    }

    Ok((master, worker))
}

/// Deploy `job` attached and start waiting for its result
pub fn deploy(
    descriptor: &ClusterDescriptor,
    job: &JobDescriptor,
) -> Result<(ApplicationHandle, JobResultFuture), DeployError> {
    let specification = descriptor.cluster_specification()?;
    let handle = descriptor.deploy_job_cluster(&specification, job, false)?;
    let result = handle.request_job_result(job.id);

    Ok((handle, result))
}

/// Deploy `job`, run `body` with the handle and the pending result, then always tear down
pub fn with_deployment<T>(
    descriptor: &ClusterDescriptor,
    specification: &ClusterSpecification,
    job: &JobDescriptor,
    body: impl FnOnce(&ApplicationHandle, JobResultFuture) -> Result<T, DeployError>,
) -> Result<(T, TeardownOutcome), DeployError> {
    let handle = descriptor.deploy_job_cluster(specification, job, false)?;
    let result = handle.request_job_result(job.id);
    let value = body(&handle, result);
    let outcome = descriptor.teardown_controller().teardown(handle);

    match (value, outcome) {
        (Ok(value), Ok(outcome)) => Ok((value, outcome)),
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(teardown_error)) => {
            error!(error = %teardown_error, "Teardown failed after a failed deployment body");

            Err(e)
        }
    }
}

/// tear down `handle` with the default polling interval
pub fn teardown(handle: ApplicationHandle, timeout: Duration) -> Result<TeardownOutcome, DeployError> {
    TeardownController::new(crate::teardown::DEFAULT_INTERVAL, timeout).teardown(handle)
}
