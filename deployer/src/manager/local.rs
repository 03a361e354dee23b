use super::{
    ApplicationId, ApplicationReport, ApplicationState, ApplicationSubmission, ClusterResources,
    FinalApplicationStatus, ManagerConnection, ManagerError, ResourceManager,
};
use crate::{
    config::{get_tmp_dir, ClusterConfig, ConfigErrors},
    job::{JobDescriptor, JobId, JobResult, Operator, SerializedFailure},
    staging::CACHE_DIR,
};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

/// host every local application master reports
static HOST: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname, reporting localhost");

        "localhost".to_owned()
    }
});

#[derive(Clone, Debug)]
pub struct LocalClusterConfig {
    // home directories are created below `<root>/home`
    pub root: PathBuf,
    pub user: String,
    pub total_memory_mb: u64,
    pub min_allocation_mb: u32,
    pub max_allocation_mb: u32,
    // how long an application master lingers after its job is done
    pub exit_delay: Duration,
    // application masters ignore stop requests and never exit on their own
    pub unresponsive: bool,
}

impl LocalClusterConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            user: "harbor".to_owned(),
            total_memory_mb: 8192,
            min_allocation_mb: 256,
            max_allocation_mb: 4096,
            exit_delay: Duration::from_millis(200),
            unresponsive: false,
        }
    }
}

/// In-process resource manager session, applications run as threads of the current process.
/// Every application still alive when the session is dropped is killed.
#[derive(Debug)]
pub struct LocalCluster {
    state: Arc<ClusterState>,
}

#[derive(Debug)]
struct ClusterState {
    config: LocalClusterConfig,
    timestamp: u64,
    sequence: AtomicU32,
    available: AtomicBool,
    applications: Mutex<BTreeMap<ApplicationId, Application>>,
    changed: Condvar,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Application {
    report: ApplicationReport,
    memory_mb: u64,
    job_id: Option<JobId>,
    result: Option<JobResult>,
    stop_requested: bool,
}

impl LocalCluster {
    pub fn start(config: LocalClusterConfig) -> io::Result<Self> {
        fs::create_dir_all(config.root.join("home").join(&config.user))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        info!(
            root = ?config.root,
            timestamp = timestamp,
            "Started local resource manager"
        );

        Ok(Self {
            state: Arc::new(ClusterState {
                config,
                timestamp,
                sequence: AtomicU32::new(0),
                available: AtomicBool::new(true),
                applications: Mutex::new(BTreeMap::new()),
                changed: Condvar::new(),
                runners: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn load(config: &ClusterConfig) -> Result<Self, ConfigErrors> {
        let root = match config.get("root") {
            Some(value) => match value.as_str() {
                Some(root) => PathBuf::from(root),
                None => {
                    return Err(ConfigErrors::InvalidParameter {
                        name: "root".to_owned(),
                        reason: "must be a path".to_owned(),
                    })
                }
            },
            None => get_tmp_dir().join("harbor-cluster"),
        };
        let mut cluster_config = LocalClusterConfig::new(root);

        if let Some(user) = config.get("user").and_then(serde_yaml::Value::as_str) {
            cluster_config.user = user.to_owned();
        }
        if let Some(total) = config.get_u64("total_memory_mb")? {
            cluster_config.total_memory_mb = total;
        }
        if let Some(min) = config.get_u64("min_allocation_mb")? {
            cluster_config.min_allocation_mb = allocation(min, "min_allocation_mb")?;
        }
        if let Some(max) = config.get_u64("max_allocation_mb")? {
            cluster_config.max_allocation_mb = allocation(max, "max_allocation_mb")?;
        }
        if let Some(delay) = config.get_u64("exit_delay_ms")? {
            cluster_config.exit_delay = Duration::from_millis(delay);
        }
        match config.get("unresponsive") {
            Some(value) => match value.as_bool() {
                Some(unresponsive) => cluster_config.unresponsive = unresponsive,
                None => {
                    return Err(ConfigErrors::InvalidParameter {
                        name: "unresponsive".to_owned(),
                        reason: "must be a boolean".to_owned(),
                    })
                }
            },
            None => {}
        }

        Ok(Self::start(cluster_config)?)
    }

    pub fn config(&self) -> &LocalClusterConfig {
        &self.state.config
    }

    pub fn home_directory(&self) -> PathBuf {
        self.state.home_directory()
    }

    /// refuse every connection and RPC while false
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn application(&self, id: &ApplicationId) -> Option<ApplicationReport> {
        self.state
            .applications
            .lock()
            .get(id)
            .map(|application| application.report.clone())
    }

    /// runner threads that were not joined yet
    pub fn runner_count(&self) -> usize {
        self.state.runners.lock().len()
    }

    pub fn applications(&self) -> Vec<ApplicationReport> {
        self.state
            .applications
            .lock()
            .values()
            .map(|application| application.report.clone())
            .collect()
    }
}

/// join the runners of applications that already exited
fn reap_finished(runners: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(runners)
        .into_iter()
        .partition(JoinHandle::is_finished);
    *runners = running;

    for runner in finished {
        if runner.join().is_err() {
            error!("Application runner panicked");
        }
    }
}

fn allocation(value: u64, name: &str) -> Result<u32, ConfigErrors> {
    u32::try_from(value).map_err(|_| ConfigErrors::InvalidParameter {
        name: name.to_owned(),
        reason: "exceeds the supported container size".to_owned(),
    })
}

impl ResourceManager for LocalCluster {
    fn connect(&self) -> Result<Box<dyn ManagerConnection>, ManagerError> {
        self.state.check_available()?;

        Ok(Box::new(LocalConnection {
            state: self.state.clone(),
        }))
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        {
            let mut applications = self.state.applications.lock();

            for application in applications.values_mut() {
                if !application.report.state.is_terminal() {
                    debug!(app = %application.report.id, "Killing application on shutdown");
                    application.kill("local resource manager shut down");
                }
            }
            self.state.changed.notify_all();
        }

        let runners = std::mem::take(&mut *self.state.runners.lock());
        for runner in runners {
            if runner.join().is_err() {
                error!("Application runner panicked");
            }
        }

        info!("Stopped local resource manager");
    }
}

impl Application {
    fn kill(&mut self, diagnostics: &str) {
        self.report.state = ApplicationState::Killed;
        self.report.final_status = FinalApplicationStatus::Killed;
        self.report.diagnostics = diagnostics.to_owned();
    }
}

impl ClusterState {
    fn check_available(&self) -> Result<(), ManagerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ManagerError::Transport(format!(
                "connection to {} refused",
                *HOST
            )))
        }
    }

    fn home_directory(&self) -> PathBuf {
        self.config.root.join("home").join(&self.config.user)
    }

    fn used_memory_mb(applications: &BTreeMap<ApplicationId, Application>) -> u64 {
        applications
            .values()
            .filter(|application| !application.report.state.is_terminal())
            .map(|application| application.memory_mb)
            .sum()
    }

    /// move a live application to `next`, false if it already reached a terminal state
    fn transition(&self, id: &ApplicationId, next: ApplicationState) -> bool {
        let mut applications = self.applications.lock();

        match applications.get_mut(id) {
            Some(application) if !application.report.state.is_terminal() => {
                debug!(app = %id, from = %application.report.state, to = %next, "Application changed state");
                application.report.state = next;
                self.changed.notify_all();

                true
            }
            _ => false,
        }
    }

    fn fail(&self, id: &ApplicationId, diagnostics: String) {
        let mut applications = self.applications.lock();

        if let Some(application) = applications.get_mut(id) {
            if !application.report.state.is_terminal() {
                warn!(app = %id, diagnostics = %diagnostics, "Application failed");
                application.report.state = ApplicationState::Failed;
                application.report.final_status = FinalApplicationStatus::Failed;
                application.report.diagnostics = diagnostics;
                self.changed.notify_all();
            }
        }
    }

    fn complete(&self, id: &ApplicationId, result: JobResult) {
        let mut applications = self.applications.lock();

        if let Some(application) = applications.get_mut(id) {
            if !application.report.state.is_terminal() {
                application.result = Some(result);
                self.changed.notify_all();
            }
        }
    }

    /// keep the application master alive until its exit delay passed or a stop was requested
    fn linger(&self, id: &ApplicationId) {
        // no deadline if the delay does not fit an instant
        let deadline = Instant::now().checked_add(self.config.exit_delay);
        let mut applications = self.applications.lock();

        loop {
            let (terminal, stop_requested) = match applications.get(id) {
                Some(application) => (
                    application.report.state.is_terminal(),
                    application.stop_requested,
                ),
                None => return,
            };

            if terminal {
                return;
            }

            if stop_requested && !self.config.unresponsive {
                break;
            }

            match deadline {
                Some(deadline) if !self.config.unresponsive => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    self.changed.wait_until(&mut applications, deadline);
                }
                _ => self.changed.wait(&mut applications),
            }
        }

        if let Some(application) = applications.get_mut(id) {
            let succeeded = application
                .result
                .as_ref()
                .is_some_and(JobResult::is_success);

            application.report.state = ApplicationState::Finished;
            application.report.final_status = if succeeded {
                FinalApplicationStatus::Succeeded
            } else {
                FinalApplicationStatus::Failed
            };
            info!(app = %id, "Application master exited");
        }
        self.changed.notify_all();
    }
}

fn run_application(state: Arc<ClusterState>, submission: ApplicationSubmission) {
    let id = submission.id;

    if !state.transition(&id, ApplicationState::Accepted) {
        return;
    }

    if let Err(diagnostics) = localize(&submission) {
        state.fail(&id, diagnostics);
        return;
    }

    if !state.transition(&id, ApplicationState::Running) {
        return;
    }
    info!(app = %id, host = %HOST.as_str(), "Application master started");

    let job = match File::open(&submission.job_file)
        .map_err(|e| e.to_string())
        .and_then(|file| {
            serde_yaml::from_reader::<_, JobDescriptor>(file).map_err(|e| e.to_string())
        }) {
        Ok(job) => job,
        Err(e) => {
            state.fail(
                &id,
                format!(
                    "Failed to load job from {}: {e}",
                    submission.job_file.to_string_lossy()
                ),
            );
            return;
        }
    };

    let result = execute(&job, &submission);
    debug!(app = %id, job = %job.id, success = result.is_success(), "Job reached a terminal state");
    state.complete(&id, result);
    state.linger(&id);
}

/// every container needs its resources present before it starts
fn localize(submission: &ApplicationSubmission) -> Result<(), String> {
    submission
        .local_resources
        .iter()
        .chain(submission.shared_lib_dirs.iter())
        .chain(std::iter::once(&submission.job_file))
        .find(|path| !path.exists())
        .map_or(Ok(()), |missing| {
            Err(format!(
                "Resource {} was not found while localizing containers",
                missing.to_string_lossy()
            ))
        })
}

fn execute(job: &JobDescriptor, submission: &ApplicationSubmission) -> JobResult {
    let start = Instant::now();
    let slots = submission.workers * submission.slots_per_worker;

    if job.max_parallelism() > slots {
        return JobResult::failure(
            job.id,
            start.elapsed(),
            SerializedFailure {
                message: format!(
                    "Could not acquire the minimum required resources: {} slots requested, {slots} available",
                    job.max_parallelism()
                ),
                trace: format!("at scheduler of {}", submission.id),
            },
        );
    }

    for vertex in job.vertices.iter() {
        for subtask in 0..vertex.parallelism {
            if let Err(message) = run_operator(&vertex.operator, &submission.staging_root) {
                return JobResult::failure(
                    job.id,
                    start.elapsed(),
                    SerializedFailure {
                        message,
                        trace: format!(
                            "at {} ({}/{}) on {}",
                            vertex.name,
                            subtask + 1,
                            vertex.parallelism,
                            *HOST
                        ),
                    },
                );
            }
        }
    }

    JobResult::success(job.id, start.elapsed())
}

fn run_operator(operator: &Operator, staging_root: &Path) -> Result<(), String> {
    match operator {
        Operator::NoDataSource | Operator::DiscardingSink => Ok(()),
        Operator::CacheFileReader { name } => {
            let path = staging_root.join(CACHE_DIR).join(name);
            let readable = if path.is_dir() {
                fs::read_dir(&path).map(|_| ())
            } else {
                fs::read(&path).map(|_| ())
            };

            readable.map_err(|e| {
                format!(
                    "Cache file '{name}' is not available at {}: {e}",
                    path.to_string_lossy()
                )
            })
        }
        Operator::Failing { message } => Err(message.clone()),
    }
}

#[derive(Debug)]
struct LocalConnection {
    state: Arc<ClusterState>,
}

impl ManagerConnection for LocalConnection {
    fn home_directory(&mut self) -> Result<PathBuf, ManagerError> {
        self.state.check_available()?;

        Ok(self.state.home_directory())
    }

    fn cluster_resources(&mut self) -> Result<ClusterResources, ManagerError> {
        self.state.check_available()?;
        let applications = self.state.applications.lock();

        Ok(ClusterResources {
            min_allocation_mb: self.state.config.min_allocation_mb,
            max_allocation_mb: self.state.config.max_allocation_mb,
            available_memory_mb: self
                .state
                .config
                .total_memory_mb
                .saturating_sub(ClusterState::used_memory_mb(&applications)),
        })
    }

    fn new_application(&mut self) -> Result<ApplicationId, ManagerError> {
        self.state.check_available()?;
        let id = ApplicationId::new(
            self.state.timestamp,
            self.state.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        );

        self.state.applications.lock().insert(
            id,
            Application {
                report: ApplicationReport {
                    id,
                    name: String::new(),
                    state: ApplicationState::New,
                    final_status: FinalApplicationStatus::Undefined,
                    diagnostics: String::new(),
                    host: HOST.clone(),
                },
                memory_mb: 0,
                job_id: None,
                result: None,
                stop_requested: false,
            },
        );

        Ok(id)
    }

    fn submit_application(&mut self, submission: ApplicationSubmission) -> Result<(), ManagerError> {
        self.state.check_available()?;
        let id = submission.id;
        let config = &self.state.config;

        {
            let mut applications = self.state.applications.lock();
            let used = ClusterState::used_memory_mb(&applications);
            let application = applications
                .get_mut(&id)
                .ok_or(ManagerError::UnknownApplication(id))?;

            if application.report.state != ApplicationState::New {
                return Err(ManagerError::Rejected(format!(
                    "{id} was already submitted"
                )));
            }

            let largest = submission.master_memory_mb.max(submission.worker_memory_mb);
            if largest > config.max_allocation_mb {
                return Err(ManagerError::Rejected(format!(
                    "container of {largest} MiB exceeds the maximum allocation of {} MiB",
                    config.max_allocation_mb
                )));
            }

            let requested = submission.total_memory_mb();
            if used + requested > config.total_memory_mb {
                return Err(ManagerError::Rejected(format!(
                    "insufficient cluster resources: {requested} MiB requested, {} MiB available",
                    config.total_memory_mb.saturating_sub(used)
                )));
            }

            application.report.name = submission.name.clone();
            application.report.state = ApplicationState::Submitted;
            application.memory_mb = requested;
            application.job_id = Some(submission.job_id);
        }

        let state = self.state.clone();
        let runner = thread::Builder::new()
            .name(format!("local-app-{:04}", id.sequence()))
            .spawn(move || run_application(state, submission))
            .map_err(|e| {
                self.state
                    .fail(&id, format!("Failed to launch application master: {e}"));

                ManagerError::Transport(e.to_string())
            })?;

        let mut runners = self.state.runners.lock();
        reap_finished(&mut runners);
        runners.push(runner);
        drop(runners);

        info!(app = %id, "Submitted application");

        Ok(())
    }

    fn application_report(&mut self, id: &ApplicationId) -> Result<ApplicationReport, ManagerError> {
        self.state.check_available()?;

        self.state
            .applications
            .lock()
            .get(id)
            .map(|application| application.report.clone())
            .ok_or(ManagerError::UnknownApplication(*id))
    }

    fn job_result(
        &mut self,
        id: &ApplicationId,
        job: &JobId,
    ) -> Result<Option<JobResult>, ManagerError> {
        self.state.check_available()?;
        let applications = self.state.applications.lock();
        let application = applications
            .get(id)
            .ok_or(ManagerError::UnknownApplication(*id))?;

        Ok(application
            .result
            .as_ref()
            .filter(|_| application.job_id.as_ref() == Some(job))
            .cloned())
    }

    fn stop_application(&mut self, id: &ApplicationId) -> Result<(), ManagerError> {
        self.state.check_available()?;
        let mut applications = self.state.applications.lock();
        let application = applications
            .get_mut(id)
            .ok_or(ManagerError::UnknownApplication(*id))?;

        application.stop_requested = true;
        self.state.changed.notify_all();

        Ok(())
    }

    fn kill_application(&mut self, id: &ApplicationId) -> Result<(), ManagerError> {
        self.state.check_available()?;
        let mut applications = self.state.applications.lock();
        let application = applications
            .get_mut(id)
            .ok_or(ManagerError::UnknownApplication(*id))?;

        if !application.report.state.is_terminal() {
            warn!(app = %id, "Killing application");
            application.kill("Application killed by user");
            self.state.changed.notify_all();
        }

        Ok(())
    }
}
