use crate::{
    deploy::{handle::ApplicationContext, DeployError, Stage},
    job::{JobId, JobResult},
    manager::ApplicationId,
};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct ResultSlot {
    value: Mutex<Option<Result<JobResult, DeployError>>>,
    resolved: Condvar,
    // set once nobody waits for the result anymore
    cancelled: AtomicBool,
}

impl ResultSlot {
    fn resolve(&self, result: Result<JobResult, DeployError>) {
        let mut value = self.value.lock();

        if value.is_none() {
            *value = Some(result);
            self.resolved.notify_all();
        }
    }
}

/// Result of one job, resolved exactly once by a background monitor thread
#[derive(Debug)]
pub struct JobResultFuture {
    app: ApplicationId,
    job: JobId,
    slot: Arc<ResultSlot>,
    worker: Option<JoinHandle<()>>,
}

impl JobResultFuture {
    pub(crate) fn spawn(context: Arc<ApplicationContext>, job: JobId, interval: Duration) -> Self {
        let app = context.id();
        let slot = Arc::new(ResultSlot::default());
        let worker_slot = slot.clone();

        let worker = thread::Builder::new()
            .name(format!("job-result-{:04}", app.sequence()))
            .spawn(move || {
                let result = await_result(&context, &job, interval, &worker_slot.cancelled);

                worker_slot.resolve(result);
            });

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!(app = %app, error = ?e, "Failed to start job result monitor");
                slot.resolve(Err(DeployError::TransportError {
                    app: Some(app),
                    stage: Stage::Monitoring,
                    reason: format!("failed to start monitor thread: {e}"),
                }));

                None
            }
        };

        Self {
            app,
            job,
            slot,
            worker,
        }
    }

    pub fn application_id(&self) -> ApplicationId {
        self.app
    }

    pub fn job_id(&self) -> JobId {
        self.job
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// block for at most `timeout`, true if the result is available afterwards
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // no representable deadline, wait until resolved
        let deadline = Instant::now().checked_add(timeout);
        let mut value = self.slot.value.lock();

        while value.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.slot.resolved.wait_until(&mut value, deadline).timed_out() {
                        return value.is_some();
                    }
                }
                None => self.slot.resolved.wait(&mut value),
            }
        }

        true
    }

    /// the result if it is already available, the still pending future otherwise
    pub fn try_result(self) -> Result<Result<JobResult, DeployError>, Self> {
        if self.is_resolved() {
            Ok(self.wait())
        } else {
            Err(self)
        }
    }

    /// block until the job result is available
    pub fn wait(mut self) -> Result<JobResult, DeployError> {
        let result = {
            let mut value = self.slot.value.lock();

            loop {
                if let Some(result) = value.take() {
                    break result;
                }

                self.slot.resolved.wait(&mut value);
            }
        };

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(app = %self.app, "Job result monitor panicked");
            }
        }

        result
    }
}

impl Drop for JobResultFuture {
    fn drop(&mut self) {
        self.slot.cancelled.store(true, Ordering::SeqCst);
    }
}

fn await_result(
    context: &ApplicationContext,
    job: &JobId,
    interval: Duration,
    cancelled: &AtomicBool,
) -> Result<JobResult, DeployError> {
    let app = context.id();
    let failed = |error| DeployError::from_manager(error, Some(app), Stage::Monitoring);

    debug!(app = %app, job = %job, "Waiting for job result");

    loop {
        if let Some(result) = context
            .call(|connection| connection.job_result(&app, job))
            .map_err(failed)?
        {
            info!(app = %app, job = %job, success = result.is_success(), "Received job result");

            return Ok(result);
        }

        let report = context
            .call(|connection| connection.application_report(&app))
            .map_err(failed)?;

        if report.state.is_terminal() {
            // the result may have been stored right before the application exited
            return match context
                .call(|connection| connection.job_result(&app, job))
                .map_err(failed)?
            {
                Some(result) => Ok(result),
                None => Err(DeployError::MissingJobResult {
                    app,
                    job: *job,
                    state: report.state,
                    diagnostics: report.diagnostics,
                }),
            };
        }

        if cancelled.load(Ordering::SeqCst) {
            debug!(app = %app, job = %job, "Nobody waits for the job result anymore");

            return Err(DeployError::TransportError {
                app: Some(app),
                stage: Stage::Monitoring,
                reason: "result request was dropped".to_owned(),
            });
        }

        thread::sleep(interval);
    }
}
