use crate::{
    job::JobId,
    manager::{ApplicationId, ApplicationReport, ManagerConnection, ManagerError, ResourceManager},
    monitor::JobResultFuture,
    staging::fs::SharedFileSystem,
};
use parking_lot::FairMutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, warn};

/// Shared between a handle and the monitors it spawned
#[derive(Debug)]
pub(crate) struct ApplicationContext {
    id: ApplicationId,
    manager: Arc<dyn ResourceManager>,
    // None once the client detached from the application
    connection: Option<Arc<FairMutex<Box<dyn ManagerConnection>>>>,
}

impl ApplicationContext {
    pub(crate) fn id(&self) -> ApplicationId {
        self.id
    }

    /// run `call` on the attached connection, or on a fresh one when detached
    pub(crate) fn call<T>(
        &self,
        call: impl FnOnce(&mut dyn ManagerConnection) -> Result<T, ManagerError>,
    ) -> Result<T, ManagerError> {
        match self.connection {
            Some(ref connection) => {
                let mut guard = connection.lock_arc();

                call(&mut **guard)
            }
            None => {
                let mut connection = self.manager.connect()?;

                call(&mut *connection)
            }
        }
    }
}

/// Client side view of one running application, valid until it is torn down.
///
/// Dropping an attached handle without tearing it down kills the application.
#[derive(Debug)]
pub struct ApplicationHandle {
    context: Arc<ApplicationContext>,
    fs: Arc<dyn SharedFileSystem>,
    staging_root: PathBuf,
    poll_interval: Duration,
    retired: bool,
}

impl ApplicationHandle {
    pub(crate) fn new(
        id: ApplicationId,
        manager: Arc<dyn ResourceManager>,
        connection: Option<Box<dyn ManagerConnection>>,
        fs: Arc<dyn SharedFileSystem>,
        staging_root: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            context: Arc::new(ApplicationContext {
                id,
                manager,
                connection: connection.map(|connection| Arc::new(FairMutex::new(connection))),
            }),
            fs,
            staging_root,
            poll_interval,
            retired: false,
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.context.id
    }

    pub fn is_detached(&self) -> bool {
        self.context.connection.is_none()
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn report(&self) -> Result<ApplicationReport, ManagerError> {
        let id = self.id();

        self.context.call(|connection| connection.application_report(&id))
    }

    /// Start waiting for the result of `job`, the returned future resolves exactly once
    pub fn request_job_result(&self, job: JobId) -> JobResultFuture {
        JobResultFuture::spawn(self.context.clone(), job, self.poll_interval)
    }

    pub(crate) fn context(&self) -> &ApplicationContext {
        &self.context
    }

    pub(crate) fn fs(&self) -> &dyn SharedFileSystem {
        self.fs.as_ref()
    }

    /// the application is gone, dropping the handle no longer touches it
    pub(crate) fn retire(mut self) {
        self.retired = true;
        debug!(app = %self.id(), "Retired application handle");
    }
}

impl Drop for ApplicationHandle {
    fn drop(&mut self) {
        if self.retired || self.is_detached() {
            return;
        }

        let id = self.id();
        warn!(app = %id, "Application handle dropped without teardown, killing the application");

        if let Err(error) = self
            .context
            .call(|connection| connection.kill_application(&id))
        {
            error!(app = %id, error = %error, "Failed to kill abandoned application");
        }

        if let Err(error) = self.fs.remove_dir_all(&self.staging_root) {
            debug!(app = %id, error = ?error, "Failed to remove staging root of abandoned application");
        }
    }
}
