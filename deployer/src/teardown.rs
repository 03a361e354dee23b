use crate::{
    config::TeardownConfig,
    deploy::{handle::ApplicationHandle, DeployError, Stage},
};
use std::{
    fmt, thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Running,
    Terminating,
    Finished,
    Killed,
}

impl TeardownState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Killed)
    }
}

impl fmt::Display for TeardownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Finished => "FINISHED",
            Self::Killed => "KILLED",
        })
    }
}

/// How an application was torn down, both mean the application is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// the application exited on its own
    Finished,
    /// the application had to be killed after the timeout
    Killed,
}

impl TeardownOutcome {
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Killed)
    }
}

/// Waits for an application to exit and kills it once the timeout elapsed
#[derive(Debug, Clone)]
pub struct TeardownController {
    interval: Duration,
    timeout: Duration,
    state: TeardownState,
}

impl Default for TeardownController {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_TIMEOUT)
    }
}

impl TeardownController {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            state: TeardownState::Running,
        }
    }

    pub fn from_config(config: &TeardownConfig) -> Self {
        Self::new(config.interval, config.timeout)
    }

    pub fn state(&self) -> TeardownState {
        self.state
    }

    fn transition(&mut self, next: TeardownState) {
        debug!(from = %self.state, to = %next, "Teardown changed state");
        self.state = next;
    }

    /// Ask the application to stop and wait for it to exit, kill it once `timeout` passed.
    /// Only a failing kill request is an error.
    #[instrument(skip_all, fields(app = %handle.id()), level = "info")]
    pub fn teardown(&mut self, handle: ApplicationHandle) -> Result<TeardownOutcome, DeployError> {
        let id = handle.id();
        let start = Instant::now();

        self.state = TeardownState::Running;
        self.transition(TeardownState::Terminating);
        if let Err(error) = handle
            .context()
            .call(|connection| connection.stop_application(&id))
        {
            warn!(app = %id, error = %error, "Failed to request a graceful stop");
        }

        loop {
            match handle.report() {
                Ok(report) if report.state.is_terminal() => {
                    info!(app = %id, state = %report.state, final_status = ?report.final_status, "Application exited");
                    self.transition(TeardownState::Finished);

                    break;
                }
                Ok(report) => {
                    debug!(app = %id, state = %report.state, "Waiting for application to exit");
                }
                Err(error) => {
                    warn!(app = %id, error = %error, "Failed to retrieve application state");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                break;
            }

            thread::sleep(self.interval.min(self.timeout - elapsed));
        }

        if self.state == TeardownState::Terminating {
            warn!(
                app = %id,
                timeout = ?self.timeout,
                "Application did not exit in time, killing it"
            );

            if let Err(error) = handle
                .context()
                .call(|connection| connection.kill_application(&id))
            {
                handle.retire();

                return Err(DeployError::from_manager(error, Some(id), Stage::Teardown));
            }

            self.transition(TeardownState::Killed);
        }

        match handle.fs().remove_dir_all(handle.staging_root()) {
            Ok(()) => debug!(app = %id, "Removed staging root"),
            Err(error) => warn!(app = %id, error = ?error, "Failed to remove staging root"),
        }
        handle.retire();

        Ok(match self.state {
            TeardownState::Killed => TeardownOutcome::Killed,
            _ => TeardownOutcome::Finished,
        })
    }
}
