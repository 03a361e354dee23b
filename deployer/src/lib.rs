pub mod config;
pub mod deploy;
pub mod job;
pub mod manager;
pub mod monitor;
pub mod specification;
pub mod staging;
pub mod teardown;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod deploy_test;
#[cfg(test)]
mod teardown_test;

pub use deploy::{
    deploy, handle::ApplicationHandle, teardown, with_deployment, ClusterDescriptor, DeployError,
};
pub use monitor::JobResultFuture;
pub use teardown::TeardownOutcome;
