use clap::Parser;
use harbor::{
    config::DeployerConfig, job::JobDescriptor, manager, staging::fs::LocalFileSystem,
    with_deployment, ClusterDescriptor,
};
use std::{fs::File, path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Deploy a single job as its own cluster and follow it until it is torn down
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// deployer configuration (yaml)
    #[arg(short, long)]
    config: PathBuf,
    /// job descriptor (yaml)
    #[arg(short, long)]
    job: PathBuf,
    /// additional user jars shipped with the job
    #[arg(long)]
    jar: Vec<PathBuf>,
    /// release the application right after it was accepted
    #[arg(long)]
    detached: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = DeployerConfig::load(&args.config).unwrap_or_log();
    if config.preflight_checks() {
        error!("Configuration contains errors, see above");
        exit(1)
    }

    let mut job: JobDescriptor =
        serde_yaml::from_reader(File::open(&args.job).unwrap_or_log()).unwrap_or_log();
    args.jar.into_iter().for_each(|jar| job.add_jar(jar));

    let manager = manager::load(&config.cluster).unwrap_or_log();
    let descriptor =
        ClusterDescriptor::new(config, manager, Arc::new(LocalFileSystem)).unwrap_or_log();
    let specification = descriptor.cluster_specification().unwrap_or_log();

    if args.detached {
        let handle = descriptor
            .deploy_job_cluster(&specification, &job, true)
            .unwrap_or_log();

        info!(app = %handle.id(), job = %job.id, "Submitted job in detached mode");
        return;
    }

    let deployed = with_deployment(&descriptor, &specification, &job, |handle, result| {
        let result = result.wait()?;
        let lib_uploaded = descriptor.verify_staging(&handle.id())?;

        info!(app = %handle.id(), lib_uploaded = lib_uploaded, "Checked staging directory");

        Ok(result)
    });

    match deployed {
        Ok((result, outcome)) => {
            if outcome.is_forced() {
                warn!("Application had to be killed during teardown");
            }

            match result.into_result() {
                Ok(result) => info!(job = %result.job_id, runtime = ?result.net_runtime, "Job succeeded"),
                Err(failure) => {
                    error!(trace = %failure.cause.trace, "{failure}");
                    exit(2)
                }
            }
        }
        Err(e) => {
            error!(application = ?e.application_id(), "Deployment failed: {e}");
            exit(1)
        }
    }
}
