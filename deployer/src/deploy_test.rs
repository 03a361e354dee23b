use crate::{
    deploy::{deploy, teardown, with_deployment, DeployError, Stage},
    job::{JobDescriptor, JobId, Operator},
    manager::{ApplicationId, ApplicationState},
    specification::{MemorySize, UserJarInclusion},
    staging::fs::{LocalFileSystem, SharedFileSystem},
    testing::{testing_job, Fixture},
    ClusterDescriptor, TeardownOutcome,
};
use std::{
    fs, io,
    io::Write,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// reports every upload of `skip` as done without writing anything
#[derive(Debug)]
struct ForgetfulFileSystem {
    skip: &'static str,
}

impl SharedFileSystem for ForgetfulFileSystem {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        LocalFileSystem.exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.create_dir_all(path)
    }

    fn copy_file(&self, local: &Path, remote: &Path) -> io::Result<u64> {
        if remote.file_name().is_some_and(|name| name == self.skip) {
            return Ok(0);
        }

        LocalFileSystem.copy_file(local, remote)
    }

    fn copy_directory(&self, local: &Path, remote: &Path) -> io::Result<u64> {
        LocalFileSystem.copy_directory(local, remote)
    }

    fn open_for_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        LocalFileSystem.open_for_write(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.remove_dir_all(path)
    }
}

fn state(fixture: &Fixture, id: &ApplicationId) -> ApplicationState {
    fixture.cluster.application(id).unwrap().state
}

fn staged(fixture: &Fixture, id: &ApplicationId) -> bool {
    fixture.staging_base().join(id.to_string()).exists()
}

#[test]
pub fn per_job_cluster_with_disabled_user_jar_inclusion() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let job = testing_job(&fixture.jar);

    let (handle, result) = deploy(&descriptor, &job).unwrap();
    let id = handle.id();

    assert!(!handle.is_detached());
    assert_eq!(handle.staging_root(), fixture.staging_base().join(id.to_string()));

    let result = result.wait().unwrap();
    assert!(result.is_success());
    assert_eq!(result.job_id, job.id);

    // lib dir was uploaded since no provided lib dirs are configured
    assert!(descriptor.verify_staging(&id).unwrap());

    let start = Instant::now();
    assert_eq!(
        teardown(handle, TEARDOWN_TIMEOUT).unwrap(),
        TeardownOutcome::Finished
    );
    assert!(start.elapsed() < TEARDOWN_TIMEOUT);
    assert_eq!(state(&fixture, &id), ApplicationState::Finished);
    assert!(!staged(&fixture, &id));
}

#[test]
pub fn unbounded_timeouts_wait_for_the_application() {
    let mut fixture = Fixture::with_cluster(|config| config.exit_delay = Duration::MAX);
    fixture.config.ask_timeout = Duration::MAX;
    let descriptor = fixture.descriptor();

    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let id = handle.id();

    assert!(result.wait_timeout(Duration::MAX));
    assert!(result.is_resolved());
    assert!(result.wait().unwrap().is_success());

    // the application master lingers until it is asked to stop
    assert_eq!(state(&fixture, &id), ApplicationState::Running);
    assert_eq!(teardown(handle, TEARDOWN_TIMEOUT).unwrap(), TeardownOutcome::Finished);
    assert_eq!(state(&fixture, &id), ApplicationState::Finished);
}

#[test]
pub fn per_job_cluster_with_provided_lib_dirs() {
    let mut fixture = Fixture::new();
    fixture.provide_lib_dir();
    let descriptor = fixture.descriptor();
    let job = testing_job(&fixture.jar);

    let (handle, result) = deploy(&descriptor, &job).unwrap();
    let id = handle.id();

    assert!(result.wait().unwrap().is_success());
    // lib dir is expected on every node instead
    assert!(!descriptor.verify_staging(&id).unwrap());
    assert!(staged(&fixture, &id));

    assert_eq!(
        teardown(handle, TEARDOWN_TIMEOUT).unwrap(),
        TeardownOutcome::Finished
    );
    assert_eq!(state(&fixture, &id), ApplicationState::Finished);
}

#[test]
pub fn per_job_cluster_with_user_jar_on_classpath() {
    for inclusion in [UserJarInclusion::IncludeFirst, UserJarInclusion::IncludeLast] {
        let mut fixture = Fixture::new();
        fixture.config.classpath_include_user_jar = inclusion;
        let descriptor = fixture.descriptor();
        let job = testing_job(&fixture.jar);

        let (handle, result) = deploy(&descriptor, &job).unwrap();

        assert!(result.wait().unwrap().is_success(), "{inclusion}");
        assert!(handle.staging_root().join("harbor-tests.jar").is_file());
        teardown(handle, TEARDOWN_TIMEOUT).unwrap();
    }
}

#[test]
pub fn per_job_cluster_with_distributed_cache() {
    let fixture = Fixture::new();
    let cached = fixture.path().join("words");
    fs::create_dir_all(&cached).unwrap();
    fs::write(cached.join("part-0"), "hello\nharbor\n").unwrap();

    let mut job = JobDescriptor::builder("distributed cache job")
        .parallelism(2)
        .source(Operator::NoDataSource)
        .operator(Operator::CacheFileReader {
            name: "words".to_owned(),
        })
        .sink(Operator::DiscardingSink)
        .build();
    job.add_jar(&fixture.jar);
    job.register_cache_file("words", &cached);

    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &job).unwrap();

    assert!(result.wait().unwrap().is_success());
    teardown(handle, TEARDOWN_TIMEOUT).unwrap();
}

#[test]
pub fn unregistered_cache_file_fails_the_job() {
    let fixture = Fixture::new();
    let mut job = JobDescriptor::builder("distributed cache job")
        .source(Operator::CacheFileReader {
            name: "missing".to_owned(),
        })
        .sink(Operator::DiscardingSink)
        .build();
    job.add_jar(&fixture.jar);

    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &job).unwrap();

    let failure = result.wait().unwrap().into_result().unwrap_err();
    assert!(failure.cause.message.contains("Cache file 'missing'"));
    teardown(handle, TEARDOWN_TIMEOUT).unwrap();
}

#[test]
pub fn job_failure_cause_is_kept_verbatim() {
    let fixture = Fixture::new();
    let message = "Job failed: user code threw IllegalStateException(\"state 7\")";
    let mut job = JobDescriptor::builder("failing job")
        .source(Operator::NoDataSource)
        .operator(Operator::Failing {
            message: message.to_owned(),
        })
        .sink(Operator::DiscardingSink)
        .build();
    job.add_jar(&fixture.jar);

    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &job).unwrap();

    // a failed job is still a delivered result
    let result = result.wait().unwrap();
    assert!(!result.is_success());

    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.job, job.id);
    assert_eq!(failure.cause.message, message);
    assert_eq!(failure.to_string(), format!("job {} failed: {message}", job.id));

    assert_eq!(
        teardown(handle, TEARDOWN_TIMEOUT).unwrap(),
        TeardownOutcome::Finished
    );
}

#[test]
pub fn oversized_container_is_rejected() {
    let mut fixture = Fixture::new();
    fixture.config.memory.master = MemorySize::from_mebibytes(8192);
    let descriptor = fixture.descriptor();

    match deploy(&descriptor, &testing_job(&fixture.jar)) {
        Err(error @ DeployError::SubmissionRejected { .. }) => {
            assert!(!error.is_retriable());
            assert_eq!(error.application_id(), None);
            assert!(matches!(
                error,
                DeployError::SubmissionRejected {
                    stage: Stage::Allocation,
                    ..
                }
            ));
        }
        other => panic!("expected a rejection, got {other:?}"),
    }

    assert!(fixture.cluster.applications().is_empty());
    assert!(!fixture.staging_base().exists());
}

#[test]
pub fn insufficient_cluster_memory_is_rejected() {
    let mut fixture = Fixture::with_cluster(|config| config.total_memory_mb = 2048);
    fixture.config.workers = 2;
    let descriptor = fixture.descriptor();

    let error = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap_err();

    assert!(
        matches!(error, DeployError::SubmissionRejected { ref reason, .. } if reason.contains("available")),
        "{error}"
    );
}

#[test]
pub fn invalid_specification_is_rejected_before_connecting() {
    let mut fixture = Fixture::new();
    fixture.config.slots_per_worker = 0;
    fixture.cluster.set_available(false);
    let descriptor = fixture.descriptor();

    assert!(matches!(
        deploy(&descriptor, &testing_job(&fixture.jar)),
        Err(DeployError::InvalidSpecification(_))
    ));
}

#[test]
pub fn unreachable_manager_is_a_transport_error() {
    let fixture = Fixture::new();
    fixture.cluster.set_available(false);
    let descriptor = fixture.descriptor();

    let error = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap_err();

    assert!(error.is_retriable());
    assert!(matches!(
        error,
        DeployError::TransportError {
            app: None,
            stage: Stage::Connect,
            ..
        }
    ));
}

#[test]
pub fn failed_staging_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let mut job = testing_job(&fixture.jar);
    job.add_jar(fixture.path().join("missing.jar"));

    let error = deploy(&descriptor, &job).unwrap_err();
    let id = error.application_id().unwrap();

    assert!(matches!(error, DeployError::StagingIOError { .. }));
    assert!(!staged(&fixture, &id));
    // the reserved application is released instead of staying NEW
    assert_eq!(state(&fixture, &id), ApplicationState::Killed);

    // the cluster keeps accepting deployments
    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    assert!(result.wait().unwrap().is_success());
    assert_eq!(teardown(handle, TEARDOWN_TIMEOUT).unwrap(), TeardownOutcome::Finished);
}

#[test]
pub fn application_failing_to_start_is_rejected() {
    let fixture = Fixture::new();
    let descriptor = ClusterDescriptor::new(
        fixture.config.clone(),
        fixture.cluster.clone(),
        Arc::new(ForgetfulFileSystem {
            skip: "harbor-tests.jar",
        }),
    )
    .unwrap();

    let error = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap_err();
    let id = error.application_id().unwrap();

    match error {
        DeployError::SubmissionRejected { stage, reason, .. } => {
            assert_eq!(stage, Stage::Acceptance);
            assert!(reason.contains("harbor-tests.jar"), "{reason}");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(state(&fixture, &id), ApplicationState::Failed);
    assert!(!staged(&fixture, &id));
}

#[test]
pub fn detached_handle_reconnects() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let specification = descriptor.cluster_specification().unwrap();
    let job = testing_job(&fixture.jar);

    let handle = descriptor
        .deploy_job_cluster(&specification, &job, true)
        .unwrap();

    assert!(handle.is_detached());
    assert!(handle.report().is_ok());

    let result = handle.request_job_result(job.id);
    assert_eq!(result.application_id(), handle.id());
    assert_eq!(result.job_id(), job.id);
    assert!(result.wait().unwrap().is_success());

    assert_eq!(
        teardown(handle, TEARDOWN_TIMEOUT).unwrap(),
        TeardownOutcome::Finished
    );
}

#[test]
pub fn dropped_detached_handle_leaves_application_running() {
    let fixture = Fixture::with_cluster(|config| config.unresponsive = true);
    let descriptor = fixture.descriptor();
    let specification = descriptor.cluster_specification().unwrap();

    let handle = descriptor
        .deploy_job_cluster(&specification, &testing_job(&fixture.jar), true)
        .unwrap();
    let id = handle.id();
    drop(handle);

    assert_eq!(state(&fixture, &id), ApplicationState::Running);
    assert!(staged(&fixture, &id));
}

#[test]
pub fn dropped_attached_handle_kills_application() {
    let fixture = Fixture::with_cluster(|config| config.unresponsive = true);
    let descriptor = fixture.descriptor();

    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let id = handle.id();
    assert!(result.wait().unwrap().is_success());
    drop(handle);

    assert_eq!(state(&fixture, &id), ApplicationState::Killed);
    assert!(!staged(&fixture, &id));
}

#[test]
pub fn result_of_unknown_job_is_missing() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();

    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let unknown = JobId::generate();

    match handle.request_job_result(unknown).wait() {
        Err(DeployError::MissingJobResult { app, job, state, .. }) => {
            assert_eq!(app, handle.id());
            assert_eq!(job, unknown);
            assert_eq!(state, ApplicationState::Finished);
        }
        other => panic!("expected a missing result, got {other:?}"),
    }

    // the submitted job still has its result
    assert!(result.wait().unwrap().is_success());
    teardown(handle, TEARDOWN_TIMEOUT).unwrap();
}

#[test]
pub fn result_request_on_unreachable_manager() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let specification = descriptor.cluster_specification().unwrap();
    let job = testing_job(&fixture.jar);

    let handle = descriptor
        .deploy_job_cluster(&specification, &job, false)
        .unwrap();
    fixture.cluster.set_available(false);

    let result = handle.request_job_result(job.id);
    assert!(result.wait_timeout(Duration::from_secs(10)));
    assert!(result.is_resolved());
    assert!(matches!(
        result.try_result().unwrap(),
        Err(DeployError::TransportError {
            stage: Stage::Monitoring,
            ..
        })
    ));

    fixture.cluster.set_available(true);
    teardown(handle, TEARDOWN_TIMEOUT).unwrap();
}

#[test]
pub fn with_deployment_tears_down() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let specification = descriptor.cluster_specification().unwrap();
    let job = testing_job(&fixture.jar);
    let mut deployed = None;

    let (result, outcome) = with_deployment(&descriptor, &specification, &job, |handle, result| {
        deployed = Some(handle.id());
        result.wait()
    })
    .unwrap();
    let id = deployed.unwrap();

    assert!(result.is_success());
    assert_eq!(outcome, TeardownOutcome::Finished);
    assert_eq!(state(&fixture, &id), ApplicationState::Finished);
    assert!(!staged(&fixture, &id));
}

#[test]
pub fn with_deployment_tears_down_after_failed_body() {
    let fixture = Fixture::with_cluster(|config| config.exit_delay = Duration::from_secs(60));
    let mut descriptor_config = fixture.config.clone();
    descriptor_config.teardown.timeout = Duration::from_secs(5);
    let descriptor = ClusterDescriptor::new(
        descriptor_config,
        fixture.cluster.clone(),
        Arc::new(LocalFileSystem),
    )
    .unwrap();
    let specification = descriptor.cluster_specification().unwrap();
    let job = testing_job(&fixture.jar);
    let mut deployed = None;

    let error = with_deployment(&descriptor, &specification, &job, |handle, _| {
        deployed = Some(handle.id());

        Err::<(), _>(DeployError::TransportError {
            app: Some(handle.id()),
            stage: Stage::Monitoring,
            reason: "gave up".to_owned(),
        })
    })
    .unwrap_err();
    let id = deployed.unwrap();

    assert!(matches!(error, DeployError::TransportError { ref reason, .. } if reason == "gave up"));
    // stop request ends the lingering application master
    assert_eq!(state(&fixture, &id), ApplicationState::Finished);
    assert!(!staged(&fixture, &id));
}

#[test]
pub fn concurrent_deployments_are_independent() {
    let fixture = &Fixture::new();
    let descriptor = &fixture.descriptor();

    let ids = thread::scope(|scope| {
        let workers = (0..2)
            .map(|_| {
                scope.spawn(move || {
                    let (handle, result) =
                        deploy(descriptor, &testing_job(&fixture.jar)).unwrap();
                    let id = handle.id();

                    assert!(result.wait().unwrap().is_success());
                    assert_eq!(
                        teardown(handle, TEARDOWN_TIMEOUT).unwrap(),
                        TeardownOutcome::Finished
                    );

                    id
                })
            })
            .collect::<Vec<_>>();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_ne!(ids[0], ids[1]);
    for id in ids.iter() {
        assert_eq!(state(fixture, id), ApplicationState::Finished);
    }
}
