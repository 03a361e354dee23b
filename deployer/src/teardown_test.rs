use crate::{
    deploy::{deploy, DeployError, Stage},
    manager::ApplicationState,
    teardown::{TeardownController, TeardownOutcome, TeardownState},
    testing::{testing_job, Fixture},
};
use std::time::{Duration, Instant};

#[test]
pub fn cooperative_application_finishes() {
    // the application master would linger for a minute without the stop request
    let fixture = Fixture::with_cluster(|config| config.exit_delay = Duration::from_secs(60));
    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let id = handle.id();
    assert!(result.wait().unwrap().is_success());

    let mut controller = TeardownController::new(Duration::from_millis(20), Duration::from_secs(10));
    assert_eq!(controller.state(), TeardownState::Running);

    let start = Instant::now();
    let outcome = controller.teardown(handle).unwrap();

    assert_eq!(outcome, TeardownOutcome::Finished);
    assert!(!outcome.is_forced());
    assert_eq!(controller.state(), TeardownState::Finished);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(
        fixture.cluster.application(&id).unwrap().state,
        ApplicationState::Finished
    );
    assert!(!fixture.staging_base().join(id.to_string()).exists());
}

#[test]
pub fn unresponsive_application_is_killed_after_timeout() {
    let fixture = Fixture::with_cluster(|config| config.unresponsive = true);
    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let id = handle.id();
    assert!(result.wait().unwrap().is_success());

    let timeout = Duration::from_millis(300);
    let mut controller = TeardownController::new(Duration::from_millis(20), timeout);

    let start = Instant::now();
    let outcome = controller.teardown(handle).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, TeardownOutcome::Killed);
    assert!(outcome.is_forced());
    assert_eq!(controller.state(), TeardownState::Killed);
    assert!(elapsed >= timeout, "{elapsed:?}");
    assert!(elapsed < timeout + Duration::from_secs(2), "{elapsed:?}");

    let report = fixture.cluster.application(&id).unwrap();
    assert_eq!(report.state, ApplicationState::Killed);
    assert!(!fixture.staging_base().join(id.to_string()).exists());
}

#[test]
pub fn controller_can_be_reused() {
    let fixture = Fixture::new();
    let descriptor = fixture.descriptor();
    let mut controller = descriptor.teardown_controller();

    for _ in 0..2 {
        let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
        assert!(result.wait().unwrap().is_success());

        assert_eq!(controller.teardown(handle).unwrap(), TeardownOutcome::Finished);
        assert!(controller.state().is_terminal());
    }
}

#[test]
pub fn unreachable_manager_fails_teardown() {
    let fixture = Fixture::with_cluster(|config| config.unresponsive = true);
    let descriptor = fixture.descriptor();
    let (handle, result) = deploy(&descriptor, &testing_job(&fixture.jar)).unwrap();
    let id = handle.id();
    assert!(result.wait().unwrap().is_success());

    fixture.cluster.set_available(false);
    let timeout = Duration::from_millis(200);
    let start = Instant::now();

    let error = TeardownController::new(Duration::from_millis(20), timeout)
        .teardown(handle)
        .unwrap_err();

    assert!(start.elapsed() < timeout + Duration::from_secs(2));
    assert!(matches!(
        error,
        DeployError::TransportError {
            app: Some(app),
            stage: Stage::Teardown,
            ..
        } if app == id
    ));

    // still alive, the cluster session kills it on shutdown
    fixture.cluster.set_available(true);
    assert_eq!(
        fixture.cluster.application(&id).unwrap().state,
        ApplicationState::Running
    );
}

#[test]
pub fn states() {
    assert!(!TeardownState::Running.is_terminal());
    assert!(!TeardownState::Terminating.is_terminal());
    assert!(TeardownState::Finished.is_terminal());
    assert!(TeardownState::Killed.is_terminal());
    assert_eq!(TeardownState::Terminating.to_string(), "TERMINATING");

    let controller = TeardownController::default();
    assert_eq!(controller.state(), TeardownState::Running);
}
