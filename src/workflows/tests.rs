//! Unit tests for the workflow orchestrator.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use super::*;
use crate::instance::{CreateInstanceRequest, MachineSize, Region};
use crate::provider::MachineState;
use crate::repository::InMemoryInstanceRepository;
use crate::test_support::{MockProvider, ProviderInvocation};

/// Sleeper double that records requested delays and resolves immediately.
#[derive(Clone, Debug, Default)]
struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl StepSleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().unwrap().push(duration);
        Box::pin(std::future::ready(()))
    }
}

struct Fixture {
    provider: Arc<MockProvider>,
    sleeper: RecordingSleeper,
    instances: InstanceService,
    workflows: Workflows<RecordingSleeper>,
}

fn fixture() -> Fixture {
    let provider = Arc::new(MockProvider::new());
    let repository = Arc::new(InMemoryInstanceRepository::new());
    let instances = InstanceService::new(provider.clone(), repository);
    let sleeper = RecordingSleeper::default();
    let workflows = Workflows::with_sleeper(instances.clone(), sleeper.clone())
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        });
    Fixture {
        provider,
        sleeper,
        instances,
        workflows,
    }
}

fn request(name: &str) -> CreateInstanceRequest {
    CreateInstanceRequest::builder()
        .name(name)
        .region(Region::Iad)
        .size(MachineSize::SharedCpu1x)
        .memory_mb(512)
        .build()
        .expect("request should build")
}

async fn created(fixture: &Fixture, name: &str) -> String {
    let instance = fixture
        .instances
        .create(request(name))
        .await
        .expect("create should succeed");
    instance.id.to_string()
}

#[tokio::test]
async fn create_workflow_returns_running_and_healthy() {
    let fixture = fixture();
    let outcome = fixture
        .workflows
        .create_instance(request("dev1"))
        .await
        .expect("workflow should succeed");

    assert_eq!(outcome.status, InstanceStatus::Running);
    assert!(outcome.healthy);
    assert!(outcome.private_ip.is_some());
    assert_eq!(fixture.sleeper.recorded(), vec![CREATE_VERIFY_DELAY]);
}

#[tokio::test]
async fn create_workflow_fails_when_instance_is_not_running() {
    let fixture = fixture();
    fixture.provider.set_create_state(MachineState::Created);

    let err = fixture
        .workflows
        .create_instance(request("dev1"))
        .await
        .expect_err("non-running instance must fail the workflow");

    assert!(
        matches!(&err, Error::InstanceOperation { operation: Operation::Create, message, .. }
            if message.contains("expected running")),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn create_workflow_tolerates_initial_health_check_failure() {
    let fixture = fixture();
    // First get serves the verify step; the second (health check) fails.
    fixture.provider.push_success(Operation::Get);
    fixture
        .provider
        .push_failure(Operation::Get, Error::infrastructure_status(502, "flaky"));

    let outcome = fixture
        .workflows
        .create_instance(request("dev1"))
        .await
        .expect("health check failure must not fail the workflow");

    assert_eq!(outcome.status, InstanceStatus::Running);
    assert!(!outcome.healthy);
}

#[tokio::test]
async fn destroy_workflow_ignores_best_effort_stop_failure() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;
    fixture
        .provider
        .push_failure(Operation::Stop, Error::infrastructure_status(500, "stop broke"));

    let outcome = fixture
        .workflows
        .destroy_instance(&key)
        .await
        .expect("stop failure must not fail the workflow");

    assert!(outcome.destroyed);
    assert!(
        fixture
            .provider
            .invocations()
            .iter()
            .any(|call| matches!(call, ProviderInvocation::DestroyMachine { .. })),
        "destroy must still reach the provider"
    );
    assert_eq!(fixture.sleeper.recorded(), vec![DESTROY_SETTLE_DELAY]);
}

#[tokio::test]
async fn destroy_workflow_retries_the_destroy_step() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;
    fixture
        .provider
        .push_failure(Operation::Destroy, Error::infrastructure_status(500, "transient"));

    let outcome = fixture
        .workflows
        .destroy_instance(&key)
        .await
        .expect("second attempt should succeed");

    assert!(outcome.destroyed);
    assert_eq!(
        fixture.sleeper.recorded(),
        vec![DESTROY_SETTLE_DELAY, Duration::from_secs(1)],
        "one settle delay plus one retry backoff"
    );
}

#[tokio::test]
async fn destroy_workflow_is_safe_to_re_execute() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;

    let first = fixture
        .workflows
        .destroy_instance(&key)
        .await
        .expect("first run should succeed");
    let second = fixture
        .workflows
        .destroy_instance(&key)
        .await
        .expect("re-execution should short-circuit");

    assert!(first.destroyed);
    assert!(second.destroyed);
}

#[tokio::test]
async fn health_workflow_emits_restart_signal_when_unhealthy() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;
    let instance = fixture.instances.require(&key).expect("instance exists");
    fixture
        .provider
        .set_machine_state(&instance.provider_machine_id, MachineState::Stopped);

    let mut signals = fixture
        .workflows
        .take_restart_signals()
        .expect("receiver should be available once");
    let outcome = fixture
        .workflows
        .health_check_instance(&key)
        .await
        .expect("workflow should succeed");

    assert!(!outcome.healthy);
    assert_eq!(
        signals.try_recv().expect("a restart signal should be queued"),
        RestartRequest {
            instance_id: instance.id
        }
    );
}

#[tokio::test]
async fn health_workflow_stays_quiet_when_healthy() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;

    let mut signals = fixture
        .workflows
        .take_restart_signals()
        .expect("receiver should be available once");
    let outcome = fixture
        .workflows
        .health_check_instance(&key)
        .await
        .expect("workflow should succeed");

    assert!(outcome.healthy);
    assert!(signals.try_recv().is_err(), "no signal expected");
}

#[tokio::test]
async fn restart_workflow_cycles_a_running_instance() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;

    let outcome = fixture
        .workflows
        .restart_instance(&key)
        .await
        .expect("restart should succeed");

    assert_eq!(outcome.status, InstanceStatus::Running);
    assert!(outcome.healthy);
    assert_eq!(
        fixture.sleeper.recorded(),
        vec![RESTART_STOP_DELAY, RESTART_VERIFY_DELAY]
    );

    let calls = fixture.provider.invocations();
    let stop_position = calls
        .iter()
        .position(|call| matches!(call, ProviderInvocation::StopMachine { .. }))
        .expect("stop should run");
    let start_position = calls
        .iter()
        .position(|call| matches!(call, ProviderInvocation::StartMachine { .. }))
        .expect("start should run");
    assert!(stop_position < start_position, "stop must precede start");
}

#[tokio::test]
async fn restart_workflow_skips_stop_for_stopped_instances() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;
    fixture
        .instances
        .stop(&key)
        .await
        .expect("stop should succeed");

    let outcome = fixture
        .workflows
        .restart_instance(&key)
        .await
        .expect("restart should succeed");

    assert!(outcome.healthy);
    assert_eq!(fixture.sleeper.recorded(), vec![RESTART_VERIFY_DELAY]);
}

#[tokio::test]
async fn restart_workflow_fails_fatally_when_still_unhealthy() {
    let fixture = fixture();
    let key = created(&fixture, "dev1").await;
    fixture.provider.set_start_state(MachineState::Stopped);

    let err = fixture
        .workflows
        .restart_instance(&key)
        .await
        .expect_err("unhealthy instance must fail the workflow");

    assert!(
        matches!(&err, Error::InstanceOperation { operation: Operation::Restart, message, .. }
            if message.contains("unhealthy after restart")),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn workflows_run_under_a_tightened_concurrency_limit() {
    let provider = Arc::new(MockProvider::new());
    let repository = Arc::new(InMemoryInstanceRepository::new());
    let instances = InstanceService::new(provider, repository);
    let workflows = Workflows::with_sleeper(instances, RecordingSleeper::default())
        .with_concurrency_limit(1);

    let first = workflows
        .create_instance(request("dev1"))
        .await
        .expect("first workflow should succeed");
    let second = workflows
        .create_instance(request("dev2"))
        .await
        .expect("second workflow should succeed once the permit frees");

    assert!(first.healthy);
    assert!(second.healthy);
}

#[tokio::test]
async fn validation_failures_are_terminal_without_retries() {
    let fixture = fixture();
    let invalid = CreateInstanceRequest {
        name: "bad name".to_owned(),
        region: Region::Iad,
        size: MachineSize::SharedCpu1x,
        memory_mb: 512,
        image: None,
        repo_url: None,
        secrets: None,
        metadata: std::collections::BTreeMap::new(),
    };

    let err = fixture
        .workflows
        .create_instance(invalid)
        .await
        .expect_err("invalid request must fail");

    assert!(err.is_validation());
    assert_eq!(fixture.provider.invocation_count(), 0);
    assert!(
        fixture.sleeper.recorded().is_empty(),
        "no retry backoff expected for validation failures"
    );
}
