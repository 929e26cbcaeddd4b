//! Unit tests for the command service.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::instance::{CreateInstanceRequest, MachineSize, Region};
use crate::instances::InstanceService;
use crate::provider::ExecOutput;
use crate::repository::InMemoryInstanceRepository;
use crate::test_support::{MockProvider, ProviderInvocation};

struct Fixture {
    provider: Arc<MockProvider>,
    commands: CommandService,
    instances: InstanceService,
}

async fn fixture_with_instance() -> Fixture {
    let provider = Arc::new(MockProvider::new());
    let repository = Arc::new(InMemoryInstanceRepository::new());
    let instances = InstanceService::new(provider.clone(), repository.clone());
    let commands = CommandService::new(provider.clone(), repository);
    instances
        .create(
            CreateInstanceRequest::builder()
                .name("dev1")
                .region(Region::Iad)
                .size(MachineSize::SharedCpu1x)
                .memory_mb(512)
                .build()
                .expect("request should build"),
        )
        .await
        .expect("create should succeed");
    Fixture {
        provider,
        commands,
        instances,
    }
}

fn exec_calls(provider: &MockProvider) -> usize {
    provider
        .invocations()
        .iter()
        .filter(|call| matches!(call, ProviderInvocation::ExecuteCommand { .. }))
        .count()
}

#[tokio::test]
async fn echo_round_trips_output_and_exit_code() {
    let fixture = fixture_with_instance().await;
    let execution = fixture
        .commands
        .execute(ExecParams::new("dev1", "echo").arg("hello"))
        .await
        .expect("echo should succeed");

    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.status, CommandStatus::Completed);
    assert!(execution.output.contains("hello"), "output: {}", execution.output);
}

#[tokio::test]
async fn disallowed_command_is_rejected_before_any_network_call() {
    let fixture = fixture_with_instance().await;
    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "rm").args(["-rf", "/"]))
        .await
        .expect_err("rm must be rejected");

    assert!(err.is_validation());
    let message = err.to_string();
    assert!(message.starts_with("'rm' is not allowed"), "message: {message}");
    assert!(message.contains("ls"), "allowed set missing: {message}");
    assert_eq!(exec_calls(&fixture.provider), 0);
}

#[rstest]
#[case("", "echo")]
#[case("dev1", "")]
#[case("dev1", "   ")]
#[tokio::test]
async fn empty_identifiers_are_rejected(#[case] instance: &str, #[case] command: &str) {
    let fixture = fixture_with_instance().await;
    let err = fixture
        .commands
        .execute(ExecParams::new(instance, command))
        .await
        .expect_err("empty input must be rejected");
    assert!(err.is_validation());
    assert_eq!(exec_calls(&fixture.provider), 0);
}

#[tokio::test]
async fn argument_bounds_are_enforced() {
    let fixture = fixture_with_instance().await;

    let too_many: Vec<String> = (0..=MAX_ARGS).map(|n| n.to_string()).collect();
    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "echo").args(too_many))
        .await
        .expect_err("51 arguments must be rejected");
    assert!(err.is_validation());

    let long_arg = "a".repeat(MAX_ARG_LEN + 1);
    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "echo").arg(long_arg))
        .await
        .expect_err("201-char argument must be rejected");
    assert!(err.is_validation());

    let long_command = format!("echo {}", "a".repeat(MAX_COMMAND_LEN));
    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", long_command))
        .await
        .expect_err("overlong command must be rejected");
    assert!(err.is_validation());
    assert_eq!(exec_calls(&fixture.provider), 0);
}

#[tokio::test]
async fn execution_against_stopped_instance_fails_before_provider_call() {
    let fixture = fixture_with_instance().await;
    fixture
        .instances
        .stop("dev1")
        .await
        .expect("stop should succeed");

    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "ls").arg("-la"))
        .await
        .expect_err("stopped instance must reject exec");

    assert!(
        matches!(&err, Error::InstanceOperation { operation: Operation::Execute, message, .. }
            if message.contains("is not running")),
        "unexpected error: {err}"
    );
    assert_eq!(exec_calls(&fixture.provider), 0);
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let fixture = fixture_with_instance().await;
    let err = fixture
        .commands
        .execute(ExecParams::new("ghost", "ls"))
        .await
        .expect_err("unknown instance must fail");
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn timeout_aborts_the_inflight_request() {
    let fixture = fixture_with_instance().await;
    fixture.provider.set_exec_delay(Duration::from_secs(10));

    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "ls").timeout_ms(1_000))
        .await
        .expect_err("slow backend must time out");

    assert!(
        matches!(&err, Error::InstanceOperation { operation: Operation::Execute, message, .. }
            if message == "Command timed out after 1000ms"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn default_and_clamped_timeouts_reach_the_provider() {
    let fixture = fixture_with_instance().await;
    fixture
        .commands
        .execute(ExecParams::new("dev1", "pwd"))
        .await
        .expect("exec should succeed");
    fixture
        .commands
        .execute(ExecParams::new("dev1", "pwd").timeout_ms(10))
        .await
        .expect("exec should succeed");

    let timeouts: Vec<Duration> = fixture
        .provider
        .invocations()
        .iter()
        .filter_map(|call| match call {
            ProviderInvocation::ExecuteCommand { timeout, .. } => Some(*timeout),
            _ => None,
        })
        .collect();
    assert_eq!(
        timeouts,
        vec![
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            Duration::from_millis(MIN_TIMEOUT_MS),
        ]
    );
}

#[tokio::test]
async fn arguments_are_shell_escaped_in_the_rendered_command() {
    let fixture = fixture_with_instance().await;
    fixture
        .commands
        .execute(ExecParams::new("dev1", "grep").args(["two words", "notes.txt"]))
        .await
        .expect("exec should succeed");

    let rendered = fixture
        .provider
        .invocations()
        .iter()
        .find_map(|call| match call {
            ProviderInvocation::ExecuteCommand { command, .. } => Some(command.clone()),
            _ => None,
        })
        .expect("exec invocation should be recorded");
    assert_eq!(rendered, "grep 'two words' notes.txt");
}

#[tokio::test]
async fn machine_id_override_bypasses_registry_resolution() {
    let fixture = fixture_with_instance().await;
    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "ls").machine_id("mock-999"))
        .await
        .expect_err("unknown machine id must surface the provider error");
    assert!(err.is_not_found());

    let targets: Vec<String> = fixture
        .provider
        .invocations()
        .iter()
        .filter_map(|call| match call {
            ProviderInvocation::ExecuteCommand { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["mock-999".to_owned()]);
}

#[tokio::test]
async fn missing_exit_code_is_an_execute_failure() {
    let fixture = fixture_with_instance().await;
    fixture.provider.push_exec_result(Ok(ExecOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
    }));

    let err = fixture
        .commands
        .execute(ExecParams::new("dev1", "ls"))
        .await
        .expect_err("missing exit code must fail");
    assert!(matches!(
        err,
        Error::InstanceOperation {
            operation: Operation::Execute,
            ..
        }
    ));
}

#[tokio::test]
async fn streaming_preserves_event_order_and_wire_shape() {
    let fixture = fixture_with_instance().await;
    fixture.provider.push_exec_result(Ok(ExecOutput {
        stdout: "out\n".to_owned(),
        stderr: "warn\n".to_owned(),
        exit_code: Some(2),
    }));

    let (execution, stream) = fixture
        .commands
        .execute_streaming(ExecParams::new("dev1", "ls"))
        .await
        .expect("exec should succeed");
    assert_eq!(execution.status, CommandStatus::Failed);

    let events = stream.collect().await;
    assert_eq!(
        events,
        vec![
            ExecEvent::Status {
                status: CommandStatus::Running
            },
            ExecEvent::Stdout {
                data: "out\n".to_owned()
            },
            ExecEvent::Stderr {
                data: "warn\n".to_owned()
            },
            ExecEvent::Complete { exit_code: 2 },
        ]
    );

    let wire = serde_json::to_value(&events[1]).expect("event should serialise");
    assert_eq!(wire, serde_json::json!({"type": "stdout", "data": "out\n"}));
    let complete = serde_json::to_value(&events[3]).expect("event should serialise");
    assert_eq!(complete, serde_json::json!({"type": "complete", "exitCode": 2}));
}

#[tokio::test]
async fn empty_streams_omit_output_events() {
    let fixture = fixture_with_instance().await;
    fixture.provider.push_exec_result(Ok(ExecOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: Some(0),
    }));

    let (_, stream) = fixture
        .commands
        .execute_streaming(ExecParams::new("dev1", "pwd"))
        .await
        .expect("exec should succeed");
    let events = stream.collect().await;
    assert_eq!(
        events,
        vec![
            ExecEvent::Status {
                status: CommandStatus::Running
            },
            ExecEvent::Complete { exit_code: 0 },
        ]
    );
}

#[test]
fn error_events_render_the_wire_message() {
    let event = ExecEvent::from_error(&Error::operation(
        Operation::Execute,
        "Command timed out after 1000ms",
    ));
    let wire = serde_json::to_value(&event).expect("event should serialise");
    assert_eq!(wire["type"], "error");
    assert_eq!(wire["message"], "execute failed: Command timed out after 1000ms");
}
