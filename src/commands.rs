//! Command validation and execution against a running instance.
//!
//! A single exec call maps to exactly one outbound provider round trip;
//! the timeout aborts the in-flight request by dropping its future. This
//! layer never retries — retry policy belongs to the workflow orchestrator.
//! Streamed output is a lazy, finite, non-restartable sequence of
//! [`ExecEvent`]s whose serde representation matches the SSE `data:`
//! payloads emitted at the collaborating HTTP boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shell_escape::unix::escape;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Operation};
use crate::instance::InstanceStatus;
use crate::provider::{ExecRequest, Provider};
use crate::repository::{self, InstanceRepository};

/// Executables permitted inside a sandbox.
pub const COMMAND_ALLOWLIST: [&str; 26] = [
    "ls", "grep", "find", "cat", "echo", "pwd", "env", "ps", "df", "du", "git", "which", "whoami",
    "hostname", "date", "uptime", "free", "head", "tail", "wc", "sort", "uniq", "diff", "tree",
    "file", "stat",
];

/// Timeout applied when the caller does not supply one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Lower timeout bound; smaller requests are clamped up.
pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// Upper timeout bound; larger requests are clamped down.
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Maximum number of arguments per execution.
pub const MAX_ARGS: usize = 50;

/// Maximum length of a single argument.
pub const MAX_ARG_LEN: usize = 200;

/// Maximum length of the command string.
pub const MAX_COMMAND_LEN: usize = 1_000;

/// Terminal and in-flight states of one command execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Issued to the backend, result pending.
    Running,
    /// Finished with exit code zero.
    Completed,
    /// Finished with a non-zero exit code.
    Failed,
    /// Aborted by the execution timeout.
    Timeout,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Record of one command execution, owned by the call that produced it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandExecution {
    /// Execution identifier.
    pub id: Uuid,
    /// Instance the command ran against.
    pub instance_id: Uuid,
    /// Executable token.
    pub command: String,
    /// Arguments as supplied by the caller.
    pub args: Vec<String>,
    /// Captured standard output.
    pub output: String,
    /// Captured standard error.
    pub error: String,
    /// Exit code, absent until the command completes.
    pub exit_code: Option<i32>,
    /// Final status.
    pub status: CommandStatus,
    /// When the command was issued.
    pub started_at: DateTime<Utc>,
    /// When the result arrived.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Caller input for one execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecParams {
    /// Instance id or name the command targets.
    pub instance_id: String,
    /// Backend machine id override; resolved from the registry when absent.
    pub machine_id: Option<String>,
    /// Executable token.
    pub command: String,
    /// Arguments, shell-escaped before transmission.
    pub args: Vec<String>,
    /// Timeout in milliseconds; clamped to the supported range.
    pub timeout_ms: Option<u64>,
}

impl ExecParams {
    /// Creates parameters for `command` against `instance_id`.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            machine_id: None,
            command: command.into(),
            args: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = values.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the backend machine id instead of resolving it from the
    /// registry record.
    #[must_use]
    pub fn machine_id(mut self, value: impl Into<String>) -> Self {
        self.machine_id = Some(value.into());
        self
    }

    /// Sets the timeout in milliseconds.
    #[must_use]
    pub const fn timeout_ms(mut self, value: u64) -> Self {
        self.timeout_ms = Some(value);
        self
    }
}

/// One streamed output event.
///
/// Serialises to the SSE `data:` payload shape:
/// `{"type": "status"|"stdout"|"stderr"|"complete"|"error", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecEvent {
    /// Execution status announcement.
    Status {
        /// Current status.
        status: CommandStatus,
    },
    /// Chunk of standard output.
    Stdout {
        /// Output text.
        data: String,
    },
    /// Chunk of standard error.
    Stderr {
        /// Output text.
        data: String,
    },
    /// Execution finished.
    Complete {
        /// Exit code reported by the sandbox.
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    /// Execution failed before completing.
    Error {
        /// Failure description.
        message: String,
    },
}

impl ExecEvent {
    /// Renders an error as its wire event, for the streaming boundary.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self::Error {
            message: error.to_string(),
        }
    }
}

/// Lazy, finite, non-restartable sequence of [`ExecEvent`]s.
///
/// Ordering matches the order output was received from the backend.
#[derive(Debug)]
pub struct ExecStream {
    rx: mpsc::Receiver<ExecEvent>,
}

impl ExecStream {
    fn from_events(events: Vec<ExecEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity equals the event count, so sends cannot fail.
            tx.try_send(event).ok();
        }
        Self { rx }
    }

    /// Yields the next event, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<ExecEvent> {
        self.rx.recv().await
    }

    /// Drains the remaining events.
    pub async fn collect(mut self) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Validates and executes single commands against running instances.
#[derive(Clone)]
pub struct CommandService {
    provider: Arc<dyn Provider>,
    repository: Arc<dyn InstanceRepository>,
}

impl CommandService {
    /// Creates a service over the given provider and repository.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, repository: Arc<dyn InstanceRepository>) -> Self {
        Self {
            provider,
            repository,
        }
    }

    /// Executes a command and returns the aggregated result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for rejected input, an
    /// [`Operation::Execute`] failure when the instance is not running or
    /// the timeout elapses, and any provider error unchanged.
    pub async fn execute(&self, params: ExecParams) -> Result<CommandExecution, Error> {
        self.run(params).await.map(|(execution, _)| execution)
    }

    /// Executes a command, returning the aggregated result together with
    /// the streamed event sequence.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`CommandService::execute`].
    pub async fn execute_streaming(
        &self,
        params: ExecParams,
    ) -> Result<(CommandExecution, ExecStream), Error> {
        let (execution, events) = self.run(params).await?;
        Ok((execution, ExecStream::from_events(events)))
    }

    async fn run(&self, params: ExecParams) -> Result<(CommandExecution, Vec<ExecEvent>), Error> {
        validate_params(&params)?;

        let instance = repository::resolve(self.repository.as_ref(), &params.instance_id)?
            .ok_or_else(|| Error::not_found("instance", &params.instance_id))?;
        if instance.status != InstanceStatus::Running {
            return Err(Error::operation(
                Operation::Execute,
                format!(
                    "instance '{}' is not running (status: {})",
                    params.instance_id, instance.status
                ),
            ));
        }

        let machine_id = params
            .machine_id
            .clone()
            .unwrap_or_else(|| instance.provider_machine_id.clone());
        let timeout = clamp_timeout(params.timeout_ms);
        let request = ExecRequest {
            command: render_command(&params.command, &params.args),
            timeout,
        };

        let started_at = Utc::now();
        let output = match tokio::time::timeout(
            timeout,
            self.provider.execute_command(&machine_id, &request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::operation(
                    Operation::Execute,
                    format!("Command timed out after {}ms", timeout.as_millis()),
                ));
            }
        };

        let Some(exit_code) = output.exit_code else {
            return Err(Error::operation(
                Operation::Execute,
                "backend returned no exit code",
            ));
        };

        let status = if exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };

        let mut events = vec![ExecEvent::Status {
            status: CommandStatus::Running,
        }];
        if !output.stdout.is_empty() {
            events.push(ExecEvent::Stdout {
                data: output.stdout.clone(),
            });
        }
        if !output.stderr.is_empty() {
            events.push(ExecEvent::Stderr {
                data: output.stderr.clone(),
            });
        }
        events.push(ExecEvent::Complete { exit_code });

        let execution = CommandExecution {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            command: params.command,
            args: params.args,
            output: output.stdout,
            error: output.stderr,
            exit_code: Some(exit_code),
            status,
            started_at,
            completed_at: Some(Utc::now()),
        };
        Ok((execution, events))
    }
}

/// Rejects invalid exec input before any network call.
fn validate_params(params: &ExecParams) -> Result<(), Error> {
    if params.instance_id.trim().is_empty() {
        return Err(Error::validation_field(
            "instance_id",
            "instance_id must not be empty",
        ));
    }
    if params.command.trim().is_empty() {
        return Err(Error::validation_field(
            "command",
            "command must not be empty",
        ));
    }
    if params.command.len() > MAX_COMMAND_LEN {
        return Err(Error::validation_field(
            "command",
            format!("command must be at most {MAX_COMMAND_LEN} characters"),
        ));
    }

    let token = params.command.split_whitespace().next().unwrap_or_default();
    if !COMMAND_ALLOWLIST.contains(&token) {
        return Err(Error::validation(format!(
            "'{token}' is not allowed; permitted commands: {}",
            COMMAND_ALLOWLIST.join(", ")
        )));
    }

    if params.args.len() > MAX_ARGS {
        return Err(Error::validation_field(
            "args",
            format!("at most {MAX_ARGS} arguments are accepted"),
        ));
    }
    if let Some(long) = params.args.iter().find(|arg| arg.len() > MAX_ARG_LEN) {
        return Err(Error::validation_field(
            "args",
            format!(
                "argument '{}...' exceeds {MAX_ARG_LEN} characters",
                long.chars().take(16).collect::<String>()
            ),
        ));
    }
    Ok(())
}

/// Applies the default and clamps the timeout to the supported range.
fn clamp_timeout(timeout_ms: Option<u64>) -> Duration {
    let millis = timeout_ms
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
    Duration::from_millis(millis)
}

/// Joins the command and shell-escaped arguments into one shell string.
fn render_command(command: &str, args: &[String]) -> String {
    let mut rendered = command.trim().to_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(escape(arg.as_str().into()).as_ref());
    }
    rendered
}

#[cfg(test)]
mod tests;
