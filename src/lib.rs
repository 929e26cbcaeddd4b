//! Core library for the skiff sandbox orchestration SDK.
//!
//! The crate provisions short-lived remote compute sandboxes on pluggable
//! cloud backends (Fly.io Machines, Vercel Sandbox) and executes allowlisted
//! shell commands inside them. It exposes a provider abstraction, the
//! instance lifecycle state machine, a validated command-execution layer
//! with streamed output, and retryable multi-step workflows designed to run
//! under an external at-least-once step scheduler.

pub mod commands;
pub mod config;
pub mod error;
pub mod instance;
pub mod instances;
pub mod provider;
pub mod repository;
pub mod sdk;
pub mod test_support;
pub mod workflows;

pub use commands::{
    COMMAND_ALLOWLIST, CommandExecution, CommandService, CommandStatus, ExecEvent, ExecParams,
    ExecStream,
};
pub use config::{ConfigError, FlyConfig, ProviderConfig, SkiffConfig, VercelConfig};
pub use error::{Error, Operation};
pub use instance::{
    CreateInstanceRequest, CreateInstanceRequestBuilder, GithubSecrets, Instance, InstanceStatus,
    MachineSize, Region,
};
pub use instances::InstanceService;
pub use provider::{
    ExecOutput, ExecRequest, GithubBootstrap, Machine, MachineSpec, MachineState, Provider,
    ProviderFuture, build_provider, fly::FlyProvider, vercel::VercelProvider,
};
pub use repository::{InMemoryInstanceRepository, InstanceRepository};
pub use sdk::Skiff;
pub use workflows::{
    CreateInstanceOutcome, DestroyInstanceOutcome, HealthCheckOutcome, RestartInstanceOutcome,
    RestartRequest, RetryPolicy, StepSleeper, TokioSleeper, WorkflowKind, Workflows,
};
