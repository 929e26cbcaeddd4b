//! Named, retryable, multi-step workflows over the instance service.
//!
//! Each workflow is a sequence of independently retryable, idempotent steps
//! with durable delays between them. Delays and failure handling assume an
//! external at-least-once step scheduler: sleeps go through the
//! [`StepSleeper`] seam rather than blocking a thread, failed steps raise
//! their error at the step boundary so the scheduler's retry policy applies,
//! and steps tolerate re-execution after a crash. Explicitly best-effort
//! steps (stop-before-destroy, the initial health check after create) catch
//! and log instead of failing the workflow.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit, mpsc};
use uuid::Uuid;

use crate::error::{Error, Operation};
use crate::instance::{CreateInstanceRequest, InstanceStatus};
use crate::instances::InstanceService;

/// Delay between machine creation and the running-state verification.
pub const CREATE_VERIFY_DELAY: Duration = Duration::from_secs(5);

/// Delay between the best-effort stop and the destroy call.
pub const DESTROY_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Delay after stopping during a restart.
pub const RESTART_STOP_DELAY: Duration = Duration::from_secs(3);

/// Delay between restart and the health verification.
pub const RESTART_VERIFY_DELAY: Duration = Duration::from_secs(5);

/// Concurrent invocations permitted per workflow kind by default.
pub const DEFAULT_WORKFLOW_CONCURRENCY: usize = 4;

/// Durable-delay seam between workflow steps.
///
/// The in-process [`TokioSleeper`] maps this onto the timer wheel; an
/// external durable scheduler can substitute its own delay primitive so a
/// sleeping workflow survives a crash.
pub trait StepSleeper: Send + Sync {
    /// Resolves after the requested delay.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Timer-wheel sleeper for in-process execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl StepSleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Per-step retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Workflow kinds, used for throttling and log context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowKind {
    /// Provision and verify a new instance.
    CreateInstance,
    /// Stop (best effort) and destroy an instance.
    DestroyInstance,
    /// Probe health, signalling a restart when unhealthy.
    HealthCheckInstance,
    /// Stop/start cycle with health verification.
    RestartInstance,
}

impl WorkflowKind {
    /// Stable workflow name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CreateInstance => "create-instance",
            Self::DestroyInstance => "destroy-instance",
            Self::HealthCheckInstance => "health-check-instance",
            Self::RestartInstance => "restart-instance",
        }
    }
}

/// Fire-and-forget signal asking the restart workflow to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartRequest {
    /// Instance the health check found unhealthy.
    pub instance_id: Uuid,
}

/// Result of the create-instance workflow.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CreateInstanceOutcome {
    /// Caller-visible instance id.
    pub instance_id: Uuid,
    /// Status after verification (always running on success).
    pub status: InstanceStatus,
    /// Private address, when the backend assigned one.
    pub private_ip: Option<String>,
    /// Result of the best-effort initial health check.
    pub healthy: bool,
}

/// Result of the destroy-instance workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DestroyInstanceOutcome {
    /// Caller-visible instance id.
    pub instance_id: Uuid,
    /// Always true on success; failures raise instead.
    pub destroyed: bool,
}

/// Result of the health-check-instance workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct HealthCheckOutcome {
    /// Caller-visible instance id.
    pub instance_id: Uuid,
    /// Whether the instance reported running.
    pub healthy: bool,
}

/// Result of the restart-instance workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RestartInstanceOutcome {
    /// Caller-visible instance id.
    pub instance_id: Uuid,
    /// Status after the restart (always running on success).
    pub status: InstanceStatus,
    /// Always true on success; an unhealthy instance fails the workflow.
    pub healthy: bool,
}

struct WorkflowLimits {
    create: Semaphore,
    destroy: Semaphore,
    health: Semaphore,
    restart: Semaphore,
}

impl WorkflowLimits {
    fn new(permits: usize) -> Self {
        Self {
            create: Semaphore::new(permits),
            destroy: Semaphore::new(permits),
            health: Semaphore::new(permits),
            restart: Semaphore::new(permits),
        }
    }

    const fn semaphore(&self, kind: WorkflowKind) -> &Semaphore {
        match kind {
            WorkflowKind::CreateInstance => &self.create,
            WorkflowKind::DestroyInstance => &self.destroy,
            WorkflowKind::HealthCheckInstance => &self.health,
            WorkflowKind::RestartInstance => &self.restart,
        }
    }
}

/// Orchestrates the named instance workflows.
pub struct Workflows<S: StepSleeper = TokioSleeper> {
    instances: InstanceService,
    sleeper: S,
    retry: RetryPolicy,
    limits: WorkflowLimits,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
    restart_rx: Mutex<Option<mpsc::UnboundedReceiver<RestartRequest>>>,
}

impl Workflows<TokioSleeper> {
    /// Creates an orchestrator with the in-process timer sleeper.
    #[must_use]
    pub fn new(instances: InstanceService) -> Self {
        Self::with_sleeper(instances, TokioSleeper)
    }
}

impl<S: StepSleeper> Workflows<S> {
    /// Creates an orchestrator with a custom sleeper.
    #[must_use]
    pub fn with_sleeper(instances: InstanceService, sleeper: S) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Self {
            instances,
            sleeper,
            retry: RetryPolicy::default(),
            limits: WorkflowLimits::new(DEFAULT_WORKFLOW_CONCURRENCY),
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
        }
    }

    /// Overrides the per-step retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Overrides the per-kind concurrency limit.
    #[must_use]
    pub fn with_concurrency_limit(mut self, permits: usize) -> Self {
        self.limits = WorkflowLimits::new(permits);
        self
    }

    /// Takes the restart-signal receiver. Signals emitted while no receiver
    /// is attached queue in the channel; after this returns `None` a
    /// receiver was already taken.
    pub fn take_restart_signals(&self) -> Option<mpsc::UnboundedReceiver<RestartRequest>> {
        self.restart_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// create-instance: create machine, wait, verify running, initial
    /// health check.
    ///
    /// # Errors
    ///
    /// Returns the create or verification error; a non-running instance
    /// after the verify delay is a failure, never a silent success. The
    /// initial health check is best effort and only affects the outcome's
    /// `healthy` flag.
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<CreateInstanceOutcome, Error> {
        let kind = WorkflowKind::CreateInstance;
        let _permit = self.throttled(kind).await?;
        tracing::info!(workflow = kind.name(), name = %request.name, "workflow started");

        let instance = self
            .retry_step(kind, "create", || self.instances.create(request.clone()))
            .await?;
        let key = instance.id.to_string();

        self.sleeper.sleep(CREATE_VERIFY_DELAY).await;

        let refreshed = self
            .retry_step(kind, "verify", || self.instances.get(&key))
            .await?;
        if refreshed.status != InstanceStatus::Running {
            return Err(Error::operation(
                Operation::Create,
                format!(
                    "instance '{}' is {} after create (expected running)",
                    refreshed.name, refreshed.status
                ),
            ));
        }

        let healthy = match self.instances.health_check(&key).await {
            Ok(healthy) => healthy,
            Err(err) => {
                tracing::warn!(
                    workflow = kind.name(),
                    instance = %instance.id,
                    error = %err,
                    "initial health check failed"
                );
                false
            }
        };

        Ok(CreateInstanceOutcome {
            instance_id: instance.id,
            status: refreshed.status,
            private_ip: refreshed.private_ip_address,
            healthy,
        })
    }

    /// destroy-instance: best-effort stop, settle, destroy, cleanup hook.
    ///
    /// Safe to re-execute: an already-destroyed instance short-circuits to
    /// a successful outcome, and a machine the backend no longer knows
    /// counts as destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys or the destroy step's
    /// error after retries. Stop failures are logged and ignored.
    pub async fn destroy_instance(&self, key: &str) -> Result<DestroyInstanceOutcome, Error> {
        let kind = WorkflowKind::DestroyInstance;
        let _permit = self.throttled(kind).await?;
        let instance = self.instances.require(key)?;
        tracing::info!(workflow = kind.name(), instance = %instance.id, "workflow started");

        if instance.is_destroyed() {
            return Ok(DestroyInstanceOutcome {
                instance_id: instance.id,
                destroyed: true,
            });
        }

        if instance.status == InstanceStatus::Running {
            if let Err(err) = self.instances.stop(key).await {
                tracing::warn!(
                    workflow = kind.name(),
                    instance = %instance.id,
                    error = %err,
                    "best-effort stop failed; continuing with destroy"
                );
            }
        }

        self.sleeper.sleep(DESTROY_SETTLE_DELAY).await;

        self.retry_step(kind, "destroy", || async {
            match self.instances.destroy(key).await {
                Ok(_) => Ok(()),
                // Machine already gone: a re-executed step must not fail.
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await?;

        self.cleanup(instance.id);

        Ok(DestroyInstanceOutcome {
            instance_id: instance.id,
            destroyed: true,
        })
    }

    /// health-check-instance: probe health, emitting a fire-and-forget
    /// restart signal when unhealthy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys; a failed provider call
    /// propagates so the scheduler retries the step.
    pub async fn health_check_instance(&self, key: &str) -> Result<HealthCheckOutcome, Error> {
        let kind = WorkflowKind::HealthCheckInstance;
        let _permit = self.throttled(kind).await?;
        let instance = self.instances.require(key)?;

        let healthy = self.instances.health_check(key).await?;
        if !healthy {
            tracing::warn!(
                workflow = kind.name(),
                instance = %instance.id,
                "instance unhealthy; emitting restart signal"
            );
            self.restart_tx
                .send(RestartRequest {
                    instance_id: instance.id,
                })
                .ok();
        }

        Ok(HealthCheckOutcome {
            instance_id: instance.id,
            healthy,
        })
    }

    /// restart-instance: stop when running, start, verify health.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error after retries, or an
    /// [`Operation::Restart`] failure when the instance is still unhealthy
    /// after the restart — never a `healthy: false` success.
    pub async fn restart_instance(&self, key: &str) -> Result<RestartInstanceOutcome, Error> {
        let kind = WorkflowKind::RestartInstance;
        let _permit = self.throttled(kind).await?;
        tracing::info!(workflow = kind.name(), key, "workflow started");

        let current = self
            .retry_step(kind, "capture-status", || self.instances.get(key))
            .await?;

        if current.status == InstanceStatus::Running {
            self.retry_step(kind, "stop", || self.instances.stop(key))
                .await?;
            self.sleeper.sleep(RESTART_STOP_DELAY).await;
        }

        self.retry_step(kind, "start", || self.instances.start(key))
            .await?;
        self.sleeper.sleep(RESTART_VERIFY_DELAY).await;

        let healthy = self
            .retry_step(kind, "verify-health", || self.instances.health_check(key))
            .await?;
        if !healthy {
            return Err(Error::operation(
                Operation::Restart,
                format!("instance '{key}' is unhealthy after restart"),
            ));
        }

        let refreshed = self.instances.require(key)?;
        Ok(RestartInstanceOutcome {
            instance_id: refreshed.id,
            status: refreshed.status,
            healthy: true,
        })
    }

    /// Reserved teardown hook for future resource cleanup (volumes, DNS).
    fn cleanup(&self, instance_id: Uuid) {
        tracing::debug!(instance = %instance_id, "cleanup hook: nothing to tear down");
    }

    async fn throttled(&self, kind: WorkflowKind) -> Result<SemaphorePermit<'_>, Error> {
        self.limits
            .semaphore(kind)
            .acquire()
            .await
            .map_err(|_| Error::infrastructure("workflow limiter closed"))
    }

    /// Runs one step under the per-step retry policy.
    ///
    /// Validation and not-found failures are terminal immediately: retrying
    /// cannot change caller input or make an absent resource appear.
    async fn retry_step<T, F, Fut>(
        &self,
        kind: WorkflowKind,
        step: &str,
        operation: F,
    ) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_validation() || err.is_not_found() => return Err(err),
                Err(err) if attempt >= self.retry.max_attempts => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        workflow = kind.name(),
                        step,
                        attempt,
                        error = %err,
                        "step failed; retrying"
                    );
                    self.sleeper.sleep(self.retry.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
