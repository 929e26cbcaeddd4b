//! Single callable surface composing the provider, services, and workflows.
//!
//! CLIs and HTTP layers hold one [`Skiff`] value; everything reachable from
//! it returns `Result` values from the shared error taxonomy, so callers
//! branch on success/failure explicitly.

use std::sync::Arc;

use crate::commands::{CommandExecution, CommandService, ExecParams, ExecStream};
use crate::config::{ProviderConfig, SkiffConfig};
use crate::error::Error;
use crate::instance::{CreateInstanceRequest, Instance};
use crate::instances::InstanceService;
use crate::provider::{Provider, build_provider};
use crate::repository::{InMemoryInstanceRepository, InstanceRepository};
use crate::workflows::{
    CreateInstanceOutcome, DestroyInstanceOutcome, HealthCheckOutcome, RestartInstanceOutcome,
    Workflows,
};

/// SDK entry point over one configured provider.
pub struct Skiff {
    provider: Arc<dyn Provider>,
    instances: InstanceService,
    commands: CommandService,
    workflows: Workflows,
}

impl Skiff {
    /// Builds the SDK from environment-sourced configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when configuration is missing or
    /// invalid, or [`Error::Infrastructure`] when the HTTP client cannot be
    /// built.
    pub fn from_env() -> Result<Self, Error> {
        let defaults = SkiffConfig::load_without_cli_args()?;
        let config = ProviderConfig::for_provider_name(&defaults.provider)?;
        Ok(Self::assemble(
            build_provider(&config)?,
            Arc::new(InMemoryInstanceRepository::new()),
            Some(defaults.default_image),
        ))
    }

    /// Builds the SDK for an explicit provider configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] or [`Error::Infrastructure`] from
    /// provider construction.
    pub fn new(config: &ProviderConfig) -> Result<Self, Error> {
        Ok(Self::with_provider(build_provider(config)?))
    }

    /// Builds the SDK over an existing provider and a fresh in-memory
    /// registry. The seam used for embedding and tests.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn Provider>) -> Self {
        Self::with_repository(provider, Arc::new(InMemoryInstanceRepository::new()))
    }

    /// Builds the SDK over an existing provider and repository.
    #[must_use]
    pub fn with_repository(
        provider: Arc<dyn Provider>,
        repository: Arc<dyn InstanceRepository>,
    ) -> Self {
        Self::assemble(provider, repository, None)
    }

    fn assemble(
        provider: Arc<dyn Provider>,
        repository: Arc<dyn InstanceRepository>,
        default_image: Option<String>,
    ) -> Self {
        let mut instances = InstanceService::new(Arc::clone(&provider), Arc::clone(&repository));
        if let Some(image) = default_image {
            instances = instances.with_default_image(image);
        }
        let commands = CommandService::new(Arc::clone(&provider), repository);
        let workflows = Workflows::new(instances.clone());
        Self {
            provider,
            instances,
            commands,
            workflows,
        }
    }

    /// Instance service for direct lifecycle calls.
    #[must_use]
    pub const fn instances(&self) -> &InstanceService {
        &self.instances
    }

    /// Command service for direct exec calls.
    #[must_use]
    pub const fn commands(&self) -> &CommandService {
        &self.commands
    }

    /// Workflow orchestrator.
    #[must_use]
    pub const fn workflows(&self) -> &Workflows {
        &self.workflows
    }

    /// Configured provider handle.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.provider)
    }

    /// Runs the create-instance workflow.
    ///
    /// # Errors
    ///
    /// See [`Workflows::create_instance`].
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<CreateInstanceOutcome, Error> {
        self.workflows.create_instance(request).await
    }

    /// Runs the destroy-instance workflow.
    ///
    /// # Errors
    ///
    /// See [`Workflows::destroy_instance`].
    pub async fn destroy_instance(&self, key: &str) -> Result<DestroyInstanceOutcome, Error> {
        self.workflows.destroy_instance(key).await
    }

    /// Runs the restart-instance workflow.
    ///
    /// # Errors
    ///
    /// See [`Workflows::restart_instance`].
    pub async fn restart_instance(&self, key: &str) -> Result<RestartInstanceOutcome, Error> {
        self.workflows.restart_instance(key).await
    }

    /// Runs the health-check-instance workflow.
    ///
    /// # Errors
    ///
    /// See [`Workflows::health_check_instance`].
    pub async fn health_check_instance(&self, key: &str) -> Result<HealthCheckOutcome, Error> {
        self.workflows.health_check_instance(key).await
    }

    /// Fetches one instance, refreshed from the provider.
    ///
    /// # Errors
    ///
    /// See [`InstanceService::get`].
    pub async fn get_instance(&self, key: &str) -> Result<Instance, Error> {
        self.instances.get(key).await
    }

    /// Lists instances, refreshed from the provider.
    ///
    /// # Errors
    ///
    /// See [`InstanceService::list`].
    pub async fn list_instances(&self) -> Result<Vec<Instance>, Error> {
        self.instances.list().await
    }

    /// Executes a command and returns the aggregated result.
    ///
    /// # Errors
    ///
    /// See [`CommandService::execute`].
    pub async fn execute(&self, params: ExecParams) -> Result<CommandExecution, Error> {
        self.commands.execute(params).await
    }

    /// Executes a command, returning the aggregate and the event stream.
    ///
    /// # Errors
    ///
    /// See [`CommandService::execute_streaming`].
    pub async fn execute_streaming(
        &self,
        params: ExecParams,
    ) -> Result<(CommandExecution, ExecStream), Error> {
        self.commands.execute_streaming(params).await
    }
}
