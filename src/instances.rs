//! Domain-level instance management.
//!
//! The service validates caller input before any network call, drives the
//! provider, and keeps the repository in step with provider-confirmed
//! machine states. Keys passed to lookup operations may be the opaque
//! instance id or the instance name.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Operation};
use crate::instance::{CreateInstanceRequest, Instance, InstanceStatus};
use crate::provider::{GithubBootstrap, Machine, MachineSpec, MachineState, Provider};
use crate::repository::{self, InstanceRepository};

/// Boot image applied when a create request does not name one.
pub const DEFAULT_IMAGE: &str = "docker.io/library/ubuntu:22.04";

/// Maps a provider-confirmed machine state onto the instance state machine.
#[must_use]
pub const fn status_from_machine(state: MachineState) -> InstanceStatus {
    match state {
        MachineState::Created => InstanceStatus::Provisioning,
        MachineState::Starting => InstanceStatus::Starting,
        MachineState::Started => InstanceStatus::Running,
        MachineState::Stopping => InstanceStatus::Stopping,
        MachineState::Stopped => InstanceStatus::Stopped,
        MachineState::Destroying => InstanceStatus::Destroying,
        MachineState::Destroyed => InstanceStatus::Destroyed,
        MachineState::Failed => InstanceStatus::Failed,
        MachineState::Unknown => InstanceStatus::Unknown,
    }
}

/// Instance lifecycle operations over a provider and a repository.
#[derive(Clone)]
pub struct InstanceService {
    provider: Arc<dyn Provider>,
    repository: Arc<dyn InstanceRepository>,
    default_image: String,
}

impl InstanceService {
    /// Creates a service over the given provider and repository.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, repository: Arc<dyn InstanceRepository>) -> Self {
        Self {
            provider,
            repository,
            default_image: DEFAULT_IMAGE.to_owned(),
        }
    }

    /// Overrides the default boot image.
    #[must_use]
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Shared repository handle, for collaborators that need lookups.
    #[must_use]
    pub fn repository(&self) -> Arc<dyn InstanceRepository> {
        Arc::clone(&self.repository)
    }

    /// Creates a new instance.
    ///
    /// Validation happens before any network call. When GitHub secrets are
    /// present the bootstrap creation path is used instead of the plain
    /// path; the two are mutually exclusive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid input or a duplicate live
    /// name, or the provider's error unchanged.
    pub async fn create(&self, request: CreateInstanceRequest) -> Result<Instance, Error> {
        request.validate()?;
        if let Some(existing) = self.repository.find_by_name(&request.name)? {
            if !existing.is_destroyed() {
                return Err(Error::validation_field(
                    "name",
                    format!("instance name '{}' is already in use", request.name),
                ));
            }
        }

        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.default_image.clone());
        let spec = MachineSpec {
            name: request.name.clone(),
            region: request.region.code().to_owned(),
            size: request.size.code().to_owned(),
            memory_mb: request.memory_mb,
            image,
            metadata: request.metadata.clone(),
        };

        let machine = match (&request.repo_url, &request.secrets) {
            (Some(repo_url), Some(secrets)) => {
                let bootstrap = GithubBootstrap {
                    repo_url: repo_url.clone(),
                    github_token: secrets.github_token.clone(),
                    github_username: secrets.github_username.clone(),
                };
                self.provider
                    .create_machine_with_github(&spec, &bootstrap)
                    .await?
            }
            _ => self.provider.create_machine(&spec).await?,
        };

        let instance = instance_from_machine(&request, &spec, machine);
        self.repository.insert(instance.clone())?;
        tracing::info!(
            instance = %instance.id,
            name = %instance.name,
            status = %instance.status,
            "instance created"
        );
        Ok(instance)
    }

    /// Fetches an instance, refreshing its status from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when neither the registry nor the
    /// provider knows the key; other provider errors surface unchanged.
    pub async fn get(&self, key: &str) -> Result<Instance, Error> {
        let instance = self.require(key)?;
        let machine = self
            .provider
            .get_machine(&instance.provider_machine_id)
            .await?;
        self.refresh(instance, &machine)
    }

    /// Lists instances, refreshing statuses from the provider's view.
    ///
    /// # Errors
    ///
    /// Returns the provider or repository error unchanged.
    pub async fn list(&self) -> Result<Vec<Instance>, Error> {
        let machines = self.provider.list_machines().await?;
        let mut instances = self.repository.list()?;
        for instance in &mut instances {
            if let Some(machine) = machines
                .iter()
                .find(|machine| machine.id == instance.provider_machine_id)
            {
                instance.apply_status(status_from_machine(machine.state));
                if machine.private_ip.is_some() {
                    instance.private_ip_address.clone_from(&machine.private_ip);
                }
                self.repository.update(instance.clone())?;
            }
        }
        Ok(instances)
    }

    /// Starts a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys, an operation error for
    /// destroyed instances, or the provider's error unchanged.
    pub async fn start(&self, key: &str) -> Result<Instance, Error> {
        let instance = self.require_mutable(key, Operation::Start)?;
        let machine = self
            .provider
            .start_machine(&instance.provider_machine_id)
            .await?;
        self.refresh(instance, &machine)
    }

    /// Stops a running instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys, an operation error for
    /// destroyed instances, or the provider's error unchanged.
    pub async fn stop(&self, key: &str) -> Result<Instance, Error> {
        let instance = self.require_mutable(key, Operation::Stop)?;
        let machine = self
            .provider
            .stop_machine(&instance.provider_machine_id)
            .await?;
        self.refresh(instance, &machine)
    }

    /// Stop-then-start cycle. The stop is skipped when the machine is not
    /// currently running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys, an operation error for
    /// destroyed instances, or the provider's error unchanged.
    pub async fn restart(&self, key: &str) -> Result<Instance, Error> {
        let instance = self.require_mutable(key, Operation::Restart)?;
        let machine = self
            .provider
            .get_machine(&instance.provider_machine_id)
            .await?;
        if machine.state == MachineState::Started {
            self.provider
                .stop_machine(&instance.provider_machine_id)
                .await?;
        }
        let machine = self
            .provider
            .start_machine(&instance.provider_machine_id)
            .await?;
        self.refresh(instance, &machine)
    }

    /// Destroys an instance. The record stays in the registry in its
    /// terminal state.
    ///
    /// # Errors
    ///
    /// Returns an operation error when the instance is already destroyed,
    /// [`Error::NotFound`] for unknown keys, or the provider's error
    /// unchanged.
    pub async fn destroy(&self, key: &str) -> Result<Instance, Error> {
        let mut instance = self.require(key)?;
        if instance.is_destroyed() {
            return Err(Error::operation(
                Operation::Destroy,
                format!("instance '{}' is already destroyed", instance.name),
            ));
        }
        instance.apply_status(InstanceStatus::Destroying);
        self.repository.update(instance.clone())?;
        self.provider
            .destroy_machine(&instance.provider_machine_id)
            .await?;
        instance.apply_status(InstanceStatus::Destroyed);
        self.repository.update(instance.clone())?;
        tracing::info!(instance = %instance.id, name = %instance.name, "instance destroyed");
        Ok(instance)
    }

    /// Probes instance health.
    ///
    /// Healthy iff the machine is reachable and reports running; a
    /// reachable machine in any other state yields `Ok(false)`. A failed
    /// provider call propagates its error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown keys or the provider's error
    /// unchanged.
    pub async fn health_check(&self, key: &str) -> Result<bool, Error> {
        let instance = self.require(key)?;
        let machine = self
            .provider
            .get_machine(&instance.provider_machine_id)
            .await?;
        self.refresh(instance, &machine)?;
        Ok(machine.state == MachineState::Started)
    }

    /// Looks up the registry record for a key without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the key resolves to nothing.
    pub fn require(&self, key: &str) -> Result<Instance, Error> {
        repository::resolve(self.repository.as_ref(), key)?
            .ok_or_else(|| Error::not_found("instance", key))
    }

    fn require_mutable(&self, key: &str, operation: Operation) -> Result<Instance, Error> {
        let instance = self.require(key)?;
        if instance.is_destroyed() {
            return Err(Error::operation(
                operation,
                format!("instance '{}' is destroyed", instance.name),
            ));
        }
        Ok(instance)
    }

    fn refresh(&self, mut instance: Instance, machine: &Machine) -> Result<Instance, Error> {
        instance.apply_status(status_from_machine(machine.state));
        if machine.private_ip.is_some() {
            instance.private_ip_address.clone_from(&machine.private_ip);
        }
        self.repository.update(instance.clone())?;
        Ok(instance)
    }
}

fn instance_from_machine(
    request: &CreateInstanceRequest,
    spec: &MachineSpec,
    machine: Machine,
) -> Instance {
    let now = Utc::now();
    Instance {
        id: Uuid::new_v4(),
        provider_machine_id: machine.id,
        name: request.name.clone(),
        region: if machine.region.is_empty() {
            spec.region.clone()
        } else {
            machine.region
        },
        image: machine.image.unwrap_or_else(|| spec.image.clone()),
        size: machine.size.unwrap_or_else(|| spec.size.clone()),
        memory_mb: machine.memory_mb.unwrap_or(request.memory_mb),
        status: status_from_machine(machine.state),
        created_at: machine.created_at.unwrap_or(now),
        updated_at: now,
        private_ip_address: machine.private_ip,
        metadata: request.metadata.clone(),
    }
}
