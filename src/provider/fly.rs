//! Fly.io Machines API backend.
//!
//! Wire contract: base `{api_base_url}/apps/{app}/machines`, exec
//! sub-resource `POST .../machines/{id}/exec` with `{cmd, timeout}` where
//! `timeout` is seconds capped at 60. Start/stop endpoints acknowledge
//! without returning the machine, so both re-fetch before returning.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::FlyConfig;
use crate::error::{Error, Operation};
use crate::instance::MachineSize;
use crate::provider::{
    ExecOutput, ExecRequest, GithubBootstrap, Machine, MachineSpec, MachineState, Provider,
    ProviderFuture, exec_timeout_secs,
};

/// Fly exec timeouts are expressed in seconds and capped at this value.
pub const FLY_EXEC_TIMEOUT_CAP_SECS: u64 = 60;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Backend that provisions sandboxes through the Fly.io Machines API.
#[derive(Clone, Debug)]
pub struct FlyProvider {
    client: reqwest::Client,
    config: FlyConfig,
}

impl FlyProvider {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the configuration is incomplete or
    /// [`Error::Infrastructure`] when the HTTP client cannot be built.
    pub fn new(config: FlyConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| Error::infrastructure(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn machines_url(&self) -> String {
        format!(
            "{}/apps/{}/machines",
            self.config.api_base_url, self.config.app_name
        )
    }

    fn machine_url(&self, id: &str) -> String {
        format!("{}/{id}", self.machines_url())
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: Operation,
        resource_id: &str,
    ) -> Result<reqwest::Response, Error> {
        let response = request
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|err| Error::infrastructure(format!("request to Fly failed: {err}")))?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_backend_status(
            status, operation, "machine", resource_id, &body,
        ))
    }

    async fn fetch_machine(&self, id: &str, operation: Operation) -> Result<Machine, Error> {
        let request = self
            .client
            .get(self.machine_url(id))
            .timeout(REQUEST_TIMEOUT);
        let response = self.send(request, operation, id).await?;
        let machine: FlyMachine = response
            .json()
            .await
            .map_err(|err| Error::infrastructure(format!("failed to decode Fly machine: {err}")))?;
        Ok(machine.into_machine())
    }

    async fn create(
        &self,
        spec: &MachineSpec,
        bootstrap: Option<&GithubBootstrap>,
    ) -> Result<Machine, Error> {
        let body = create_body(spec, bootstrap)?;
        let request = self
            .client
            .post(self.machines_url())
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        let response = self.send(request, Operation::Create, &spec.name).await?;
        let machine: FlyMachine = response
            .json()
            .await
            .map_err(|err| Error::infrastructure(format!("failed to decode Fly machine: {err}")))?;
        Ok(machine.into_machine())
    }

    async fn post_action(&self, id: &str, action: &str, operation: Operation) -> Result<Machine, Error> {
        let url = format!("{}/{action}", self.machine_url(id));
        let request = self.client.post(url).timeout(REQUEST_TIMEOUT);
        self.send(request, operation, id).await?;
        // Start/stop acknowledge without a machine payload.
        self.fetch_machine(id, operation).await
    }
}

impl Provider for FlyProvider {
    fn create_machine<'a>(&'a self, spec: &'a MachineSpec) -> ProviderFuture<'a, Machine> {
        Box::pin(async move { self.create(spec, None).await })
    }

    fn create_machine_with_github<'a>(
        &'a self,
        spec: &'a MachineSpec,
        bootstrap: &'a GithubBootstrap,
    ) -> ProviderFuture<'a, Machine> {
        Box::pin(async move { self.create(spec, Some(bootstrap)).await })
    }

    fn get_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move { self.fetch_machine(id, Operation::Get).await })
    }

    fn list_machines(&self) -> ProviderFuture<'_, Vec<Machine>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.machines_url())
                .timeout(REQUEST_TIMEOUT);
            let response = self.send(request, Operation::List, "all").await?;
            let machines: Vec<FlyMachine> = response.json().await.map_err(|err| {
                Error::infrastructure(format!("failed to decode Fly machine list: {err}"))
            })?;
            Ok(machines
                .into_iter()
                .map(FlyMachine::into_machine)
                .collect())
        })
    }

    fn start_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move { self.post_action(id, "start", Operation::Start).await })
    }

    fn stop_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Machine> {
        Box::pin(async move { self.post_action(id, "stop", Operation::Stop).await })
    }

    fn destroy_machine<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let url = format!("{}?force=true", self.machine_url(id));
            let request = self.client.delete(url).timeout(REQUEST_TIMEOUT);
            self.send(request, Operation::Destroy, id).await?;
            Ok(())
        })
    }

    fn execute_command<'a>(
        &'a self,
        id: &'a str,
        request: &'a ExecRequest,
    ) -> ProviderFuture<'a, ExecOutput> {
        Box::pin(async move {
            let body = exec_body(request);
            let http = self
                .client
                .post(format!("{}/exec", self.machine_url(id)))
                .timeout(request.timeout + EXEC_TIMEOUT_GRACE)
                .json(&body);
            let response = self.send(http, Operation::Execute, id).await?;
            response.json::<ExecOutput>().await.map_err(|err| {
                Error::infrastructure(format!("failed to decode Fly exec output: {err}"))
            })
        })
    }
}

fn create_body(
    spec: &MachineSpec,
    bootstrap: Option<&GithubBootstrap>,
) -> Result<serde_json::Value, Error> {
    let size: MachineSize = spec.size.parse()?;
    let mut config = json!({
        "image": spec.image,
        "guest": {
            "cpu_kind": size.cpu_kind(),
            "cpus": size.cpus(),
            "memory_mb": spec.memory_mb,
        },
    });
    if !spec.metadata.is_empty() {
        config["metadata"] = json!(spec.metadata);
    }
    if let Some(bootstrap) = bootstrap {
        config["init"] = json!({
            "exec": ["/bin/sh", "-lc", bootstrap.clone_command()],
        });
    }
    Ok(json!({
        "name": spec.name,
        "region": spec.region,
        "config": config,
    }))
}

fn exec_body(request: &ExecRequest) -> serde_json::Value {
    json!({
        "cmd": request.command,
        "timeout": exec_timeout_secs(request.timeout, FLY_EXEC_TIMEOUT_CAP_SECS),
    })
}

#[derive(Debug, Deserialize)]
struct FlyMachine {
    id: String,
    name: String,
    state: String,
    region: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    config: Option<FlyMachineConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FlyMachineConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    guest: Option<FlyGuest>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FlyGuest {
    #[serde(default)]
    cpu_kind: Option<String>,
    #[serde(default)]
    cpus: Option<u32>,
    #[serde(default)]
    memory_mb: Option<u32>,
}

impl FlyMachine {
    fn into_machine(self) -> Machine {
        let config = self.config.unwrap_or_default();
        let guest = config.guest;
        let size = guest.as_ref().and_then(|g| match (g.cpu_kind.as_deref(), g.cpus) {
            (Some("shared"), Some(cpus)) => Some(format!("shared-cpu-{cpus}x")),
            (Some(kind), Some(cpus)) => Some(format!("{kind}-{cpus}x")),
            _ => None,
        });
        Machine {
            id: self.id,
            name: self.name,
            state: MachineState::from_backend(&self.state),
            region: self.region,
            image: config.image,
            size,
            memory_mb: guest.and_then(|g| g.memory_mb),
            private_ip: self.private_ip,
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            updated_at: self.updated_at.as_deref().and_then(parse_timestamp),
            metadata: config.metadata.unwrap_or_default(),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
