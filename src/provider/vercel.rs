//! Vercel Sandbox backend.
//!
//! Sandboxes live under `{api_base_url}/v1/sandboxes`, scoped to a project
//! and optionally a team (`teamId` query parameter). Exec accepts the caller
//! timeout in milliseconds directly, so no unit conversion applies here.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::VercelConfig;
use crate::error::{Error, Operation};
use crate::provider::{
    ExecOutput, ExecRequest, GithubBootstrap, Machine, MachineSpec, MachineState, Provider,
    ProviderFuture,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Backend that provisions sandboxes through the Vercel Sandbox API.
#[derive(Clone, Debug)]
pub struct VercelProvider {
    client: reqwest::Client,
    config: VercelConfig,
}

impl VercelProvider {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the configuration is incomplete or
    /// [`Error::Infrastructure`] when the HTTP client cannot be built.
    pub fn new(config: VercelConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| Error::infrastructure(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn sandboxes_url(&self) -> String {
        format!("{}/v1/sandboxes", self.config.api_base_url)
    }

    fn sandbox_url(&self, id: &str) -> String {
        format!("{}/{id}", self.sandboxes_url())
    }

    fn scope(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.team_id {
            Some(team_id) => request.query(&[("teamId", team_id.as_str())]),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: Operation,
        resource_id: &str,
    ) -> Result<reqwest::Response, Error> {
        let response = self
            .scope(request)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|err| Error::infrastructure(format!("request to Vercel failed: {err}")))?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_backend_status(
            status, operation, "sandbox", resource_id, &body,
        ))
    }

    async fn fetch_sandbox(&self, id: &str, operation: Operation) -> Result<Machine, Error> {
        let request = self
            .client
            .get(self.sandbox_url(id))
            .timeout(REQUEST_TIMEOUT);
        let response = self.send(request, operation, id).await?;
        let sandbox: VercelSandbox = response.json().await.map_err(|err| {
            Error::infrastructure(format!("failed to decode Vercel sandbox: {err}"))
        })?;
        Ok(sandbox.into_machine())
    }

    async fn create(
        &self,
        spec: &MachineSpec,
        bootstrap: Option<&GithubBootstrap>,
    ) -> Result<Machine, Error> {
        let body = create_body(&self.config, spec, bootstrap);
        let request = self
            .client
            .post(self.sandboxes_url())
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        let response = self.send(request, Operation::Create, &spec.name).await?;
        let sandbox: VercelSandbox = response.json().await.map_err(|err| {
            Error::infrastructure(format!("failed to decode Vercel sandbox: {err}"))
        })?;
        Ok(sandbox.into_machine())
    }

    async fn post_action(
        &self,
        id: &str,
        action: &str,
        operation: Operation,
    ) -> Result<Machine, Error> {
        let url = format!("{}/{action}", self.sandbox_url(id));
        let request = self.client.post(url).timeout(REQUEST_TIMEOUT);
        self.send(request, operation, id).await?;
        self.fetch_sandbox(id, operation).await
    }
}

impl Provider for VercelProvider {
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
        Box::pin(async move { self.fetch_sandbox(id, Operation::Get).await })
    }

    fn list_machines(&self) -> ProviderFuture<'_, Vec<Machine>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.sandboxes_url())
                .query(&[("projectId", self.config.project_id.as_str())])
                .timeout(REQUEST_TIMEOUT);
            let response = self.send(request, Operation::List, "all").await?;
            let list: VercelSandboxList = response.json().await.map_err(|err| {
                Error::infrastructure(format!("failed to decode Vercel sandbox list: {err}"))
            })?;
            Ok(list
                .sandboxes
                .into_iter()
                .map(VercelSandbox::into_machine)
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
            let request = self.client.delete(self.sandbox_url(id)).timeout(REQUEST_TIMEOUT);
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
            let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
            let body = json!({
                "command": request.command,
                "timeoutMs": timeout_ms,
            });
            let http = self
                .client
                .post(format!("{}/commands", self.sandbox_url(id)))
                .timeout(request.timeout + EXEC_TIMEOUT_GRACE)
                .json(&body);
            let response = self.send(http, Operation::Execute, id).await?;
            response.json::<ExecOutput>().await.map_err(|err| {
                Error::infrastructure(format!("failed to decode Vercel exec output: {err}"))
            })
        })
    }
}

fn create_body(
    config: &VercelConfig,
    spec: &MachineSpec,
    bootstrap: Option<&GithubBootstrap>,
) -> serde_json::Value {
    let mut body = json!({
        "name": spec.name,
        "projectId": config.project_id,
        "region": spec.region,
        "image": spec.image,
        "resources": {
            "memoryMb": spec.memory_mb,
        },
    });
    if !spec.metadata.is_empty() {
        body["metadata"] = json!(spec.metadata);
    }
    if let Some(bootstrap) = bootstrap {
        body["bootstrapCommand"] = json!(bootstrap.clone_command());
    }
    body
}

#[derive(Debug, Deserialize)]
struct VercelSandboxList {
    #[serde(default)]
    sandboxes: Vec<VercelSandbox>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VercelSandbox {
    #[serde(alias = "sandboxId")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "state")]
    status: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    resources: Option<VercelResources>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VercelResources {
    #[serde(default)]
    memory_mb: Option<u32>,
}

impl VercelSandbox {
    fn into_machine(self) -> Machine {
        let name = self.name.unwrap_or_else(|| self.id.clone());
        Machine {
            name,
            state: MachineState::from_backend(&self.status),
            region: self.region.unwrap_or_default(),
            image: None,
            size: None,
            memory_mb: self.resources.and_then(|r| r.memory_mb),
            private_ip: self.private_ip,
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            updated_at: self.updated_at.as_deref().and_then(parse_timestamp),
            metadata: self.metadata.unwrap_or_default(),
            id: self.id,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VercelConfig {
        VercelConfig {
            token: "tok".to_owned(),
            project_id: "prj_123".to_owned(),
            team_id: None,
            api_base_url: "https://api.vercel.com".to_owned(),
        }
    }

    fn spec() -> MachineSpec {
        MachineSpec {
            name: "dev1".to_owned(),
            region: "iad".to_owned(),
            size: "shared-cpu-1x".to_owned(),
            memory_mb: 512,
            image: "docker.io/library/ubuntu:22.04".to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn create_body_scopes_to_project() {
        let body = create_body(&config(), &spec(), None);
        assert_eq!(body["projectId"], "prj_123");
        assert_eq!(body["resources"]["memoryMb"], 512);
        assert!(body.get("bootstrapCommand").is_none());
    }

    #[test]
    fn create_body_github_path_sets_bootstrap_command() {
        let bootstrap = GithubBootstrap {
            repo_url: "https://github.com/acme/app.git".to_owned(),
            github_token: "ghp_secret".to_owned(),
            github_username: "octocat".to_owned(),
        };
        let body = create_body(&config(), &spec(), Some(&bootstrap));
        let rendered = body["bootstrapCommand"]
            .as_str()
            .expect("bootstrap command should be a string");
        assert!(rendered.contains("git clone"), "rendered: {rendered}");
    }

    #[test]
    fn sandbox_wire_shape_normalises_aliases() {
        let raw = r#"{
            "sandboxId": "sbx_9",
            "state": "running",
            "region": "iad",
            "createdAt": "2026-01-05T10:00:00Z",
            "resources": {"memoryMb": 1024}
        }"#;
        let sandbox: VercelSandbox = serde_json::from_str(raw).expect("wire shape should parse");
        let machine = sandbox.into_machine();
        assert_eq!(machine.id, "sbx_9");
        assert_eq!(machine.name, "sbx_9");
        assert_eq!(machine.state, MachineState::Started);
        assert_eq!(machine.memory_mb, Some(1024));
    }

    #[test]
    fn empty_sandbox_list_parses() {
        let list: VercelSandboxList = serde_json::from_str("{}").expect("empty list should parse");
        assert!(list.sandboxes.is_empty());
    }
}
