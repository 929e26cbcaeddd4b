//! Domain model for sandbox instances and their lifecycle state machine.
//!
//! An [`Instance`] is the caller-visible handle to a remote compute sandbox;
//! the provider-native resource backing it is a `Machine` (see
//! [`crate::provider`]). Status moves only along the transition table encoded
//! in [`InstanceStatus::can_transition_to`]; `Destroyed` is terminal and
//! absorbing.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Maximum accepted instance name length.
pub const MAX_NAME_LEN: usize = 50;

/// Minimum accepted instance memory in megabytes.
pub const MIN_MEMORY_MB: u32 = 256;

/// Maximum accepted instance memory in megabytes.
pub const MAX_MEMORY_MB: u32 = 65_536;

/// Accepted GitHub token prefixes for the bootstrap path.
pub const GITHUB_TOKEN_PREFIXES: [&str; 3] = ["ghp_", "gho_", "github_pat_"];

/// Lifecycle state of an [`Instance`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Creation request accepted, machine not yet visible.
    Creating,
    /// Machine exists but has not begun starting.
    Provisioning,
    /// Machine is booting.
    Starting,
    /// Machine is up and accepting commands.
    Running,
    /// Machine is powering off.
    Stopping,
    /// Machine is powered off and restartable.
    Stopped,
    /// Teardown in progress.
    Destroying,
    /// Terminal, absorbing state. The record must not be mutated again.
    Destroyed,
    /// Unrecoverable provider error.
    Failed,
    /// Provider reported a state this crate does not recognise.
    Unknown,
}

impl InstanceStatus {
    /// Returns `true` when no further transitions are permitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Any non-terminal state may move to `Failed` or `Destroying`;
    /// `Destroyed` accepts nothing. `Unknown` is a reconciliation state and
    /// may move anywhere.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed | Self::Destroying | Self::Unknown) {
            return true;
        }
        match self {
            Self::Creating => matches!(next, Self::Provisioning | Self::Starting),
            Self::Provisioning => matches!(next, Self::Starting),
            Self::Starting => matches!(next, Self::Running),
            Self::Running => matches!(next, Self::Stopping | Self::Stopped),
            Self::Stopping => matches!(next, Self::Stopped),
            Self::Stopped => matches!(next, Self::Starting | Self::Running),
            Self::Destroying => matches!(next, Self::Destroyed),
            Self::Failed => false,
            Self::Unknown => true,
            Self::Destroyed => false,
        }
    }

    /// Stable lowercase name used in messages and wire payloads.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Deployment region offered by the backends.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Region {
    Ams,
    Cdg,
    Dfw,
    Ewr,
    Fra,
    Gru,
    Hkg,
    Iad,
    Lax,
    Lhr,
    Nrt,
    Ord,
    Scl,
    Sea,
    Sin,
    Sjc,
    Syd,
    Yyz,
}

impl Region {
    /// Region code as the backends expect it.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Ams => "ams",
            Self::Cdg => "cdg",
            Self::Dfw => "dfw",
            Self::Ewr => "ewr",
            Self::Fra => "fra",
            Self::Gru => "gru",
            Self::Hkg => "hkg",
            Self::Iad => "iad",
            Self::Lax => "lax",
            Self::Lhr => "lhr",
            Self::Nrt => "nrt",
            Self::Ord => "ord",
            Self::Scl => "scl",
            Self::Sea => "sea",
            Self::Sin => "sin",
            Self::Sjc => "sjc",
            Self::Syd => "syd",
            Self::Yyz => "yyz",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ams" => Ok(Self::Ams),
            "cdg" => Ok(Self::Cdg),
            "dfw" => Ok(Self::Dfw),
            "ewr" => Ok(Self::Ewr),
            "fra" => Ok(Self::Fra),
            "gru" => Ok(Self::Gru),
            "hkg" => Ok(Self::Hkg),
            "iad" => Ok(Self::Iad),
            "lax" => Ok(Self::Lax),
            "lhr" => Ok(Self::Lhr),
            "nrt" => Ok(Self::Nrt),
            "ord" => Ok(Self::Ord),
            "scl" => Ok(Self::Scl),
            "sea" => Ok(Self::Sea),
            "sin" => Ok(Self::Sin),
            "sjc" => Ok(Self::Sjc),
            "syd" => Ok(Self::Syd),
            "yyz" => Ok(Self::Yyz),
            other => Err(Error::validation_field(
                "region",
                format!("unknown region '{other}'"),
            )),
        }
    }
}

/// Machine size (CPU preset) offered by the backends.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[allow(missing_docs)]
pub enum MachineSize {
    SharedCpu1x,
    SharedCpu2x,
    SharedCpu4x,
    SharedCpu8x,
    Performance1x,
    Performance2x,
    Performance4x,
    Performance8x,
    Performance16x,
}

impl MachineSize {
    /// Size code as the backends expect it (for example `shared-cpu-1x`).
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SharedCpu1x => "shared-cpu-1x",
            Self::SharedCpu2x => "shared-cpu-2x",
            Self::SharedCpu4x => "shared-cpu-4x",
            Self::SharedCpu8x => "shared-cpu-8x",
            Self::Performance1x => "performance-1x",
            Self::Performance2x => "performance-2x",
            Self::Performance4x => "performance-4x",
            Self::Performance8x => "performance-8x",
            Self::Performance16x => "performance-16x",
        }
    }

    /// CPU kind segment of the size (`shared` or `performance`).
    #[must_use]
    pub const fn cpu_kind(self) -> &'static str {
        match self {
            Self::SharedCpu1x | Self::SharedCpu2x | Self::SharedCpu4x | Self::SharedCpu8x => {
                "shared"
            }
            _ => "performance",
        }
    }

    /// Number of CPUs in the preset.
    #[must_use]
    pub const fn cpus(self) -> u32 {
        match self {
            Self::SharedCpu1x | Self::Performance1x => 1,
            Self::SharedCpu2x | Self::Performance2x => 2,
            Self::SharedCpu4x | Self::Performance4x => 4,
            Self::SharedCpu8x | Self::Performance8x => 8,
            Self::Performance16x => 16,
        }
    }
}

impl std::fmt::Display for MachineSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MachineSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared-cpu-1x" => Ok(Self::SharedCpu1x),
            "shared-cpu-2x" => Ok(Self::SharedCpu2x),
            "shared-cpu-4x" => Ok(Self::SharedCpu4x),
            "shared-cpu-8x" => Ok(Self::SharedCpu8x),
            "performance-1x" => Ok(Self::Performance1x),
            "performance-2x" => Ok(Self::Performance2x),
            "performance-4x" => Ok(Self::Performance4x),
            "performance-8x" => Ok(Self::Performance8x),
            "performance-16x" => Ok(Self::Performance16x),
            other => Err(Error::validation_field(
                "size",
                format!("unknown machine size '{other}'"),
            )),
        }
    }
}

/// GitHub credentials required when a repository bootstrap is requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GithubSecrets {
    /// Personal access token (`ghp_`, `gho_`, or `github_pat_` prefix).
    pub github_token: String,
    /// Username the clone authenticates as.
    pub github_username: String,
}

impl GithubSecrets {
    /// Validates token prefix and username presence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the token prefix is unrecognised or
    /// the username is blank.
    pub fn validate(&self) -> Result<(), Error> {
        if !GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| self.github_token.starts_with(prefix))
        {
            return Err(Error::validation_field(
                "github_token",
                "github token must start with ghp_, gho_, or github_pat_",
            ));
        }
        if self.github_username.trim().is_empty() {
            return Err(Error::validation_field(
                "github_username",
                "github username must not be empty",
            ));
        }
        Ok(())
    }
}

/// Caller-visible handle to a remote compute sandbox.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Instance {
    /// Opaque caller-visible identifier.
    pub id: Uuid,
    /// Backend-native identifier for the machine backing this instance.
    pub provider_machine_id: String,
    /// Caller-chosen name (alphanumeric plus hyphen, at most 50 chars).
    pub name: String,
    /// Region the instance was placed in.
    pub region: String,
    /// Boot image.
    pub image: String,
    /// Machine size preset.
    pub size: String,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Current lifecycle state.
    pub status: InstanceStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Private address on the backend network, once assigned.
    pub private_ip_address: Option<String>,
    /// Caller-supplied key/value metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    /// Returns `true` once the instance has reached its terminal state.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a provider-confirmed status, refreshing `updated_at`.
    ///
    /// Transitions out of the terminal state are ignored; a jump the table
    /// does not list is applied anyway (polling cannot observe every
    /// intermediate state) but logged so drift stays visible.
    pub fn apply_status(&mut self, next: InstanceStatus) {
        if self.status.is_terminal() && next != self.status {
            tracing::warn!(
                instance = %self.id,
                from = %self.status,
                to = %next,
                "ignoring status change on destroyed instance"
            );
            return;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                instance = %self.id,
                from = %self.status,
                to = %next,
                "provider-confirmed status skipped intermediate states"
            );
        }
        if self.status != next {
            self.status = next;
            self.updated_at = Utc::now();
        }
    }
}

/// Validated input for [`crate::instances::InstanceService::create`].
#[derive(Clone, Debug, PartialEq)]
pub struct CreateInstanceRequest {
    /// Instance name.
    pub name: String,
    /// Placement region.
    pub region: Region,
    /// Machine size preset.
    pub size: MachineSize,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Boot image override; the service default applies when `None`.
    pub image: Option<String>,
    /// Repository cloned into the sandbox on boot, when present.
    pub repo_url: Option<String>,
    /// GitHub credentials; required exactly when `repo_url` is present.
    pub secrets: Option<GithubSecrets>,
    /// Caller-supplied metadata copied onto the machine.
    pub metadata: BTreeMap<String, String>,
}

impl CreateInstanceRequest {
    /// Starts a builder for a [`CreateInstanceRequest`].
    #[must_use]
    pub fn builder() -> CreateInstanceRequestBuilder {
        CreateInstanceRequestBuilder::default()
    }

    /// Validates the request, returning a descriptive error for the first
    /// violation found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the name, memory bound, or GitHub
    /// bootstrap pairing is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::validation_field("name", "name must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::validation_field(
                "name",
                format!("name must be at most {MAX_NAME_LEN} characters"),
            ));
        }
        if !self
            .name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
        {
            return Err(Error::validation_field(
                "name",
                "name may only contain letters, digits, and hyphens",
            ));
        }
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(Error::validation_field(
                "memory_mb",
                format!("memory must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB} MB"),
            ));
        }
        match (&self.repo_url, &self.secrets) {
            (Some(_), Some(secrets)) => secrets.validate()?,
            (Some(_), None) => {
                return Err(Error::validation_field(
                    "secrets",
                    "github token and username are required when repo_url is set",
                ));
            }
            (None, Some(_)) => {
                return Err(Error::validation_field(
                    "repo_url",
                    "repo_url is required when github secrets are provided",
                ));
            }
            (None, None) => {}
        }
        Ok(())
    }
}

/// Builder for [`CreateInstanceRequest`] that trims string inputs and
/// validates on build.
#[derive(Clone, Debug, Default)]
pub struct CreateInstanceRequestBuilder {
    name: String,
    region: Option<Region>,
    size: Option<MachineSize>,
    memory_mb: Option<u32>,
    image: Option<String>,
    repo_url: Option<String>,
    secrets: Option<GithubSecrets>,
    metadata: BTreeMap<String, String>,
}

impl CreateInstanceRequestBuilder {
    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the placement region.
    #[must_use]
    pub fn region(mut self, value: Region) -> Self {
        self.region = Some(value);
        self
    }

    /// Sets the machine size preset.
    #[must_use]
    pub fn size(mut self, value: MachineSize) -> Self {
        self.size = Some(value);
        self
    }

    /// Sets the memory in megabytes.
    #[must_use]
    pub fn memory_mb(mut self, value: u32) -> Self {
        self.memory_mb = Some(value);
        self
    }

    /// Overrides the boot image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = Some(value.into());
        self
    }

    /// Requests a repository bootstrap on boot.
    #[must_use]
    pub fn repo_url(mut self, value: impl Into<String>) -> Self {
        self.repo_url = Some(value.into());
        self
    }

    /// Supplies GitHub credentials for the bootstrap path.
    #[must_use]
    pub fn secrets(mut self, value: GithubSecrets) -> Self {
        self.secrets = Some(value);
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the request.
    ///
    /// Region, size, and memory fall back to the crate defaults (`iad`,
    /// `shared-cpu-1x`, 512 MB) when unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when any field is invalid.
    pub fn build(self) -> Result<CreateInstanceRequest, Error> {
        let request = CreateInstanceRequest {
            name: self.name.trim().to_owned(),
            region: self.region.unwrap_or(Region::Iad),
            size: self.size.unwrap_or(MachineSize::SharedCpu1x),
            memory_mb: self.memory_mb.unwrap_or(512),
            image: self.image.map(|value| value.trim().to_owned()),
            repo_url: self.repo_url.map(|value| value.trim().to_owned()),
            secrets: self.secrets,
            metadata: self.metadata,
        };
        request.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(name: &str, memory_mb: u32) -> Result<CreateInstanceRequest, Error> {
        CreateInstanceRequest::builder()
            .name(name)
            .memory_mb(memory_mb)
            .build()
    }

    #[rstest]
    #[case("dev1", 512, true)]
    #[case("dev-1-sandbox", 256, true)]
    #[case("", 512, false)]
    #[case("bad name", 512, false)]
    #[case("under_score", 512, false)]
    #[case("dev1", 255, false)]
    #[case("dev1", 65_537, false)]
    fn create_request_validation(#[case] name: &str, #[case] memory: u32, #[case] ok: bool) {
        assert_eq!(request(name, memory).is_ok(), ok, "name={name} memory={memory}");
    }

    #[test]
    fn create_request_rejects_overlong_name() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        let err = request(&name, 512).expect_err("51-char name should be rejected");
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn repo_url_without_secrets_is_rejected() {
        let err = CreateInstanceRequest::builder()
            .name("dev1")
            .repo_url("https://github.com/acme/app.git")
            .build()
            .expect_err("missing secrets should be rejected");
        assert!(matches!(err, Error::Validation { field: Some(f), .. } if f == "secrets"));
    }

    #[rstest]
    #[case("ghp_abc123", true)]
    #[case("gho_abc123", true)]
    #[case("github_pat_abc123", true)]
    #[case("token123", false)]
    fn github_token_prefixes(#[case] token: &str, #[case] ok: bool) {
        let result = CreateInstanceRequest::builder()
            .name("dev1")
            .repo_url("https://github.com/acme/app.git")
            .secrets(GithubSecrets {
                github_token: token.to_owned(),
                github_username: "octocat".to_owned(),
            })
            .build();
        assert_eq!(result.is_ok(), ok, "token={token}");
    }

    #[rstest]
    #[case(InstanceStatus::Creating, InstanceStatus::Provisioning, true)]
    #[case(InstanceStatus::Provisioning, InstanceStatus::Starting, true)]
    #[case(InstanceStatus::Starting, InstanceStatus::Running, true)]
    #[case(InstanceStatus::Running, InstanceStatus::Stopping, true)]
    #[case(InstanceStatus::Stopping, InstanceStatus::Stopped, true)]
    #[case(InstanceStatus::Stopped, InstanceStatus::Starting, true)]
    #[case(InstanceStatus::Running, InstanceStatus::Failed, true)]
    #[case(InstanceStatus::Stopped, InstanceStatus::Destroying, true)]
    #[case(InstanceStatus::Destroying, InstanceStatus::Destroyed, true)]
    #[case(InstanceStatus::Destroyed, InstanceStatus::Starting, false)]
    #[case(InstanceStatus::Destroyed, InstanceStatus::Destroying, false)]
    #[case(InstanceStatus::Running, InstanceStatus::Creating, false)]
    #[case(InstanceStatus::Stopped, InstanceStatus::Stopping, false)]
    fn transition_table(
        #[case] from: InstanceStatus,
        #[case] to: InstanceStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
    }

    #[test]
    fn destroyed_ignores_later_status() {
        let mut instance = Instance {
            id: Uuid::new_v4(),
            provider_machine_id: "m1".to_owned(),
            name: "dev1".to_owned(),
            region: "iad".to_owned(),
            image: "ubuntu".to_owned(),
            size: "shared-cpu-1x".to_owned(),
            memory_mb: 512,
            status: InstanceStatus::Destroyed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            private_ip_address: None,
            metadata: BTreeMap::new(),
        };
        instance.apply_status(InstanceStatus::Running);
        assert_eq!(instance.status, InstanceStatus::Destroyed);
    }

    #[rstest]
    #[case("iad", true)]
    #[case("LHR", true)]
    #[case("atlantis", false)]
    fn region_parsing(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(input.parse::<Region>().is_ok(), ok);
    }

    #[rstest]
    #[case("shared-cpu-1x", "shared", 1)]
    #[case("performance-16x", "performance", 16)]
    fn size_parsing(#[case] input: &str, #[case] kind: &str, #[case] cpus: u32) {
        let size: MachineSize = input.parse().expect("size should parse");
        assert_eq!(size.cpu_kind(), kind);
        assert_eq!(size.cpus(), cpus);
        assert_eq!(size.code(), input);
    }
}
