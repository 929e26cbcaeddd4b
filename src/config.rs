//! Environment-sourced configuration via `ortho-config`.
//!
//! Credentials and defaults merge configuration files, environment
//! variables, and defaults once at process start; nothing is re-validated
//! per call. Each backend's settings live in their own variant of
//! [`ProviderConfig`] so credentials can never mix across providers.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::error::Error;

/// Crate-wide defaults and provider selection.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SKIFF")]
pub struct SkiffConfig {
    /// Backend to provision against (`fly` or `vercel`).
    #[ortho_config(default = "fly".to_owned())]
    pub provider: String,
    /// Region applied when a create request does not name one.
    #[ortho_config(default = "iad".to_owned())]
    pub default_region: String,
    /// Size preset applied when a create request does not name one.
    #[ortho_config(default = "shared-cpu-1x".to_owned())]
    pub default_size: String,
    /// Memory applied when a create request does not name one.
    #[ortho_config(default = 512)]
    pub default_memory_mb: u32,
    /// Boot image applied when a create request does not name one.
    #[ortho_config(default = "docker.io/library/ubuntu:22.04".to_owned())]
    pub default_image: String,
}

impl SkiffConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("skiff")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// Fly.io Machines API credentials and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "FLY")]
pub struct FlyConfig {
    /// API token used for authentication. Required.
    pub api_token: String,
    /// Organisation slug, captured for audit trails where required.
    pub org_slug: Option<String>,
    /// Fly application the machines are created under.
    #[ortho_config(default = "skiff-sandboxes".to_owned())]
    pub app_name: String,
    /// Machines API base URL; overridable for tests.
    #[ortho_config(default = "https://api.machines.dev/v1".to_owned())]
    pub api_base_url: String,
}

impl FlyConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("skiff")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.api_token,
            &FieldMetadata::new("Fly API token", "FLY_API_TOKEN", "api_token", "fly"),
        )?;
        require_field(
            &self.app_name,
            &FieldMetadata::new("Fly application name", "FLY_APP_NAME", "app_name", "fly"),
        )?;
        require_field(
            &self.api_base_url,
            &FieldMetadata::new(
                "Machines API base URL",
                "FLY_API_BASE_URL",
                "api_base_url",
                "fly",
            ),
        )?;
        Ok(())
    }
}

/// Vercel Sandbox credentials and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "VERCEL")]
pub struct VercelConfig {
    /// API token used for authentication. Required.
    pub token: String,
    /// Project the sandboxes are created under. Required.
    pub project_id: String,
    /// Team scope, when the token belongs to a team.
    pub team_id: Option<String>,
    /// API base URL; overridable for tests.
    #[ortho_config(default = "https://api.vercel.com".to_owned())]
    pub api_base_url: String,
}

impl VercelConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("skiff")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.token,
            &FieldMetadata::new("Vercel API token", "VERCEL_TOKEN", "token", "vercel"),
        )?;
        require_field(
            &self.project_id,
            &FieldMetadata::new(
                "Vercel project ID",
                "VERCEL_PROJECT_ID",
                "project_id",
                "vercel",
            ),
        )?;
        require_field(
            &self.api_base_url,
            &FieldMetadata::new(
                "Vercel API base URL",
                "VERCEL_API_BASE_URL",
                "api_base_url",
                "vercel",
            ),
        )?;
        Ok(())
    }
}

/// Tagged provider selection; each variant carries only the credentials and
/// settings valid for that backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderConfig {
    /// Fly.io Machines API.
    Fly(FlyConfig),
    /// Vercel Sandbox.
    Vercel(VercelConfig),
}

impl ProviderConfig {
    /// Loads the provider named by `SKIFF_PROVIDER` (default `fly`) together
    /// with that backend's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails, or when the
    /// selected provider name is unknown.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let skiff = SkiffConfig::load_without_cli_args()?;
        Self::for_provider_name(&skiff.provider)
    }

    /// Loads credentials for the named provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] for names other than `fly`
    /// and `vercel`, or the underlying load/validation error.
    pub fn for_provider_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fly" => {
                let config = FlyConfig::load_without_cli_args()?;
                config.validate()?;
                Ok(Self::Fly(config))
            }
            "vercel" => {
                let config = VercelConfig::load_without_cli_args()?;
                config.validate()?;
                Ok(Self::Vercel(config))
            }
            other => Err(ConfigError::UnknownProvider(other.to_owned())),
        }
    }

    /// Name of the selected backend.
    #[must_use]
    pub const fn provider_name(&self) -> &'static str {
        match self {
            Self::Fly(_) => "fly",
            Self::Vercel(_) => "vercel",
        }
    }
}

/// Metadata for a configuration field, used to build actionable messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in skiff.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, ThisError, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when `SKIFF_PROVIDER` names an unsupported backend.
    #[error("unknown provider '{0}': expected fly or vercel")]
    UnknownProvider(String),
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Self::validation(value.to_string())
    }
}
