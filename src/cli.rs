//! Command-line interface definitions for the `skiff` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page.

use clap::Parser;

/// Top-level CLI for the `skiff` binary.
#[derive(Debug, Parser)]
#[command(
    name = "skiff",
    about = "Provision disposable cloud sandboxes and run commands inside them",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a sandbox and wait until it is running.
    #[command(name = "create", about = "Provision a sandbox and verify it is running")]
    Create(CreateCommand),
    /// Stop (best effort) and destroy a sandbox.
    #[command(name = "destroy", about = "Stop and destroy a sandbox")]
    Destroy(TargetCommand),
    /// Restart a sandbox and verify it comes back healthy.
    #[command(name = "restart", about = "Restart a sandbox and verify health")]
    Restart(TargetCommand),
    /// Probe sandbox health.
    #[command(name = "health", about = "Probe sandbox health")]
    Health(TargetCommand),
    /// List known sandboxes.
    #[command(name = "list", about = "List known sandboxes")]
    List,
    /// Execute an allowlisted command inside a sandbox.
    #[command(name = "exec", about = "Execute an allowlisted command inside a sandbox")]
    Exec(ExecCommand),
}

/// Arguments for the `skiff create` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CreateCommand {
    /// Sandbox name (letters, digits, and hyphens).
    #[arg(long)]
    pub(crate) name: String,
    /// Placement region.
    #[arg(long, default_value = "iad", value_name = "REGION")]
    pub(crate) region: String,
    /// Machine size preset.
    #[arg(long, default_value = "shared-cpu-1x", value_name = "SIZE")]
    pub(crate) size: String,
    /// Memory in megabytes.
    #[arg(long, default_value_t = 512, value_name = "MB")]
    pub(crate) memory_mb: u32,
    /// Boot image override.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Repository cloned into the sandbox on first boot.
    #[arg(long, value_name = "URL")]
    pub(crate) repo_url: Option<String>,
    /// GitHub token for the clone (required with --repo-url).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, value_name = "TOKEN")]
    pub(crate) github_token: Option<String>,
    /// GitHub username for the clone (required with --repo-url).
    #[arg(long, env = "GITHUB_USERNAME", value_name = "USER")]
    pub(crate) github_username: Option<String>,
}

/// Arguments for subcommands that target one sandbox.
#[derive(Debug, Parser)]
pub(crate) struct TargetCommand {
    /// Sandbox id or name.
    #[arg(value_name = "INSTANCE")]
    pub(crate) instance: String,
}

/// Arguments for the `skiff exec` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    /// Sandbox id or name.
    #[arg(value_name = "INSTANCE")]
    pub(crate) instance: String,
    /// Timeout in milliseconds (1000-300000).
    #[arg(long, value_name = "MS")]
    pub(crate) timeout_ms: Option<u64>,
    /// Emit the streamed event sequence as JSON lines instead of raw output.
    #[arg(long)]
    pub(crate) stream: bool,
    /// Command and arguments to execute (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
