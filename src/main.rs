//! Binary entry point for the skiff CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use skiff::commands::ExecParams;
use skiff::error::Error as SkiffError;
use skiff::instance::{CreateInstanceRequest, GithubSecrets, MachineSize, Region};
use skiff::sdk::Skiff;

mod cli;
use cli::{Cli, CreateCommand, ExecCommand, TargetCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Sdk(#[from] SkiffError),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("no command supplied")]
    MissingCommand,
    #[error("failed to render output: {0}")]
    Render(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Create(args) => run_create(args).await,
        Cli::Destroy(args) => run_destroy(args).await,
        Cli::Restart(args) => run_restart(args).await,
        Cli::Health(args) => run_health(args).await,
        Cli::List => run_list().await,
        Cli::Exec(args) => run_exec(args).await,
    }
}

async fn run_create(args: CreateCommand) -> Result<i32, CliError> {
    let region: Region = args.region.parse().map_err(CliError::Sdk)?;
    let size: MachineSize = args.size.parse().map_err(CliError::Sdk)?;

    let mut builder = CreateInstanceRequest::builder()
        .name(args.name)
        .region(region)
        .size(size)
        .memory_mb(args.memory_mb);
    if let Some(image) = args.image {
        builder = builder.image(image);
    }
    if let Some(repo_url) = args.repo_url {
        builder = builder.repo_url(repo_url);
    }
    if let (Some(github_token), Some(github_username)) = (args.github_token, args.github_username)
    {
        builder = builder.secrets(GithubSecrets {
            github_token,
            github_username,
        });
    }
    let request = builder.build().map_err(CliError::Sdk)?;

    let sdk = Skiff::from_env()?;
    let outcome = sdk.create_instance(request).await?;
    write_json(&outcome)?;
    Ok(0)
}

async fn run_destroy(args: TargetCommand) -> Result<i32, CliError> {
    let sdk = Skiff::from_env()?;
    let outcome = sdk.destroy_instance(&args.instance).await?;
    write_json(&outcome)?;
    Ok(0)
}

async fn run_restart(args: TargetCommand) -> Result<i32, CliError> {
    let sdk = Skiff::from_env()?;
    let outcome = sdk.restart_instance(&args.instance).await?;
    write_json(&outcome)?;
    Ok(0)
}

async fn run_health(args: TargetCommand) -> Result<i32, CliError> {
    let sdk = Skiff::from_env()?;
    let outcome = sdk.health_check_instance(&args.instance).await?;
    write_json(&outcome)?;
    Ok(i32::from(!outcome.healthy))
}

async fn run_list() -> Result<i32, CliError> {
    let sdk = Skiff::from_env()?;
    let instances = sdk.list_instances().await?;
    write_json(&instances)?;
    Ok(0)
}

async fn run_exec(args: ExecCommand) -> Result<i32, CliError> {
    if let Some(result) = fake_exec_from_env() {
        return result;
    }

    let (command, command_args) = split_command(&args.command)?;
    let mut params = ExecParams::new(&args.instance, command).args(command_args);
    if let Some(timeout_ms) = args.timeout_ms {
        params = params.timeout_ms(timeout_ms);
    }

    let sdk = Skiff::from_env()?;
    if args.stream {
        let (execution, mut stream) = sdk.execute_streaming(params).await?;
        let mut stdout = io::stdout();
        while let Some(event) = stream.next().await {
            let line = serde_json::to_string(&event)
                .map_err(|err| CliError::Render(err.to_string()))?;
            writeln!(stdout, "{line}").ok();
        }
        return execution.exit_code.ok_or(CliError::MissingExitCode);
    }

    let execution = sdk.execute(params).await?;
    if !execution.output.is_empty() {
        write!(io::stdout(), "{}", execution.output).ok();
    }
    if !execution.error.is_empty() {
        write!(io::stderr(), "{}", execution.error).ok();
    }
    execution.exit_code.ok_or(CliError::MissingExitCode)
}

/// Splits the trailing CLI words into the executable token and its
/// arguments.
fn split_command(words: &[String]) -> Result<(String, Vec<String>), CliError> {
    let Some((command, rest)) = words.split_first() else {
        return Err(CliError::MissingCommand);
    };
    Ok((command.clone(), rest.to_vec()))
}

/// Hermetic test hook: short-circuits exec with a canned result.
fn fake_exec_from_env() -> Option<Result<i32, CliError>> {
    let mode = env::var("SKIFF_FAKE_MODE").ok()?;
    match mode.as_str() {
        "exec-exit-0" => {
            writeln!(io::stdout(), "fake-stdout").ok();
            writeln!(io::stderr(), "fake-stderr").ok();
            Some(Ok(0))
        }
        "exec-exit-7" => {
            writeln!(io::stdout(), "fake-stdout").ok();
            writeln!(io::stderr(), "fake-stderr").ok();
            Some(Ok(7))
        }
        "missing-exit" => Some(Err(CliError::MissingExitCode)),
        _ => None,
    }
}

fn write_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Render(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();
}
