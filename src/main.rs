mod agent;
mod config;
mod error;
mod llm;
mod sandbox;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::agent::{FileReader, Pipeline, TaskResponse};
use crate::config::Config;
use crate::error::PipelineError;

const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

fn print_help() {
    println!(
        "\
dataworks-agent v{}

Turns a natural-language automation task into a script, checks it against
the filesystem policy and runs it in a temporary sandbox file.

USAGE:
    dataworks-agent [OPTIONS] run <TASK>...
    dataworks-agent [OPTIONS] read <PATH>

COMMANDS:
    run <TASK>...    Generate and execute a script for TASK
    read <PATH>      Print a file under the allowed root

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG          Log level filter for tracing
                      (e.g. debug, dataworks_agent=debug,warn)
    AIPROXY_TOKEN     API key for the code generation endpoint
                      (conventional name used by the sample config)

OUTPUT:
    JSON on stdout. Exit status 0 on success, 1 on failure with
    {{\"kind\", \"detail\", \"status\"}}. Logs go to stderr.

EXAMPLES:
    dataworks-agent run Count the Wednesdays in /data/dates.txt
    dataworks-agent -c /etc/dataworks/agent.toml read /data/report.txt
    RUST_LOG=debug dataworks-agent run \"List the files in /data\"",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(String),
    Read(String),
}

#[derive(Debug, PartialEq)]
enum Cli {
    Help,
    Version,
    Execute { config_path: String, command: Command },
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Cli::Help),
            "--version" | "-V" => return Ok(Cli::Version),
            "--config" | "-c" if positional.is_empty() => match args.next() {
                Some(path) => config_path = path,
                None => bail!("{arg} requires a path"),
            },
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("run") => {
            let task = positional.collect::<Vec<_>>().join(" ");
            if task.trim().is_empty() {
                bail!("run requires a task description");
            }
            Command::Run(task)
        }
        Some("read") => match (positional.next(), positional.next()) {
            (Some(path), None) => Command::Read(path),
            _ => bail!("read requires exactly one path"),
        },
        Some(other) => bail!("Unknown command: {other}\nSee --help for usage."),
        None => bail!("Missing command\nSee --help for usage."),
    };

    Ok(Cli::Execute {
        config_path,
        command,
    })
}

fn render<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(value).map_err(|e| PipelineError::Internal(e.to_string()))
}

async fn run_task(
    pipeline: &Pipeline,
    task: &str,
    timeout_secs: Option<u64>,
) -> Result<TaskResponse, PipelineError> {
    match timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), pipeline.run(task))
            .await
            .map_err(|_| PipelineError::Internal(format!("Task timed out after {secs}s")))?,
        None => pipeline.run(task).await,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let (config_path, command) = match parse_args(std::env::args().skip(1))? {
        Cli::Help => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        Cli::Version => {
            println!("dataworks-agent v{}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        Cli::Execute {
            config_path,
            command,
        } => (config_path, command),
    };

    // Initialize logging (RUST_LOG=debug for debug mode); stdout is for results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dataworks_agent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("LLM: {} ({})", config.llm.model, config.llm.base_url);
    info!("Allowed root: {}", config.sandbox.allowed_root);
    info!(
        "Dependency installation: {}",
        if config.sandbox.install_dependencies { "enabled" } else { "disabled" }
    );

    let pipeline = Pipeline::from_config(&config)?;

    let outcome = match command {
        Command::Run(task) => run_task(&pipeline, &task, config.pipeline.timeout_secs)
            .await
            .and_then(|response| render(&response)),
        Command::Read(path) => FileReader::new(pipeline.guard())
            .read(&path)
            .await
            .and_then(|file| render(&file)),
    };

    match outcome {
        Ok(json) => {
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Request failed: {e}");
            println!("{}", serde_json::to_string_pretty(&e.to_failure())?);
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_run_joins_task_words() {
        let cli = parse_args(args(&["run", "Count", "lines", "in", "/data/a.txt"])).unwrap();
        assert_eq!(
            cli,
            Cli::Execute {
                config_path: DEFAULT_CONFIG_PATH.to_string(),
                command: Command::Run("Count lines in /data/a.txt".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_config_option() {
        let cli = parse_args(args(&["-c", "/etc/agent.toml", "read", "/data/x"])).unwrap();
        assert_eq!(
            cli,
            Cli::Execute {
                config_path: "/etc/agent.toml".to_string(),
                command: Command::Read("/data/x".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_config_flag_inside_task_is_task_text() {
        let cli = parse_args(args(&["run", "explain", "-c", "flag"])).unwrap();
        assert_eq!(
            cli,
            Cli::Execute {
                config_path: DEFAULT_CONFIG_PATH.to_string(),
                command: Command::Run("explain -c flag".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_help_and_version() {
        assert_eq!(parse_args(args(&["--help"])).unwrap(), Cli::Help);
        assert_eq!(parse_args(args(&["run", "-h"])).unwrap(), Cli::Help);
        assert_eq!(parse_args(args(&["-V"])).unwrap(), Cli::Version);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["run"])).is_err());
        assert!(parse_args(args(&["read"])).is_err());
        assert!(parse_args(args(&["read", "/data/a", "/data/b"])).is_err());
        assert!(parse_args(args(&["delete", "/data/a"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
    }
}
