//! Execution sandbox for generated scripts.
//!
//! Each execution writes the script to its own uniquely named temporary
//! file, runs it under the configured shell or interpreter, and removes
//! the file before returning. The isolation model is layered:
//!
//! 1. Policy check (`guard`): denylisted operations and paths outside
//!    the allowed root never reach this module
//! 2. Private temp file: one per execution, never shared
//! 3. Child process: stdin closed, killed if the caller gives up
//!
//! `SandboxExecutor::execute` never fails: every problem (missing
//! interpreter, I/O error, non-zero exit) comes back as an error result.

pub mod deps;
pub mod guard;

use std::io::Write;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::PipelineError;
use crate::llm::{ExecutionKind, GeneratedInstruction};

pub use deps::{DependencyResolver, NoopResolver, PipResolver};
pub use guard::PathGuard;

/// Extension the host shell accepts for script files.
#[cfg(windows)]
const SHELL_SUFFIX: &str = ".bat";
#[cfg(not(windows))]
const SHELL_SUFFIX: &str = ".sh";

const PYTHON_SUFFIX: &str = ".py";

const TEMP_PREFIX: &str = "dataworks-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Outcome of one script execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: output.into(),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

pub struct SandboxExecutor {
    interpreter: String,
    shell: Vec<String>,
    temp_dir: Option<PathBuf>,
    resolver: Arc<dyn DependencyResolver>,
}

impl SandboxExecutor {
    pub fn new(config: &SandboxConfig, resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            shell: config.shell.clone(),
            temp_dir: config.temp_dir.clone(),
            resolver,
        }
    }

    /// Runs an instruction and reports its outcome.
    pub async fn execute(&self, instruction: &GeneratedInstruction) -> ExecutionResult {
        match self.try_execute(instruction).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Execution failed: {e}");
                ExecutionResult::error(e.to_string())
            }
        }
    }

    async fn try_execute(
        &self,
        instruction: &GeneratedInstruction,
    ) -> Result<ExecutionResult, PipelineError> {
        if instruction.command.trim().is_empty() {
            return Err(PipelineError::EmptyCommand);
        }

        match instruction.kind {
            ExecutionKind::Shell => self.run_shell(&instruction.command).await,
            ExecutionKind::Interpreted => self.run_python(&instruction.command).await,
        }
    }

    async fn run_shell(&self, command: &str) -> Result<ExecutionResult, PipelineError> {
        let (program, args) = self
            .shell
            .split_first()
            .ok_or_else(|| PipelineError::Internal("No shell configured".to_string()))?;

        let script = self.write_script(&shell_script(command), SHELL_SUFFIX)?;
        info!("Running shell script {}", script.display());

        let output = spawn(Command::new(program).args(args).arg(&*script)).await;
        script.close()?;
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(ExecutionResult::success(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let error = if stderr.is_empty() {
                format!("Script exited with {}", output.status)
            } else {
                stderr
            };
            Ok(ExecutionResult {
                status: ExecutionStatus::Error,
                output: stdout,
                error: Some(error),
            })
        }
    }

    async fn run_python(&self, source: &str) -> Result<ExecutionResult, PipelineError> {
        let script = self.write_script(source, PYTHON_SUFFIX)?;

        self.resolver.ensure_dependencies(source).await;

        info!("Running Python script {}", script.display());
        let output = spawn(Command::new(&self.interpreter).arg(&*script)).await;
        script.close()?;
        let output = output?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(ExecutionResult::success(stdout.trim()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(ExecutionResult::error(stderr.trim()))
        }
    }

    /// Writes `content` to a fresh temp file and closes the handle.
    /// The returned path deletes the file when dropped.
    fn write_script(&self, content: &str, suffix: &str) -> std::io::Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_PREFIX).suffix(suffix);
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(content.as_bytes())?;
        file.flush()?;
        debug!("Wrote {} bytes to {}", content.len(), file.path().display());
        Ok(file.into_temp_path())
    }
}

async fn spawn(command: &mut Command) -> std::io::Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
}

/// `a; b ;c` becomes one command per line.
pub fn shell_script(command: &str) -> String {
    command
        .split(';')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}
