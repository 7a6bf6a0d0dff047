use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::llm::{ChatCompletionsClient, CodeGenerator};
use crate::sandbox::{
    DependencyResolver, ExecutionResult, NoopResolver, PathGuard, PipResolver, SandboxExecutor,
};

/// Where a task is in the pipeline. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Validated,
    Generated,
    ReValidated,
    Executed,
    Responded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Completed,
}

/// Envelope returned for every task that reached execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub status: ResponseStatus,
    pub results: Vec<ExecutionResult>,
}

impl TaskResponse {
    fn completed(result: ExecutionResult) -> Self {
        Self {
            status: ResponseStatus::Completed,
            results: vec![result],
        }
    }
}

/// The task pipeline: core of DataWorks Agent.
///
/// Validates a task, asks the generator for a script, validates the
/// script, runs it in the sandbox and wraps the outcome. Holds no
/// per-request state, so one instance can serve concurrent tasks.
pub struct Pipeline {
    guard: Arc<PathGuard>,
    generator: Arc<dyn CodeGenerator>,
    executor: SandboxExecutor,
}

impl Pipeline {
    pub fn new(
        guard: Arc<PathGuard>,
        generator: Arc<dyn CodeGenerator>,
        executor: SandboxExecutor,
    ) -> Self {
        Self {
            guard,
            generator,
            executor,
        }
    }

    /// Wires the production components from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let guard = Arc::new(PathGuard::new(
            &config.sandbox.allowed_root,
            &config.policy.denied_operations,
        )?);

        let generator: Arc<dyn CodeGenerator> = Arc::new(ChatCompletionsClient::new(
            config.llm.clone(),
            &config.sandbox.allowed_root,
        )?);

        let resolver: Arc<dyn DependencyResolver> = if config.sandbox.install_dependencies {
            Arc::new(PipResolver::new(&config.sandbox))
        } else {
            Arc::new(NoopResolver)
        };

        let executor = SandboxExecutor::new(&config.sandbox, resolver);
        Ok(Self::new(guard, generator, executor))
    }

    pub fn guard(&self) -> Arc<PathGuard> {
        Arc::clone(&self.guard)
    }

    /// Runs one task end to end.
    ///
    /// Rejections (`AccessDenied`, `EmptyTask`) happen before the generator
    /// is called; a rejected generated script is never executed. A script
    /// that fails still yields `Ok`, with an error result inside.
    pub async fn run(&self, task: &str) -> Result<TaskResponse, PipelineError> {
        let span = info_span!("task", id = %Uuid::new_v4());
        self.run_stages(task).instrument(span).await
    }

    async fn run_stages(&self, task: &str) -> Result<TaskResponse, PipelineError> {
        info!("Received task: {task}");
        debug!(stage = ?Stage::Received);

        if task.trim().is_empty() {
            return Err(PipelineError::EmptyTask);
        }
        if let Err(e) = self.guard.check(task) {
            warn!("Task rejected: outside {} or denied operation", self.guard.root());
            return Err(e);
        }
        debug!(stage = ?Stage::Validated);

        let instruction = match self.generator.generate(task).await {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!("Generation via {} failed: {e}", self.generator.description());
                return Err(e);
            }
        };
        debug!(stage = ?Stage::Generated, kind = ?instruction.kind);
        info!("Generated command: {}", instruction.command);

        if let Err(e) = self.guard.check(&instruction.command) {
            warn!("Generated command rejected: outside {} or denied operation", self.guard.root());
            return Err(e);
        }
        debug!(stage = ?Stage::ReValidated);

        let result = self.executor.execute(&instruction).await;
        debug!(stage = ?Stage::Executed, success = result.is_success());

        let response = TaskResponse::completed(result);
        debug!(stage = ?Stage::Responded);
        Ok(response)
    }
}
