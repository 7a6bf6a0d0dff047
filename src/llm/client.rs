//! `CodeGenerator` trait: abstraction over code generation backends.
//!
//! The pipeline only needs "task text in, instruction out", so the
//! production chat-completions client and test fakes both implement it.

use async_trait::async_trait;

use super::GeneratedInstruction;
use crate::error::PipelineError;

/// Turns a task description into an executable instruction.
///
/// Implementations make a single attempt per call. Failures surface as
/// `GenerationService`, `MalformedResponse` or `InvalidInstruction`.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, task: &str) -> Result<GeneratedInstruction, PipelineError>;

    /// Human-readable description of the backend and model.
    ///
    /// Used in log output, e.g. `"gpt-4o-mini @ https://api.openai.com"`.
    fn description(&self) -> String;
}
