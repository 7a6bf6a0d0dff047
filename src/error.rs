//! Failure taxonomy for the task pipeline.
//!
//! Every error that can leave `Pipeline::run` or `FileReader::read` is one
//! of these variants. Script failures are not errors: the executor reports
//! them as `ExecutionResult` data.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A path outside the allowed root, or a denylisted operation.
    #[error("Access Denied")]
    AccessDenied,

    #[error("Task description is empty")]
    EmptyTask,

    /// The generator replied with JSON that does not describe an instruction.
    #[error("Invalid task format received from LLM: {0}")]
    InvalidInstruction(String),

    /// The generator replied with something that is not JSON at all.
    #[error("LLM returned an invalid JSON response: {0}")]
    MalformedResponse(String),

    #[error("LLM API error{}: {}", status_suffix(.status), .detail)]
    GenerationService { status: Option<u16>, detail: String },

    #[error("Empty command received")]
    EmptyCommand,

    #[error("File not found.")]
    NotFound,

    #[error("{0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl PipelineError {
    /// Stable machine-readable kind, used in the CLI's failure output.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::AccessDenied => "access-denied",
            PipelineError::EmptyTask | PipelineError::EmptyCommand => "invalid-request",
            PipelineError::InvalidInstruction(_) => "invalid-instruction",
            PipelineError::MalformedResponse(_) => "malformed-response",
            PipelineError::GenerationService { .. } => "generation-service-error",
            PipelineError::NotFound => "not-found",
            PipelineError::Internal(_) => "internal-error",
        }
    }

    /// HTTP-equivalent status code for the failure.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::AccessDenied => 403,
            PipelineError::EmptyTask
            | PipelineError::EmptyCommand
            | PipelineError::InvalidInstruction(_) => 400,
            PipelineError::NotFound => 404,
            PipelineError::GenerationService { .. } => 502,
            PipelineError::MalformedResponse(_) | PipelineError::Internal(_) => 500,
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            detail: self.to_string(),
            status: self.status_code(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Internal(e.to_string())
    }
}

/// Caller-facing shape of a failed request.
#[derive(Debug, Serialize, PartialEq)]
pub struct Failure {
    pub kind: &'static str,
    pub detail: String,
    pub status: u16,
}
