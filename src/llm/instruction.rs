//! The generator's output contract and its parser.
//!
//! The model is asked for a single JSON object:
//!
//! ```json
//! {"command": "<script>", "type": "python" | "shell"}
//! ```
//!
//! Models often wrap it in a ```` ```json ```` fence anyway, so the parser
//! strips one before decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// How an instruction is run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionKind {
    /// Host command shell (`sh`, `cmd.exe`)
    #[serde(rename = "shell")]
    Shell,
    /// Python script
    #[serde(rename = "python")]
    Interpreted,
}

impl ExecutionKind {
    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(ExecutionKind::Shell),
            "python" => Some(ExecutionKind::Interpreted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedInstruction {
    pub command: String,
    #[serde(rename = "type")]
    pub kind: ExecutionKind,
}

/// Parses a raw model reply into an instruction.
///
/// - not JSON → `MalformedResponse`
/// - JSON without a string `command`, without `type`, or with an unknown
///   `type` → `InvalidInstruction`
///
/// Path separators are not touched here; see [`normalize_separators`].
pub fn parse_instruction(reply: &str) -> Result<GeneratedInstruction, PipelineError> {
    let body = strip_code_fence(reply);

    let value: Value =
        serde_json::from_str(body).map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;

    let Value::Object(map) = value else {
        return Err(PipelineError::InvalidInstruction(
            "expected a JSON object".to_string(),
        ));
    };

    let command = match map.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(PipelineError::InvalidInstruction(
                "`command` must be a string".to_string(),
            ))
        }
        None => {
            return Err(PipelineError::InvalidInstruction(
                "missing `command`".to_string(),
            ))
        }
    };

    let kind = match map.get("type") {
        Some(Value::String(s)) => ExecutionKind::from_wire(s).ok_or_else(|| {
            PipelineError::InvalidInstruction(format!(
                "unsupported type '{s}' (expected 'python' or 'shell')"
            ))
        })?,
        Some(other) => {
            return Err(PipelineError::InvalidInstruction(format!(
                "unsupported type {other} (expected 'python' or 'shell')"
            )))
        }
        None => {
            return Err(PipelineError::InvalidInstruction(
                "missing `type`".to_string(),
            ))
        }
    };

    Ok(GeneratedInstruction { command, kind })
}

/// Removes a leading ```` ```json ```` (or bare ```` ``` ````) fence and a
/// trailing ```` ``` ```` fence, if present.
pub fn strip_code_fence(reply: &str) -> &str {
    let mut body = reply.trim();
    if let Some(rest) = body.strip_prefix("```json") {
        body = rest.trim();
    } else if let Some(rest) = body.strip_prefix("```") {
        body = rest.trim();
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest.trim();
    }
    body
}

/// Rewrites `/`-style paths to the host's native separators.
///
/// On Windows a command that starts with `/` has every `/` turned into `\`.
/// Elsewhere `/` is already native and the command is returned as is.
pub fn normalize_separators(command: &str) -> String {
    if cfg!(windows) {
        to_windows_separators(command)
    } else {
        command.to_string()
    }
}

fn to_windows_separators(command: &str) -> String {
    if command.starts_with('/') {
        command.replace('/', "\\")
    } else {
        command.to_string()
    }
}
