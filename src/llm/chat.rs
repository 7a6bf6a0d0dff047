//! OpenAI-compatible chat completions backend.
//!
//! Calls `POST {base_url}/v1/chat/completions` with Bearer token
//! authentication. Works against OpenAI itself and against proxies
//! exposing the same API (AI Proxy, LiteLLM, vLLM, ...).

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::CodeGenerator;
use super::instruction::{normalize_separators, parse_instruction, GeneratedInstruction};
use crate::config::LlmConfig;
use crate::error::PipelineError;

// ── Chat completions API types ──────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ── ChatCompletionsClient ───────────────────────────────

/// Code generator backed by a chat completions endpoint.
pub struct ChatCompletionsClient {
    client: Client,
    config: LlmConfig,
    endpoint: String,
    system_prompt: String,
}

impl ChatCompletionsClient {
    /// Creates a client whose prompt confines generated scripts to `allowed_root`.
    pub fn new(config: LlmConfig, allowed_root: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()
            .context("Failed to build HTTP client for the LLM endpoint")?;
        Ok(Self::with_http_client(client, config, allowed_root))
    }

    fn with_http_client(client: Client, config: LlmConfig, allowed_root: &str) -> Self {
        let endpoint = format!(
            "{}/v1/chat/completions",
            config.base_url.trim_end_matches('/')
        );
        Self {
            client,
            config,
            endpoint,
            system_prompt: system_prompt(allowed_root),
        }
    }

    async fn complete(&self, task: &str) -> Result<String, PipelineError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens_per_request,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: task.to_string(),
                },
            ],
        };

        debug!("Calling {} ({})", self.endpoint, self.config.model);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::GenerationService {
                status: e.status().map(|s| s.as_u16()),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::GenerationService {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        let resp: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;

        if let Some(usage) = &resp.usage {
            info!(
                "LLM response: {} in / {} out tokens",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        resp.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::MalformedResponse("reply has no content".to_string()))
    }
}

#[async_trait]
impl CodeGenerator for ChatCompletionsClient {
    async fn generate(&self, task: &str) -> Result<GeneratedInstruction, PipelineError> {
        let reply = self.complete(task).await?;
        debug!("Generated reply: {reply}");

        let mut instruction = parse_instruction(&reply)?;
        instruction.command = normalize_separators(&instruction.command);
        Ok(instruction)
    }

    fn description(&self) -> String {
        format!("{} @ {}", self.config.model, self.config.base_url)
    }
}

/// Output contract given to the model.
fn system_prompt(allowed_root: &str) -> String {
    let shell = if cfg!(windows) { "Windows CMD" } else { "POSIX sh" };
    format!(
        "You are a DataWorks automation agent that turns a task into a single \
         fully executable Python script or {shell} command.\n\
         \n\
         Output format: return ONLY one JSON object, no prose, no markdown:\n\
         {{\"command\": \"<script or shell command>\", \"type\": \"<python or shell>\"}}\n\
         \n\
         Rules:\n\
         - The code must be syntactically valid and runnable as is.\n\
         - Python scripts must use ACTUAL newlines between statements, never \
           the two characters \\n as a line separator. Use triple quotes for \
           multi-line strings and double quotes for strings and file paths.\n\
         - For shell, separate multiple commands with ;\n\
         - Read and write files only inside {allowed_root}. Never touch any \
           other location.\n\
         - Never delete files or directories.\n\
         - Parse dates from any format with dateutil.parser and handle invalid \
           values instead of failing.\n\
         - Print the final answer to standard output."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ExecutionKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn llm_config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: "test-key".to_string(),
            max_tokens_per_request: 1024,
            tls_verify: true,
        }
    }

    fn test_client(base_url: &str) -> ChatCompletionsClient {
        let http = Client::builder().no_proxy().build().unwrap();
        ChatCompletionsClient::with_http_client(http, llm_config(base_url), "/data")
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serves exactly one HTTP response and returns the raw request it got.
    async fn serve_once(status_line: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{addr}"), handle)
    }

    fn completion_body(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30}
        })
        .to_string()
    }

    // ── Construction ─────────────────────────────────────

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = test_client("https://aiproxy.example.com/openai/");
        assert_eq!(
            client.endpoint,
            "https://aiproxy.example.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn test_new_builds_client_with_tls_verification_disabled() {
        let mut config = llm_config("https://aiproxy.example.com/openai");
        config.tls_verify = false;
        let client = ChatCompletionsClient::new(config, "/data").unwrap();
        assert_eq!(
            client.endpoint,
            "https://aiproxy.example.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn test_description() {
        let client = test_client("https://api.openai.com");
        assert_eq!(client.description(), "gpt-4o-mini @ https://api.openai.com");
    }

    #[test]
    fn test_system_prompt_mentions_contract_and_root() {
        let prompt = system_prompt("/srv/data");
        assert!(prompt.contains("/srv/data"));
        assert!(prompt.contains("\"command\""));
        assert!(prompt.contains("\"type\""));
        assert!(prompt.contains("separate multiple commands with ;"));
    }

    // ── Wire format ──────────────────────────────────────

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Count lines".to_string(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 1024);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Count lines");
    }

    #[test]
    fn test_response_parsing_without_usage() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": "{}"}}]}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.usage.is_none());
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("{}"));
    }

    #[test]
    fn test_response_parsing_partial_usage() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{}"}}],
            "usage": {"total_tokens": 42}
        }"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.completion_tokens, 0);
    }

    #[test]
    fn test_response_parsing_null_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.choices[0].message.content.is_none());
    }

    // ── Against a local server ───────────────────────────

    #[tokio::test]
    async fn test_generate_parses_fenced_reply() {
        let reply = "```json\n{\"command\": \"print(1)\", \"type\": \"python\"}\n```";
        let (base_url, server) = serve_once("200 OK", completion_body(reply)).await;
        let client = test_client(&base_url);

        let instruction = client.generate("print one").await.unwrap();
        assert_eq!(instruction.command, "print(1)");
        assert_eq!(instruction.kind, ExecutionKind::Interpreted);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_lowercase().contains("authorization: bearer test-key"));
        assert!(request.contains("\"role\":\"system\""));
        assert!(request.contains("print one"));
    }

    #[tokio::test]
    async fn test_generate_surfaces_upstream_status() {
        let (base_url, server) =
            serve_once("401 Unauthorized", r#"{"error": "bad key"}"#.to_string()).await;
        let client = test_client(&base_url);

        match client.generate("anything").await {
            Err(PipelineError::GenerationService { status, detail }) => {
                assert_eq!(status, Some(401));
                assert!(detail.contains("bad key"));
            }
            other => panic!("expected GenerationService, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_rejects_non_json_body() {
        let (base_url, server) = serve_once("200 OK", "<html>proxy</html>".to_string()).await;
        let client = test_client(&base_url);

        assert!(matches!(
            client.generate("anything").await,
            Err(PipelineError::MalformedResponse(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_choices() {
        let (base_url, server) = serve_once("200 OK", r#"{"choices": []}"#.to_string()).await;
        let client = test_client(&base_url);

        assert!(matches!(
            client.generate("anything").await,
            Err(PipelineError::MalformedResponse(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_rejects_unknown_kind() {
        let reply = r#"{"command": "x", "type": "image_url"}"#;
        let (base_url, server) = serve_once("200 OK", completion_body(reply)).await;
        let client = test_client(&base_url);

        assert!(matches!(
            client.generate("anything").await,
            Err(PipelineError::InvalidInstruction(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = test_client(&format!("http://{addr}"));

        assert!(matches!(
            client.generate("anything").await,
            Err(PipelineError::GenerationService { status: None, .. })
        ));
    }
}
