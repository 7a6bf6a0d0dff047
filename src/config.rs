use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API root, e.g. "https://api.openai.com"
    pub base_url: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    /// Set to false for proxies with self-signed certs
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// The only directory generated scripts may touch
    pub allowed_root: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Program and leading args; the script path is appended
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
    /// Program and leading args; the package name is appended
    #[serde(default = "default_installer")]
    pub installer: Vec<String>,
    #[serde(default = "default_baseline_modules")]
    pub baseline_modules: Vec<String>,
    #[serde(default = "default_install_dependencies")]
    pub install_dependencies: bool,
    /// Where temporary scripts are written (system temp dir if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_denied_operations")]
    pub denied_operations: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    /// Upper bound for one `run`, enforced by the caller
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            denied_operations: default_denied_operations(),
        }
    }
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_tls_verify() -> bool {
    true
}

fn default_interpreter() -> String {
    if cfg!(windows) { "python" } else { "python3" }.to_string()
}

fn default_shell() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd.exe".to_string(), "/c".to_string()]
    } else {
        vec!["sh".to_string()]
    }
}

fn default_installer() -> Vec<String> {
    vec!["pip".to_string(), "install".to_string()]
}

fn default_baseline_modules() -> Vec<String> {
    vec!["dateutil".to_string(), "numpy".to_string()]
}

fn default_install_dependencies() -> bool {
    true
}

pub fn default_denied_operations() -> Vec<String> {
    [
        "rm",
        "del",
        "erase",
        "shutil.rmtree",
        "os.remove",
        "os.rmdir",
        "os.removedirs",
        "Path.unlink",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {path}"))?;
        // Expand environment variables like ${AIPROXY_TOKEN}
        let expanded = shellexpand::env(&content)?;
        Self::from_toml_str(&expanded)
    }

    /// Parses and validates an already-expanded TOML document.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.llm.base_url)
            .with_context(|| format!("Invalid llm.base_url '{}'", self.llm.base_url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("llm.base_url must be http or https (got {}://)", url.scheme());
        }
        if self.llm.api_key.trim().is_empty() {
            bail!("llm.api_key is empty. Please set it (e.g. api_key = \"${{AIPROXY_TOKEN}}\")");
        }
        if !crate::sandbox::guard::is_path_like(&self.sandbox.allowed_root) {
            bail!(
                "sandbox.allowed_root must be an absolute path (got '{}')",
                self.sandbox.allowed_root
            );
        }
        if self.sandbox.shell.is_empty() {
            bail!("sandbox.shell must name a program");
        }
        if self.sandbox.installer.is_empty() {
            bail!("sandbox.installer must name a program");
        }
        Ok(())
    }
}
