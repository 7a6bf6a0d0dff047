//! Best-effort installation of Python modules a generated script imports.
//!
//! Resolution never fails the pipeline: a module that is still missing
//! after installation surfaces later as a script error.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z0-9_]+)").expect("import pattern is valid")
});

/// Import names whose PyPI package is named differently.
const PACKAGE_ALIASES: &[(&str, &str)] = &[
    ("dateutil", "python-dateutil"),
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
];

/// Makes sure the modules a script needs are importable before it runs.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn ensure_dependencies(&self, source: &str);
}

/// Resolver that does nothing. Used when installation is disabled.
pub struct NoopResolver;

#[async_trait]
impl DependencyResolver for NoopResolver {
    async fn ensure_dependencies(&self, _source: &str) {}
}

/// Probes each module with the interpreter and installs missing ones
/// through the configured installer (`pip install` by default).
pub struct PipResolver {
    interpreter: String,
    installer: Vec<String>,
    baseline: Vec<String>,
}

impl PipResolver {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            installer: config.installer.clone(),
            baseline: config.baseline_modules.clone(),
        }
    }

    async fn is_importable(&self, module: &str) -> bool {
        let status = Command::new(&self.interpreter)
            .arg("-c")
            .arg(format!("import {module}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }

    async fn install(&self, module: &str) {
        let Some((program, args)) = self.installer.split_first() else {
            return;
        };
        let package = package_name(module);
        info!("Installing missing module: {module} (package {package})");

        let result = Command::new(program)
            .args(args)
            .arg(package)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => debug!("Installed {package}"),
            Ok(output) => warn!(
                "Installer exited with {} for {package}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Could not run installer for {package}: {e}"),
        }
    }
}

#[async_trait]
impl DependencyResolver for PipResolver {
    async fn ensure_dependencies(&self, source: &str) {
        let modules = required_modules(source, &self.baseline);
        debug!("Checking {} module(s): {:?}", modules.len(), modules);

        for module in &modules {
            if !self.is_importable(module).await {
                self.install(module).await;
            }
        }
    }
}

/// Top-level modules named by `import x` / `from x import y` lines,
/// together with the baseline set. Sorted and deduplicated.
pub fn required_modules(source: &str, baseline: &[String]) -> BTreeSet<String> {
    IMPORT_RE
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .chain(baseline.iter().cloned())
        .collect()
}

fn package_name(module: &str) -> &str {
    PACKAGE_ALIASES
        .iter()
        .find(|(import, _)| *import == module)
        .map(|(_, package)| *package)
        .unwrap_or(module)
}
