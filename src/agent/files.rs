/// Read-only access to files under the allowed root.
///
/// Paths are given in the caller's syntax (`/data/report.txt`) and mapped
/// onto the configured root (`C:\data\report.txt` on Windows). Anything
/// lexically outside the root is refused before the filesystem is touched;
/// a path that passes is canonicalized and re-checked, so a symlink under
/// the root cannot point the read elsewhere.
///
/// All I/O in this module uses `tokio::fs` to avoid blocking the async
/// runtime.
use std::io::ErrorKind;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::sandbox::PathGuard;

/// Body returned for a successful read.
#[derive(Debug, Serialize, PartialEq)]
pub struct FileContent {
    pub content: String,
}

pub struct FileReader {
    guard: Arc<PathGuard>,
}

impl FileReader {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self { guard }
    }

    /// Returns the UTF-8 contents of `path`.
    ///
    /// - outside the root, relative, traversing out, or a symlink leaving
    ///   the root → `AccessDenied`
    /// - missing → `NotFound`
    /// - any other I/O failure → `Internal`
    pub async fn read(&self, path: &str) -> Result<FileContent, PipelineError> {
        let Some(resolved) = self.guard.resolve(path) else {
            warn!("Read refused for {path}: outside {}", self.guard.root());
            return Err(PipelineError::AccessDenied);
        };

        let target = match tokio::fs::canonicalize(&resolved).await {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(PipelineError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let root = tokio::fs::canonicalize(self.guard.root()).await?;
        if !target.starts_with(&root) {
            warn!(
                "Read refused for {path}: resolves to {} outside {}",
                target.display(),
                root.display()
            );
            return Err(PipelineError::AccessDenied);
        }

        debug!("Reading {}", target.display());
        match tokio::fs::read_to_string(&target).await {
            Ok(content) => Ok(FileContent { content }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(PipelineError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}
