//! Filesystem and operation policy for tasks and generated scripts.
//!
//! Two rules, both pure:
//!
//! - **Denylist**: destructive operation names (`rm`, `os.remove`, ...)
//!   matched case-insensitively as whole words anywhere in the text.
//! - **Allowed root**: every path-like fragment must stay inside a single
//!   root directory after lexical normalization (`..` resolved, separators
//!   unified). The filesystem is never consulted.
//!
//! Both `/` and `\` separators are understood on every host, so a task
//! written with `/data/in.csv` is checked against a root of `C:\data`.

use std::path::PathBuf;

use anyhow::Context;
use regex::Regex;

use crate::error::PipelineError;

/// Characters that delimit path fragments inside a token:
/// `open(r"C:\data\a.csv","w")` yields `C:\data\a.csv` among others,
/// and `echo x>/etc/hosts` or `cat a|/bin/sh` expose their targets.
const FRAGMENT_DELIMITERS: &[char] = &[
    '"', '\'', '`', '(', ')', '[', ']', '{', '}', ',', ';', '=', '<', '>', '|', '&',
];

/// Discard sink accepted outside the root (`2>/dev/null`). Matched exactly.
const NULL_DEVICE: &str = "/dev/null";

/// A path reduced to its drive (lowercased, if any) and normal components.
#[derive(Debug, Clone, PartialEq)]
struct NormalizedPath {
    drive: Option<char>,
    components: Vec<String>,
}

pub struct PathGuard {
    root: NormalizedPath,
    root_display: String,
    denylist: Option<Regex>,
}

impl PathGuard {
    pub fn new(allowed_root: &str, denied_operations: &[String]) -> anyhow::Result<Self> {
        let root = normalize(allowed_root)
            .with_context(|| format!("Allowed root '{allowed_root}' is not an absolute path"))?;

        let denylist = if denied_operations.is_empty() {
            None
        } else {
            let alternatives = denied_operations
                .iter()
                .map(|op| regex::escape(op))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!(r"(?i)\b(?:{alternatives})\b"))?)
        };

        Ok(Self {
            root,
            root_display: allowed_root.to_string(),
            denylist,
        })
    }

    /// The root as configured, in host syntax.
    pub fn root(&self) -> &str {
        &self.root_display
    }

    /// False if `text` mentions a denylisted operation.
    pub fn is_safe(&self, text: &str) -> bool {
        match &self.denylist {
            Some(re) => !re.is_match(text),
            None => true,
        }
    }

    /// False if any path-like fragment of `token` escapes the allowed root.
    /// Tokens without path-like fragments are always allowed.
    pub fn is_path_allowed(&self, token: &str) -> bool {
        path_fragments(token)
            .all(|fragment| fragment == NULL_DEVICE || self.is_under_root(fragment))
    }

    /// Applies both rules to a whole task or script.
    pub fn check(&self, text: &str) -> Result<(), PipelineError> {
        if !self.is_safe(text) {
            return Err(PipelineError::AccessDenied);
        }
        if text.split_whitespace().all(|token| self.is_path_allowed(token)) {
            Ok(())
        } else {
            Err(PipelineError::AccessDenied)
        }
    }

    /// Maps a path under the root onto the host root directory,
    /// e.g. `/data/a/b.txt` with root `C:\data` becomes `C:\data\a\b.txt`.
    /// Returns `None` for anything not path-like or outside the root.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        if !is_path_like(path) || !self.is_under_root(path) {
            return None;
        }
        let normalized = normalize(path)?;
        let mut resolved = PathBuf::from(&self.root_display);
        for component in &normalized.components[self.root.components.len()..] {
            resolved.push(component);
        }
        Some(resolved)
    }

    fn is_under_root(&self, fragment: &str) -> bool {
        let Some(path) = normalize(fragment) else {
            return false;
        };

        let case_insensitive = path.drive.is_some() || self.root.drive.is_some();
        match (path.drive, self.root.drive) {
            (Some(a), Some(b)) if a != b => return false,
            (Some(_), None) => return false,
            _ => {}
        }

        if path.components.len() < self.root.components.len() {
            return false;
        }
        path.components
            .iter()
            .zip(&self.root.components)
            .all(|(a, b)| {
                if case_insensitive {
                    a.eq_ignore_ascii_case(b)
                } else {
                    a == b
                }
            })
    }
}

/// True if `s` starts with a separator or a drive root like `C:\`.
pub fn is_path_like(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('\\') || has_drive_root(s)
}

fn has_drive_root(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Path-like fragments of a single whitespace-delimited token.
fn path_fragments(token: &str) -> impl Iterator<Item = &str> {
    token
        .split(FRAGMENT_DELIMITERS)
        .filter(|fragment| is_path_like(fragment))
}

fn normalize(path: &str) -> Option<NormalizedPath> {
    if !is_path_like(path) {
        return None;
    }

    let (drive, rest) = if has_drive_root(path) {
        (Some(path.as_bytes()[0].to_ascii_lowercase() as char), &path[2..])
    } else {
        (None, path)
    };

    let mut components: Vec<String> = Vec::new();
    for part in rest.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other.to_string()),
        }
    }

    Some(NormalizedPath { drive, components })
}
