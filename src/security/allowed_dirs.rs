use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};

/// Filesystem-boundary contract consumed by the session engine: turn a
/// caller-supplied working directory into an absolute, allowed directory.
#[async_trait]
pub trait WorkingDirectoryPolicy: Send + Sync {
    async fn resolve_working_directory(&self, requested: Option<&str>) -> ExecResult<PathBuf>;

    fn allowed_directories(&self) -> Vec<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct DirectoryAllowList {
    roots: Vec<PathBuf>,
}

impl DirectoryAllowList {
    /// Creates missing roots and canonicalizes them. The first root is the
    /// default working directory.
    pub fn new(roots: &[PathBuf]) -> Result<Self> {
        let mut canonical = Vec::with_capacity(roots.len());
        for root in roots {
            let expanded = expand_home(root);
            std::fs::create_dir_all(&expanded)
                .with_context(|| format!("failed creating allowed directory {}", expanded.display()))?;
            let resolved = std::fs::canonicalize(&expanded).with_context(|| {
                format!("failed resolving allowed directory {}", expanded.display())
            })?;
            if !canonical.contains(&resolved) {
                canonical.push(resolved);
            }
        }
        if canonical.is_empty() {
            anyhow::bail!("at least one allowed directory is required");
        }
        Ok(Self { roots: canonical })
    }

    fn default_root(&self) -> &Path {
        &self.roots[0]
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

#[async_trait]
impl WorkingDirectoryPolicy for DirectoryAllowList {
    async fn resolve_working_directory(&self, requested: Option<&str>) -> ExecResult<PathBuf> {
        let Some(raw) = requested.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(self.default_root().to_path_buf());
        };
        let expanded = expand_home(Path::new(raw));
        let candidate = if expanded.is_absolute() {
            expanded
        } else {
            self.default_root().join(expanded)
        };

        let resolved = tokio::fs::canonicalize(&candidate).await.map_err(|err| {
            ExecError::new(
                ExecErrorCode::PathNotAllowed,
                format!("working directory `{raw}` cannot be resolved: {err}"),
            )
        })?;
        if !self.is_allowed(&resolved) {
            return Err(outside_allow_list(raw));
        }
        if !resolved.is_dir() {
            return Err(ExecError::new(
                ExecErrorCode::PathNotAllowed,
                format!("working directory `{raw}` is not a directory"),
            ));
        }
        Ok(resolved)
    }

    fn allowed_directories(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}

fn outside_allow_list(raw: &str) -> ExecError {
    ExecError::new(
        ExecErrorCode::PathNotAllowed,
        format!("working directory `{raw}` is outside the allowed directories"),
    )
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
