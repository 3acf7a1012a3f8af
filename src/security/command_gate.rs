use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::exec::error::{ExecError, ExecErrorCode, ExecResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlocklistFile {
    #[serde(default)]
    blocked_commands: Vec<String>,
}

/// Immutable blocklist snapshot. Matching looks only at the program token:
/// the first whitespace-delimited word of the command line, compared
/// case-sensitively either whole or by its final path component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedCommandSet {
    names: BTreeSet<String>,
}

impl BlockedCommandSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .filter_map(|name| normalize_name(name.as_ref()))
                .collect(),
        }
    }

    pub fn matching_entry(&self, command: &str) -> Option<&str> {
        let program = leading_program_token(command)?;
        if let Some(hit) = self.names.get(program) {
            return Some(hit.as_str());
        }
        let base = Path::new(program).file_name()?.to_str()?;
        self.names.get(base).map(String::as_str)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

pub fn leading_program_token(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}

fn normalize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Process-wide command blocklist backed by a JSON store.
///
/// Readers clone an `Arc` snapshot; writers are serialized, persist the next
/// set with an atomic file replace, and only then publish it. The in-memory
/// set is therefore always the last successfully persisted one.
pub struct CommandGate {
    store_path: PathBuf,
    current: RwLock<Arc<BlockedCommandSet>>,
    writer: Mutex<()>,
}

impl CommandGate {
    pub async fn load(store_path: PathBuf, defaults: &[String]) -> Result<Self> {
        let set = if tokio::fs::try_exists(&store_path).await.unwrap_or(false) {
            let text = tokio::fs::read_to_string(&store_path)
                .await
                .with_context(|| format!("failed reading blocklist {}", store_path.display()))?;
            let file: BlocklistFile = serde_json::from_str(&text)
                .with_context(|| format!("failed parsing blocklist {}", store_path.display()))?;
            BlockedCommandSet::from_names(file.blocked_commands)
        } else {
            let seeded = BlockedCommandSet::from_names(defaults);
            persist_blocklist(&store_path, &seeded)
                .await
                .with_context(|| format!("failed seeding blocklist {}", store_path.display()))?;
            seeded
        };
        info!(
            "loaded {} blocked command(s) from {}",
            set.len(),
            store_path.display()
        );
        Ok(Self {
            store_path,
            current: RwLock::new(Arc::new(set)),
            writer: Mutex::new(()),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub async fn snapshot(&self) -> Arc<BlockedCommandSet> {
        self.current.read().await.clone()
    }

    #[cfg(test)]
    pub async fn is_blocked(&self, command: &str) -> bool {
        self.snapshot().await.matching_entry(command).is_some()
    }

    pub async fn list_blocked(&self) -> Vec<String> {
        self.snapshot().await.names()
    }

    /// Runs the gate check and `spawn` under one read guard, so a concurrent
    /// block/unblock is either fully visible to this spawn or not at all.
    pub async fn admit<T, F>(&self, command: &str, spawn: F) -> ExecResult<T>
    where
        F: FnOnce() -> ExecResult<T>,
    {
        let guard = self.current.read().await;
        if let Some(entry) = guard.matching_entry(command) {
            warn!("rejected blocked command `{entry}`");
            return Err(ExecError::new(
                ExecErrorCode::PolicyViolation,
                format!("command `{entry}` is blocked by policy"),
            ));
        }
        let spawned = spawn();
        drop(guard);
        spawned
    }

    /// Idempotent add. Returns true when the name was not blocked before.
    pub async fn block_command(&self, name: &str) -> ExecResult<bool> {
        let name = require_name(name)?;
        self.mutate(|names| names.insert(name.clone())).await
    }

    /// Returns true when the name was blocked before the call.
    pub async fn unblock_command(&self, name: &str) -> ExecResult<bool> {
        let name = require_name(name)?;
        self.mutate(|names| names.remove(&name)).await
    }

    async fn mutate<F>(&self, apply: F) -> ExecResult<bool>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _writer = self.writer.lock().await;
        let mut next = (**self.current.read().await).clone();
        if !apply(&mut next.names) {
            return Ok(false);
        }
        persist_blocklist(&self.store_path, &next)
            .await
            .map_err(|err| {
                ExecError::new(
                    ExecErrorCode::Internal,
                    format!("failed persisting blocklist: {err:#}"),
                )
            })?;
        *self.current.write().await = Arc::new(next);
        info!("blocklist updated ({} entries)", self.current.read().await.len());
        Ok(true)
    }
}

fn require_name(raw: &str) -> ExecResult<String> {
    normalize_name(raw).ok_or_else(|| {
        ExecError::new(
            ExecErrorCode::InvalidArgs,
            "command name must be a non-empty string",
        )
    })
}

async fn persist_blocklist(path: &Path, set: &BlockedCommandSet) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(&BlocklistFile {
        blocked_commands: set.names(),
    })?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("blocklist.json");
    let tmp_path = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        crate::exec::now_ms()
    ));
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed creating {}", tmp_path.display()))?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err).with_context(|| format!("failed replacing {}", path.display()));
    }
    Ok(())
}
