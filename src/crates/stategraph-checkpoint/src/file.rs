//! Durable checkpoint backend on the local filesystem
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/
//! └── <thread>/                        one directory per thread
//!     ├── 00000000000000000001-<id>.json
//!     └── 00000000000000000002-<id>.json
//! ```
//!
//! Each file holds the checkpoint, its metadata, the parent link and the task
//! writes recorded against it. Files are written to a temporary name first and
//! renamed into place, so a crash leaves either the old or the new content,
//! never a torn file. The file is flushed before the rename and the
//! directory after it, so a saved checkpoint survives a power loss. The zero-padded sequence prefix makes directory order
//! equal history order.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite},
    error::{CheckpointError, Result},
    traits::{check_append, metadata_matches, require_thread_id, CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// On-disk form of one checkpoint
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    config: CheckpointConfig,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_config: Option<CheckpointConfig>,
    #[serde(default)]
    writes: Vec<PendingWrite>,
}

impl From<StoredEntry> for CheckpointTuple {
    fn from(entry: StoredEntry) -> Self {
        CheckpointTuple {
            config: entry.config,
            checkpoint: entry.checkpoint,
            metadata: entry.metadata,
            parent_config: entry.parent_config,
            pending_writes: entry.writes,
        }
    }
}

/// Checkpoint saver writing JSON files below a root directory
#[derive(Debug, Clone)]
pub struct FileCheckpointSaver {
    root: PathBuf,
    // Serializes read-modify-write sequences of this process
    write_lock: Arc<Mutex<()>>,
}

impl FileCheckpointSaver {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file checkpoint store");
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(encode_thread_id(thread_id))
    }

    /// Entry files of a thread, oldest first
    async fn entry_paths(&self, thread_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.thread_dir(thread_id);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(item) = reader.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            paths.push(item.path());
        }
        paths.sort();
        Ok(paths)
    }

    async fn find_path(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<PathBuf>> {
        let suffix = format!("-{}.json", checkpoint_id);
        Ok(self
            .entry_paths(thread_id)
            .await?
            .into_iter()
            .find(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with(&suffix))
            }))
    }

    async fn read_entry(path: &Path) -> Result<StoredEntry> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Corrupt checkpoint file");
            CheckpointError::Storage(format!("corrupt checkpoint file {}: {}", path.display(), e))
        })
    }

    async fn write_entry(path: &Path, entry: &StoredEntry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CheckpointError::Storage(format!("bad entry path {}", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        if let Some(dir) = path.parent() {
            sync_dir(dir).await?;
        }
        Ok(())
    }
}

/// Flush a directory so renames and new entries in it survive a power loss
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Map a thread id onto a safe directory name
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`, which keeps distinct ids distinct.
fn encode_thread_id(thread_id: &str) -> String {
    let mut out = String::with_capacity(thread_id.len());
    for byte in thread_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

#[async_trait]
impl CheckpointSaver for FileCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = require_thread_id(config)?;
        let path = match &config.checkpoint_id {
            Some(id) => self.find_path(thread_id, id).await?,
            None => self.entry_paths(thread_id).await?.pop(),
        };
        match path {
            Some(path) => Ok(Some(Self::read_entry(&path).await?.into())),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let thread_id = config
            .and_then(|cfg| cfg.thread_id.clone())
            .ok_or_else(|| CheckpointError::Invalid("file store lists one thread at a time".to_string()))?;

        let before_seq = match before.and_then(|cfg| cfg.checkpoint_id.as_ref()) {
            Some(id) => match self.find_path(&thread_id, id).await? {
                Some(path) => Some(Self::read_entry(&path).await?.checkpoint.seq),
                None => None,
            },
            None => None,
        };

        let mut results = Vec::new();
        for path in self.entry_paths(&thread_id).await?.into_iter().rev() {
            let entry = Self::read_entry(&path).await?;
            if before_seq.map_or(false, |seq| entry.checkpoint.seq >= seq) {
                continue;
            }
            if !metadata_matches(&entry.metadata, filter.as_ref()) {
                continue;
            }
            results.push(Ok(entry.into()));
            if limit.map_or(false, |lim| results.len() >= lim) {
                break;
            }
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let thread_id = require_thread_id(config)?.to_string();
        let _guard = self.write_lock.lock().await;

        let latest = match self.entry_paths(&thread_id).await?.pop() {
            Some(path) => Some(Self::read_entry(&path).await?.checkpoint),
            None => None,
        };
        check_append(latest.as_ref(), &checkpoint)?;

        let dir = self.thread_dir(&thread_id);
        if tokio::fs::metadata(&dir).await.is_err() {
            tokio::fs::create_dir_all(&dir).await?;
            sync_dir(&self.root).await?;
        }
        let path = dir.join(format!("{:020}-{}.json", checkpoint.seq, checkpoint.id));

        let checkpoint_config = CheckpointConfig {
            thread_id: Some(thread_id.clone()),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: config.extra.clone(),
        };
        let entry = StoredEntry {
            config: checkpoint_config.clone(),
            parent_config: config.checkpoint_id.as_ref().map(|_| config.clone()),
            checkpoint,
            metadata,
            writes: Vec::new(),
        };
        Self::write_entry(&path, &entry).await?;
        debug!(thread_id = %thread_id, seq = entry.checkpoint.seq, "Checkpoint written");

        Ok(checkpoint_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = require_thread_id(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let _guard = self.write_lock.lock().await;
        let path = self
            .find_path(thread_id, checkpoint_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        let mut entry = Self::read_entry(&path).await?;
        entry.writes.retain(|(existing, _, _)| existing != &task_id);
        for (channel, value) in writes {
            entry.writes.push((task_id.clone(), channel, value));
        }
        Self::write_entry(&path, &entry).await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_dir_all(self.thread_dir(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
