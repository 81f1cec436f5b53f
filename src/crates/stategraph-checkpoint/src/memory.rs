//! In-memory checkpoint backend
//!
//! [`InMemoryCheckpointSaver`] keeps every thread's history in a
//! `tokio::sync::RwLock`-guarded map. Clones share the same storage, so one
//! instance can be handed to several compiled graphs. Nothing survives the
//! process; use [`FileCheckpointSaver`](crate::file::FileCheckpointSaver) when
//! runs must resume after a restart.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, PendingWrite},
    error::{CheckpointError, Result},
    traits::{check_append, metadata_matches, require_thread_id, CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage entry for in-memory checkpoints
#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

impl CheckpointEntry {
    fn to_tuple(&self) -> CheckpointTuple {
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
            pending_writes: self.writes.clone(),
        }
    }
}

/// Thread-safe in-memory checkpoint storage, entries ordered by sequence
type CheckpointStorage = Arc<RwLock<HashMap<String, Vec<CheckpointEntry>>>>;

/// In-memory checkpoint saver
///
/// # Example
///
/// ```rust
/// use stategraph_checkpoint::{Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, InMemoryCheckpointSaver};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let saver = InMemoryCheckpointSaver::new();
/// let mut checkpoint = Checkpoint::empty();
/// checkpoint.seq = 1;
/// let id = saver.save("thread-1", checkpoint, CheckpointMetadata::new()).await?;
///
/// let latest = saver.load("thread-1", CheckpointRef::Latest).await?.unwrap();
/// assert_eq!(latest.checkpoint.id, id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of threads being tracked
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Clear all checkpoints
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = require_thread_id(config)?;
        let storage = self.storage.read().await;
        let Some(entries) = storage.get(thread_id) else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(checkpoint_id) => entries.iter().find(|e| &e.checkpoint.id == checkpoint_id),
            None => entries.last(),
        };
        Ok(entry.map(CheckpointEntry::to_tuple))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let mut thread_ids: Vec<String> = match config.and_then(|cfg| cfg.thread_id.clone()) {
            Some(thread_id) => vec![thread_id],
            None => storage.keys().cloned().collect(),
        };
        thread_ids.sort();

        let mut results = Vec::new();
        for thread_id in thread_ids {
            let Some(entries) = storage.get(&thread_id) else {
                continue;
            };

            let before_seq = before
                .and_then(|cfg| cfg.checkpoint_id.as_ref())
                .and_then(|id| entries.iter().find(|e| &e.checkpoint.id == id))
                .map(|e| e.checkpoint.seq);

            for entry in entries.iter().rev() {
                if before_seq.map_or(false, |seq| entry.checkpoint.seq >= seq) {
                    continue;
                }
                if !metadata_matches(&entry.metadata, filter.as_ref()) {
                    continue;
                }
                results.push(Ok(entry.to_tuple()));
                if limit.map_or(false, |lim| results.len() >= lim) {
                    return Ok(Box::pin(stream::iter(results)));
                }
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

        let mut storage = self.storage.write().await;
        let entries = storage.entry(thread_id.clone()).or_default();
        check_append(entries.last().map(|e| &e.checkpoint), &checkpoint)?;

        let checkpoint_config = CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: config.extra.clone(),
        };

        entries.push(CheckpointEntry {
            checkpoint,
            metadata,
            config: checkpoint_config.clone(),
            parent_config: config.checkpoint_id.as_ref().map(|_| config.clone()),
            writes: Vec::new(),
        });

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

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(thread_id)
            .and_then(|entries| entries.iter_mut().find(|e| &e.checkpoint.id == checkpoint_id))
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        entry.writes.retain(|(existing, _, _)| existing != &task_id);
        for (channel, value) in writes {
            entry.writes.push((task_id.clone(), channel, value));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use crate::traits::CheckpointRef;
    use futures::StreamExt;
    use serde_json::json;

    fn checkpoint_with_seq(seq: u64) -> Checkpoint {
        let mut checkpoint = Checkpoint::empty();
        checkpoint.seq = seq;
        checkpoint.step = seq as i64 - 1;
        checkpoint
    }

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = checkpoint_with_seq(1);
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Loop);
        let config = CheckpointConfig::for_thread("thread-1");

        let saved_config = saver.put(&config, checkpoint.clone(), metadata).await.unwrap();
        assert_eq!(saved_config.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));

        let tuple = saver.get_tuple(&saved_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint, checkpoint);
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn test_latest_and_parent_links() {
        let saver = InMemoryCheckpointSaver::new();
        let first = saver.save("t", checkpoint_with_seq(1), CheckpointMetadata::new()).await.unwrap();
        let second = saver.save("t", checkpoint_with_seq(2), CheckpointMetadata::new()).await.unwrap();

        let latest = saver.load("t", CheckpointRef::Latest).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, second);
        assert_eq!(
            latest.parent_config.and_then(|p| p.checkpoint_id),
            Some(first.clone())
        );

        let older = saver.load("t", CheckpointRef::Id(first.clone())).await.unwrap().unwrap();
        assert_eq!(older.checkpoint.seq, 1);
    }

    #[tokio::test]
    async fn test_rejects_non_monotonic_sequence() {
        let saver = InMemoryCheckpointSaver::new();
        saver.save("t", checkpoint_with_seq(2), CheckpointMetadata::new()).await.unwrap();

        let err = saver
            .save("t", checkpoint_with_seq(2), CheckpointMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict(_)));
        assert_eq!(saver.checkpoint_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_before_and_limit() {
        let saver = InMemoryCheckpointSaver::new();
        let mut ids = Vec::new();
        for seq in 1..=4 {
            ids.push(saver.save("t", checkpoint_with_seq(seq), CheckpointMetadata::new()).await.unwrap());
        }

        let config = CheckpointConfig::for_thread("t");
        let all: Vec<_> = saver.list(Some(&config), None, None, None).await.unwrap().collect().await;
        let seqs: Vec<u64> = all.into_iter().map(|t| t.unwrap().checkpoint.seq).collect();
        assert_eq!(seqs, vec![4, 3, 2, 1]);

        let before = CheckpointConfig::for_thread("t").with_checkpoint_id(ids[2].clone());
        let older: Vec<_> = saver
            .list(Some(&config), None, Some(&before), Some(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].as_ref().unwrap().checkpoint.seq, 2);
    }

    #[tokio::test]
    async fn test_history_is_oldest_first() {
        let saver = InMemoryCheckpointSaver::new();
        for seq in 1..=3 {
            saver.save("t", checkpoint_with_seq(seq), CheckpointMetadata::new().with_step(seq as i64 - 1)).await.unwrap();
        }
        let history = saver.history("t").await.unwrap();
        let steps: Vec<_> = history.iter().map(|t| t.metadata.step).collect();
        assert_eq!(steps, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let saver = InMemoryCheckpointSaver::new();
        saver.save("t", checkpoint_with_seq(1), CheckpointMetadata::new().with_extra("user", json!("ana"))).await.unwrap();
        saver.save("t", checkpoint_with_seq(2), CheckpointMetadata::new().with_extra("user", json!("bo"))).await.unwrap();

        let filter = HashMap::from([("user".to_string(), json!("ana"))]);
        let hits: Vec<_> = saver.list(None, Some(filter), None, None).await.unwrap().collect().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].as_ref().unwrap().checkpoint.seq, 1);
    }

    #[tokio::test]
    async fn test_put_writes_replaces_task_writes() {
        let saver = InMemoryCheckpointSaver::new();
        let id = saver.save("t", checkpoint_with_seq(1), CheckpointMetadata::new()).await.unwrap();
        let config = CheckpointConfig::for_thread("t").with_checkpoint_id(id);

        saver.put_writes(&config, vec![("a".into(), json!(1))], "task-1".into()).await.unwrap();
        saver.put_writes(&config, vec![("a".into(), json!(2))], "task-1".into()).await.unwrap();
        saver.put_writes(&config, vec![("b".into(), json!(3))], "task-2".into()).await.unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(
            tuple.pending_writes,
            vec![
                ("task-1".to_string(), "a".to_string(), json!(2)),
                ("task-2".to_string(), "b".to_string(), json!(3)),
            ]
        );

        let missing = CheckpointConfig::for_thread("t").with_checkpoint_id("nope");
        assert!(saver.put_writes(&missing, vec![], "x".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let saver = InMemoryCheckpointSaver::new();
        saver.save("a", checkpoint_with_seq(1), CheckpointMetadata::new()).await.unwrap();
        saver.save("b", checkpoint_with_seq(1), CheckpointMetadata::new()).await.unwrap();
        assert_eq!(saver.thread_count().await, 2);

        saver.delete_thread("a").await.unwrap();
        assert_eq!(saver.thread_count().await, 1);

        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_thread_id_required() {
        let saver = InMemoryCheckpointSaver::new();
        let err = saver.get_tuple(&CheckpointConfig::new()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }
}
