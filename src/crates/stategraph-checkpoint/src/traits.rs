//! Persistence backend trait
//!
//! [`CheckpointSaver`] is the seam between the scheduler and storage. The
//! scheduler only calls `put`, `get_tuple` and `put_writes`; `list` and the
//! `save` / `load` / `history` helpers serve inspection and tooling. Any
//! implementation honoring the contract below is interchangeable:
//!
//! - checkpoints of a thread are append-only; `put` never replaces an
//!   existing checkpoint and rejects a `seq` that does not exceed the thread's
//!   latest one with [`CheckpointError::Conflict`](crate::CheckpointError::Conflict)
//! - `get_tuple` without a checkpoint id returns the checkpoint with the
//!   highest `seq`
//! - `list` yields newest first
//! - `put_writes` attaches task output to an existing checkpoint and the
//!   writes come back in [`CheckpointTuple::pending_writes`]

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple},
    error::{CheckpointError, Result},
};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Type alias for async stream of checkpoint tuples
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Which checkpoint of a thread to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    Latest,
    Id(CheckpointId),
}

/// Core trait for implementing checkpoint storage backends
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint by config
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Fetch a checkpoint tuple; latest of the thread when `checkpoint_id` is unset
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints newest first
    ///
    /// `filter` matches against [`CheckpointMetadata::extra`], `before`
    /// restricts to checkpoints older than the given one.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Append a checkpoint to the thread named by `config`
    ///
    /// `config.checkpoint_id`, when set, names the parent checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Record writes of a task against the checkpoint named by `config`
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Delete all checkpoints and writes associated with a thread
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }

    /// Append `checkpoint` after the thread's latest checkpoint and return its id
    async fn save(
        &self,
        thread_id: &str,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId> {
        let mut config = CheckpointConfig::for_thread(thread_id);
        if let Some(latest) = self.get_tuple(&config).await? {
            config.checkpoint_id = Some(latest.checkpoint.id);
        }
        let saved = self.put(&config, checkpoint, metadata).await?;
        saved
            .checkpoint_id
            .ok_or_else(|| CheckpointError::Storage("backend returned no checkpoint id".to_string()))
    }

    /// Load the latest or a specific checkpoint of a thread
    async fn load(&self, thread_id: &str, at: CheckpointRef) -> Result<Option<CheckpointTuple>> {
        let config = match at {
            CheckpointRef::Latest => CheckpointConfig::for_thread(thread_id),
            CheckpointRef::Id(id) => CheckpointConfig::for_thread(thread_id).with_checkpoint_id(id),
        };
        self.get_tuple(&config).await
    }

    /// Every checkpoint of a thread, oldest first
    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointTuple>> {
        let config = CheckpointConfig::for_thread(thread_id);
        let mut stream = self.list(Some(&config), None, None, None).await?;
        let mut tuples = Vec::new();
        while let Some(tuple) = stream.next().await {
            tuples.push(tuple?);
        }
        tuples.reverse();
        Ok(tuples)
    }
}

/// Thread id of `config`; every backend operation needs one
pub(crate) fn require_thread_id(config: &CheckpointConfig) -> Result<&str> {
    config
        .thread_id
        .as_deref()
        .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
}

/// Enforce the append-only ordering of a thread
pub(crate) fn check_append(latest: Option<&Checkpoint>, incoming: &Checkpoint) -> Result<()> {
    if let Some(latest) = latest {
        if incoming.seq <= latest.seq {
            return Err(CheckpointError::Conflict(format!(
                "sequence {} does not follow latest sequence {}",
                incoming.seq, latest.seq
            )));
        }
    }
    Ok(())
}

/// Whether `metadata` carries every key/value pair of `filter`
pub(crate) fn metadata_matches(metadata: &CheckpointMetadata, filter: Option<&HashMap<String, Value>>) -> bool {
    filter.map_or(true, |filter| {
        filter
            .iter()
            .all(|(key, value)| metadata.extra.get(key) == Some(value))
    })
}
