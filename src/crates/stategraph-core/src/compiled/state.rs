//! State management methods (get_state, get_state_history, update_state)

use super::graph::require_thread_id;
use super::types::{StateSnapshot, StateSnapshotStream};
use super::CompiledGraph;
use crate::auth::AccessAction;
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::pregel::algo::{prepare_next_tasks, route_writes};
use crate::pregel::channels::ChannelStore;
use crate::pregel::io;
use crate::pregel::ExecutionPlan;
use futures::StreamExt;
use serde_json::Value;
use stategraph_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    TaskStatus,
};
use std::collections::BTreeMap;
use tracing::info;

impl CompiledGraph {
    /// Snapshot of a thread at its latest checkpoint, or at `config.checkpoint_id`
    ///
    /// `Ok(None)` when the thread has no checkpoint or no checkpointer is
    /// configured. `next` lists the nodes that run when the thread
    /// continues: the unfinished tasks of a suspended superstep, otherwise
    /// the nodes the scheduler would plan.
    #[tracing::instrument(skip(self, config), fields(thread_id = ?config.thread_id))]
    pub async fn get_state(&self, config: &RunConfig) -> Result<Option<StateSnapshot>> {
        let thread_id = require_thread_id(config.thread_id.as_deref())?;
        self.authorize(AccessAction::GetState, thread_id, &config.configurable)
            .await?;
        let Some(saver) = &self.checkpoint_saver else {
            return Ok(None);
        };

        let mut lookup = CheckpointConfig::for_thread(thread_id);
        lookup.checkpoint_id = config.checkpoint_id.clone();
        match saver.get_tuple(&lookup).await? {
            Some(tuple) => Ok(Some(snapshot(&self.plan, tuple)?)),
            None => Ok(None),
        }
    }

    /// Snapshots of a thread, newest first
    ///
    /// `before` restricts to checkpoints older than the given one; `limit`
    /// caps the number of snapshots.
    #[tracing::instrument(skip(self, config, before), fields(thread_id = ?config.thread_id))]
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<StateSnapshotStream> {
        let thread_id = require_thread_id(config.thread_id.as_deref())?;
        self.authorize(AccessAction::GetStateHistory, thread_id, &config.configurable)
            .await?;
        let Some(saver) = &self.checkpoint_saver else {
            return Ok(Box::pin(futures::stream::empty()));
        };

        let plan = self.plan.clone();
        let tuples = saver
            .list(Some(&CheckpointConfig::for_thread(thread_id)), None, before, limit)
            .await?;
        Ok(Box::pin(tuples.map(move |result| {
            result
                .map_err(GraphError::from)
                .and_then(|tuple| snapshot(&plan, tuple))
        })))
    }

    /// Write `values` into a thread as a new checkpoint
    ///
    /// With `as_node` the edit counts as that node's output: the keys are
    /// checked against the node's writes, the node's outgoing edges fire and
    /// any suspended superstep is discarded, so the next `invoke(Null)`
    /// continues after the node. Without `as_node` the values are merged
    /// through the reducers and a suspended run stays suspended.
    ///
    /// The edit is appended after the thread's latest checkpoint; with
    /// `config.checkpoint_id` it applies to that older checkpoint, forking
    /// the thread.
    ///
    /// # Errors
    ///
    /// - [`GraphError::Configuration`] without a checkpointer or for an
    ///   unknown `as_node`
    /// - [`GraphError::InvalidUpdate`] for undeclared keys
    #[tracing::instrument(skip(self, config, values), fields(thread_id = ?config.thread_id))]
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let thread_id = require_thread_id(config.thread_id.as_deref())?;
        self.authorize(AccessAction::UpdateState, thread_id, &config.configurable)
            .await?;
        let saver = self.require_saver()?;
        let node = match as_node {
            Some(name) => Some(
                self.plan
                    .node(name)
                    .ok_or_else(|| GraphError::Configuration(format!("unknown node '{}'", name)))?,
            ),
            None => None,
        };

        let thread = CheckpointConfig::for_thread(thread_id);
        let latest = saver.get_tuple(&thread).await?;
        let base = match &config.checkpoint_id {
            Some(id) => Some(
                saver
                    .get_tuple(&thread.clone().with_checkpoint_id(id.clone()))
                    .await?
                    .ok_or_else(|| {
                        CheckpointError::NotFound(format!("checkpoint '{}' of thread '{}'", id, thread_id))
                    })?,
            ),
            None => latest.clone(),
        };
        let latest_seq = latest.map(|t| t.checkpoint.seq).unwrap_or(0);
        let (mut store, previous, parent) = match base {
            Some(tuple) => (
                ChannelStore::from_checkpoint(&self.plan, &tuple.checkpoint)?,
                tuple.checkpoint,
                tuple.config,
            ),
            None => (ChannelStore::new(&self.plan)?, Checkpoint::empty(), thread),
        };

        let keeps_pending = node.is_none() && !previous.pending_tasks.is_empty();
        let step = if keeps_pending {
            previous.step
        } else {
            previous.step + 1
        };

        let mut updated = Vec::new();
        match node {
            Some(node) => {
                store.propose_writes(step, io::edit_writes(&self.plan, step, &values, Some(node))?)?;
                updated.extend(store.commit(step, true)?);
                let snapshot = store.state_view();
                let routing = route_writes(&node.routing, &node.name, Some(node), &[], &snapshot, step)?;
                store.propose_writes(step, routing)?;
                updated.extend(store.commit(step, false)?);
            }
            None => {
                store.propose_writes(step, io::edit_writes(&self.plan, step, &values, None)?)?;
                updated.extend(store.commit(step, false)?);
            }
        }
        updated.sort();
        updated.dedup();

        let mut checkpoint =
            Checkpoint::new(store.checkpoint_values(), store.versions().clone()).with_updated_channels(updated);
        checkpoint.seq = latest_seq + 1;
        checkpoint.step = step;
        checkpoint.versions_seen = previous.versions_seen;
        if keeps_pending {
            checkpoint.pending_tasks = previous.pending_tasks;
            checkpoint.interrupts = previous.interrupts;
        } else if node.is_none() {
            checkpoint.interrupts = previous.interrupts;
        }

        let writer = as_node.unwrap_or("update_state").to_string();
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Update)
            .with_step(step)
            .with_writes(BTreeMap::from([(writer, values)]));
        let saved = saver.put(&parent, checkpoint, metadata).await?;
        info!(
            thread_id,
            step,
            as_node = as_node.unwrap_or("-"),
            checkpoint_id = ?saved.checkpoint_id,
            "State updated"
        );
        Ok(saved)
    }
}

/// Snapshot view of a stored checkpoint
fn snapshot(plan: &ExecutionPlan, tuple: CheckpointTuple) -> Result<StateSnapshot> {
    let store = ChannelStore::from_checkpoint(plan, &tuple.checkpoint)?;
    let checkpoint = tuple.checkpoint;
    let next = if checkpoint.pending_tasks.is_empty() {
        prepare_next_tasks(plan, &store, &checkpoint.versions_seen, checkpoint.step + 1)?
            .into_iter()
            .map(|t| t.node)
            .collect()
    } else {
        checkpoint
            .pending_tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| t.node.clone())
            .collect()
    };

    Ok(StateSnapshot {
        values: store.state_view(),
        next,
        tasks: checkpoint.pending_tasks,
        interrupts: checkpoint.interrupts,
        config: tuple.config,
        parent_config: tuple.parent_config,
        metadata: tuple.metadata,
        step: checkpoint.step,
        created_at: checkpoint.ts,
    })
}
