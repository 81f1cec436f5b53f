//! Main Pregel execution loop.
//!
//! [`PregelLoop`] drives one invocation of a compiled graph: it restores the
//! run from its latest checkpoint, applies the caller's input or resume
//! value, and then repeats supersteps until nothing is runnable, the step
//! budget is spent, the run suspends or the caller cancels.
//!
//! # Superstep
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────────┐
//!            │                                                          │
//!            ▼                                                          │
//!      ┌──────────┐  tasks   ┌───────────┐ outcomes ┌─────────┐  ┌──────┴────────┐
//!      │ Planning │ ───────► │ Executing │ ───────► │ Merging │─►│ Checkpointing │
//!      └────┬─────┘          └─────┬─────┘          └────┬────┘  └──────┬────────┘
//!           │ none / budget        │ interrupt           │ error        │ after-breakpoint
//!           ▼                      ▼                     ▼              ▼
//!      Terminated              Suspended            Terminated      Suspended
//!      (Completed,             (suspended           (store rolled   (checkpoint has
//!       StepLimitExceeded)      checkpoint saved)    back, Err)      After records)
//! ```
//!
//! 1. **Planning** asks [`prepare_next_tasks`] which nodes saw a trigger
//!    channel change since they last ran, plus one task per pending `Send`.
//!    When resuming, the tasks come from the suspended checkpoint instead.
//! 2. **Executing** runs every task against the state as of the previous
//!    superstep. Tasks never see each other's writes.
//! 3. **Merging** commits all user writes in one atomic batch, consumes the
//!    triggers of the tasks that ran, evaluates routers against the merged
//!    state and commits the routing writes.
//! 4. **Checkpointing** appends the new checkpoint. Nothing is observable
//!    through the stream before this succeeds.
//!
//! # Failure
//!
//! A fatal task error, a rejected merge or a failed save ends the run with
//! `Err`. The store is rolled back to the last checkpoint, which is also
//! what the backend still holds, so the run can be continued after a fix.
//!
//! # Resume
//!
//! A suspended checkpoint stores the superstep's tasks as [`TaskRecord`]s
//! together with the open interrupt slots. Resuming re-enters that
//! superstep: completed tasks keep their recorded output, answered tasks
//! re-run with their resume values and journal, tasks still waiting for an
//! answer stay suspended.

use super::algo::{prepare_next_tasks, route_writes, task_from_record};
use super::channels::ChannelStore;
use super::executor::{recovered_outputs, TaskExecutor};
use super::io;
use super::plan::{ExecutionPlan, PlanNode};
use super::types::{LoopState, PlannedTask, TaskOutcome, TaskResult};
use crate::command::{NodeOutput, ResumeValue};
use crate::compiled::types::{RunOutcome, RunStatus};
use crate::config::{EngineConfig, RunConfig};
use crate::error::{GraphError, Result};
use crate::graph::START;
use crate::interrupt::{after_record, apply_resume, before_record, is_runnable_on_resume};
use crate::runtime::NodeFailure;
use crate::stream::{StreamEvent, StreamMode, StreamMultiplexer};
use serde_json::Value;
use stategraph_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    ChannelVersions, InterruptRecord, InterruptWhen, TaskRecord, TaskStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the caller hands to a run
#[derive(Debug, Clone)]
pub(crate) enum RunInput {
    /// Fresh input, or `Null` to continue from the latest checkpoint
    Invoke(Value),
    /// Answers to the open interrupt slots
    Resume(ResumeValue),
}

/// A task of the current superstep, either to run or already settled
enum Slot {
    Run(PlannedTask),
    Settled(TaskResult),
}

/// Result of a successful merge
struct Merged {
    versions_seen: BTreeMap<String, ChannelVersions>,
    updated: Vec<String>,
    writes: BTreeMap<String, Value>,
}

/// The superstep loop of a single invocation.
pub(crate) struct PregelLoop {
    plan: Arc<ExecutionPlan>,
    saver: Option<Arc<dyn CheckpointSaver>>,
    engine: EngineConfig,
    config: RunConfig,
    thread_id: String,
    stream: Option<Arc<StreamMultiplexer>>,
    executor: TaskExecutor,
    state: LoopState,
    store: ChannelStore,
    /// Last checkpoint written or loaded; the rollback target
    checkpoint: Checkpoint,
    /// Backend address of `checkpoint`
    checkpoint_config: Option<CheckpointConfig>,
    /// Highest sequence number of the thread
    latest_seq: u64,
    /// Set while the next save branches off an older checkpoint
    fork: bool,
    steps_taken: usize,
}

impl PregelLoop {
    pub(crate) fn new(
        plan: Arc<ExecutionPlan>,
        saver: Option<Arc<dyn CheckpointSaver>>,
        engine: EngineConfig,
        config: RunConfig,
        stream: Option<Arc<StreamMultiplexer>>,
    ) -> Result<Self> {
        let thread_id = config
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let executor = TaskExecutor {
            plan: plan.clone(),
            thread_id: thread_id.clone(),
            configurable: Arc::new(config.configurable.clone()),
            stream: stream.clone(),
            retry: engine.retry.clone(),
            task_timeout: engine.task_timeout(),
            max_concurrency: config.max_concurrency.or(engine.max_concurrency),
            cancel: config.cancel.clone(),
            saver: saver.clone(),
        };
        let store = ChannelStore::new(&plan)?;

        Ok(Self {
            plan,
            saver,
            engine,
            config,
            thread_id,
            stream,
            executor,
            state: LoopState::Idle,
            store,
            checkpoint: Checkpoint::empty(),
            checkpoint_config: None,
            latest_seq: 0,
            fork: false,
            steps_taken: 0,
        })
    }

    pub(crate) fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Run until the graph finishes, suspends or fails
    pub(crate) async fn run(mut self, input: RunInput) -> Result<RunOutcome> {
        info!(thread_id = %self.thread_id, "Run started");
        let result = self.drive(input).await;
        match &result {
            Ok(outcome) => info!(
                thread_id = %self.thread_id,
                step = outcome.step,
                status = ?outcome.status,
                "Run finished"
            ),
            Err(e) => error!(thread_id = %self.thread_id, error = %e, "Run failed"),
        }
        result
    }

    async fn drive(&mut self, input: RunInput) -> Result<RunOutcome> {
        let base = self.load_base().await?;
        let mut recovered = HashMap::new();
        let mut resumed = None;

        let first_step = match input {
            RunInput::Resume(value) => {
                if self.saver.is_none() {
                    return Err(GraphError::Configuration("resume requires a checkpointer".into()));
                }
                if !self.checkpoint.is_suspended() {
                    return Err(GraphError::NothingToResume {
                        thread_id: self.thread_id.clone(),
                    });
                }
                let mut suspended = self.checkpoint.clone();
                apply_resume(&mut suspended, value)?;
                if suspended.pending_tasks.is_empty() {
                    // Only breakpoints were open; the cleared slots must reach the backend
                    // even when nothing runs afterwards
                    let mut cleared = suspended.successor();
                    cleared.seq = self.latest_seq + 1;
                    cleared.updated_channels = None;
                    cleared.interrupts.clear();
                    let step = cleared.step;
                    let metadata = self.metadata(step, BTreeMap::new());
                    self.persist(cleared, metadata).await?;
                    debug!(thread_id = %self.thread_id, step, "Breakpoint cleared");
                    step + 1
                } else {
                    resumed = Some((suspended.pending_tasks, suspended.interrupts));
                    suspended.step
                }
            }
            RunInput::Invoke(input) => {
                if self.checkpoint.is_suspended() {
                    return Err(GraphError::RunSuspended {
                        thread_id: self.thread_id.clone(),
                    });
                }
                match &base {
                    Some(tuple) if input.is_null() => {
                        recovered = recovered_outputs(&tuple.pending_writes);
                        debug!(thread_id = %self.thread_id, recovered = recovered.len(), "Continuing from checkpoint");
                    }
                    _ => self.apply_input(&input)?,
                }
                self.checkpoint.step + 1
            }
        };

        self.superstep_loop(first_step, resumed, recovered).await
    }

    /// Restore the store from the checkpoint the run continues from
    async fn load_base(&mut self) -> Result<Option<stategraph_checkpoint::CheckpointTuple>> {
        let Some(saver) = self.saver.clone() else {
            if self.config.checkpoint_id.is_some() {
                return Err(GraphError::Configuration(
                    "checkpoint_id requires a checkpointer".into(),
                ));
            }
            return Ok(None);
        };

        let thread = CheckpointConfig::for_thread(self.thread_id.clone());
        let latest = saver.get_tuple(&thread).await?;
        let base = match &self.config.checkpoint_id {
            Some(id) => {
                let tuple = saver
                    .get_tuple(&thread.clone().with_checkpoint_id(id.clone()))
                    .await?
                    .ok_or_else(|| {
                        CheckpointError::NotFound(format!("checkpoint '{}' of thread '{}'", id, self.thread_id))
                    })?;
                self.fork = latest
                    .as_ref()
                    .map(|l| l.checkpoint.id != tuple.checkpoint.id)
                    .unwrap_or(false);
                Some(tuple)
            }
            None => latest.clone(),
        };
        self.latest_seq = latest.map(|t| t.checkpoint.seq).unwrap_or(0);

        if let Some(tuple) = &base {
            self.store = ChannelStore::from_checkpoint(&self.plan, &tuple.checkpoint)?;
            self.checkpoint = tuple.checkpoint.clone();
            self.checkpoint_config = Some(tuple.config.clone());
            debug!(
                thread_id = %self.thread_id,
                checkpoint_id = %tuple.checkpoint.id,
                step = tuple.checkpoint.step,
                fork = self.fork,
                "Restored checkpoint"
            );
        }
        Ok(base)
    }

    /// Write the input and fire the edges leaving START
    fn apply_input(&mut self, input: &Value) -> Result<()> {
        let writes = io::input_writes(&self.plan, input)?;
        self.store.propose_writes(-1, writes)?;
        self.store.commit(-1, false)?;

        let snapshot = self.store.state_view();
        let writes = route_writes(&self.plan.start, START, None, &[], &snapshot, -1)?;
        self.store.propose_writes(-1, writes)?;
        self.store.commit(-1, false)?;
        Ok(())
    }

    async fn superstep_loop(
        &mut self,
        mut step: i64,
        mut resumed: Option<(Vec<TaskRecord>, Vec<InterruptRecord>)>,
        mut recovered: HashMap<String, NodeOutput>,
    ) -> Result<RunOutcome> {
        let limit = self.config.step_limit.unwrap_or(self.engine.step_limit);
        let plan = self.plan.clone();

        loop {
            if self.config.cancel.is_cancelled() {
                self.transition(LoopState::Terminated)?;
                info!(thread_id = %self.thread_id, step, "Run cancelled");
                return Ok(self.outcome(RunStatus::Cancelled));
            }

            self.transition(LoopState::Planning)?;
            let (slots, fresh) = match resumed.take() {
                Some((records, open)) => (self.slots_from_records(&records, &open, step)?, false),
                None => {
                    let tasks = prepare_next_tasks(&plan, &self.store, &self.checkpoint.versions_seen, step)?;
                    (tasks.into_iter().map(Slot::Run).collect::<Vec<_>>(), true)
                }
            };

            if slots.is_empty() {
                self.transition(LoopState::Terminated)?;
                return Ok(self.outcome(RunStatus::Completed));
            }
            if self.steps_taken >= limit {
                self.transition(LoopState::Terminated)?;
                warn!(thread_id = %self.thread_id, step, limit, "Step limit reached with work scheduled");
                return Ok(self.outcome(RunStatus::StepLimitExceeded { limit }));
            }

            if fresh {
                let before: Vec<InterruptRecord> = slots
                    .iter()
                    .filter_map(|slot| match slot {
                        Slot::Run(task) if plan.interrupts.should_interrupt_before(&task.node) => {
                            Some(before_record(&task.record(TaskStatus::Pending), step))
                        }
                        _ => None,
                    })
                    .collect();
                if !before.is_empty() {
                    let records = slots
                        .iter()
                        .filter_map(|slot| match slot {
                            Slot::Run(task) => Some(task.record(TaskStatus::Pending)),
                            Slot::Settled(_) => None,
                        })
                        .collect();
                    return self.suspend(step, records, before).await;
                }
            }

            self.transition(LoopState::Executing)?;
            debug!(thread_id = %self.thread_id, step, tasks = slots.len(), "Executing superstep");
            let mut ordered: Vec<Option<TaskResult>> = Vec::with_capacity(slots.len());
            let mut runnable = Vec::new();
            for slot in slots {
                match slot {
                    Slot::Run(task) => {
                        ordered.push(None);
                        runnable.push(task);
                    }
                    Slot::Settled(result) => ordered.push(Some(result)),
                }
            }

            let journal_to = self.checkpoint_config.clone();
            let executed = match self.executor.execute(runnable, &recovered, journal_to.as_ref()).await {
                Ok(executed) => executed,
                Err(e) => return Err(self.fail(step, e, false)),
            };
            recovered.clear();
            let mut executed = executed.into_iter();
            let results: Vec<TaskResult> = ordered
                .into_iter()
                .map(|slot| slot.or_else(|| executed.next()))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| GraphError::Execution("executor returned fewer results than tasks".into()))?;

            if self.config.cancel.is_cancelled() {
                self.transition(LoopState::Terminated)?;
                info!(thread_id = %self.thread_id, step, "Run cancelled, superstep discarded");
                return Ok(self.outcome(RunStatus::Cancelled));
            }

            if results.iter().any(|r| r.outcome.is_suspended()) {
                let mut records = Vec::with_capacity(results.len());
                let mut interrupts = Vec::new();
                for result in &results {
                    records.push(record_of(result)?);
                    if let TaskOutcome::Suspended { interrupt, .. } = &result.outcome {
                        interrupts.push(interrupt.clone());
                    }
                }
                return self.suspend(step, records, interrupts).await;
            }

            self.transition(LoopState::Merging)?;
            let merged = match self.merge(&plan, step, &results) {
                Ok(merged) => merged,
                Err(e) => return Err(self.fail(step, e, true)),
            };

            self.transition(LoopState::Checkpointing)?;
            let after: Vec<InterruptRecord> = results
                .iter()
                .filter(|r| plan.interrupts.should_interrupt_after(&r.task.node))
                .map(|r| after_record(&r.task.record(TaskStatus::Completed), step))
                .collect();

            let mut checkpoint = Checkpoint::new(self.store.checkpoint_values(), self.store.versions().clone())
                .with_updated_channels(merged.updated);
            checkpoint.seq = self.latest_seq + 1;
            checkpoint.step = step;
            checkpoint.versions_seen = merged.versions_seen;
            checkpoint.interrupts = after.clone();
            let metadata = self.metadata(step, merged.writes);
            if let Err(e) = self.persist(checkpoint, metadata).await {
                return Err(self.fail(step, e, true));
            }

            for result in &results {
                if let TaskOutcome::Completed(output) = &result.outcome {
                    self.emit(StreamEvent::Updates {
                        step,
                        node: result.task.node.clone(),
                        task_id: result.task.id.clone(),
                        update: output.update().clone(),
                    });
                }
            }
            self.emit(StreamEvent::Values {
                step,
                state: self.store.state_view(),
            });
            self.emit_checkpoint(step);
            debug!(thread_id = %self.thread_id, step, tasks = results.len(), "Superstep committed");

            if !after.is_empty() {
                self.transition(LoopState::Suspended)?;
                self.emit(StreamEvent::Interrupt {
                    step,
                    interrupts: after.clone(),
                });
                info!(thread_id = %self.thread_id, step, "Run suspended after breakpoint");
                return Ok(self.outcome(RunStatus::Interrupted { interrupts: after }));
            }

            self.steps_taken += 1;
            step += 1;
        }
    }

    /// Rebuild the tasks of a suspended superstep
    fn slots_from_records(
        &self,
        records: &[TaskRecord],
        open: &[InterruptRecord],
        step: i64,
    ) -> Result<Vec<Slot>> {
        let mut slots = Vec::with_capacity(records.len());
        for record in records {
            let task = task_from_record(&self.plan, &self.store, record, step)?;
            if is_runnable_on_resume(record, open) {
                slots.push(Slot::Run(task));
                continue;
            }
            let outcome = match record.status {
                TaskStatus::Completed => {
                    let output = match &record.output {
                        Some(value) => serde_json::from_value(value.clone())?,
                        None => NodeOutput::default(),
                    };
                    TaskOutcome::Completed(output)
                }
                TaskStatus::Failed => TaskOutcome::Failed {
                    error: record.error.clone().unwrap_or_default(),
                },
                TaskStatus::Suspended => {
                    let interrupt = open
                        .iter()
                        .find(|r| r.task_id == record.id && r.when == InterruptWhen::During)
                        .cloned()
                        .ok_or_else(|| {
                            GraphError::Execution(format!("suspended task '{}' has no open interrupt", record.id))
                        })?;
                    TaskOutcome::Suspended {
                        interrupt,
                        journal: record.journal.clone(),
                    }
                }
                TaskStatus::Pending => {
                    slots.push(Slot::Run(task));
                    continue;
                }
            };
            slots.push(Slot::Settled(TaskResult { task, outcome }));
        }
        Ok(slots)
    }

    /// Fold the superstep's outcomes into the store
    fn merge(&mut self, plan: &ExecutionPlan, step: i64, results: &[TaskResult]) -> Result<Merged> {
        for result in results {
            if let TaskOutcome::Completed(output) = &result.outcome {
                let node = node_of(plan, &result.task.node)?;
                let writes = io::update_writes(node, step, output.update())?;
                self.store.propose_writes(step, writes)?;
            }
        }
        let mut updated = self.store.commit(step, true)?;

        let pulled: Vec<&TaskResult> = results.iter().filter(|r| !r.task.is_push()).collect();
        for result in &pulled {
            for channel in &result.task.triggers {
                if self.store.consume(channel) {
                    updated.push(channel.clone());
                }
            }
        }
        let mut versions_seen = self.checkpoint.versions_seen.clone();
        for result in &pulled {
            let node = node_of(plan, &result.task.node)?;
            let seen = versions_seen.entry(node.name.clone()).or_default();
            for channel in &node.triggers {
                if let Some(version) = self.store.version(channel) {
                    seen.insert(channel.clone(), version.clone());
                }
            }
        }

        let snapshot = self.store.state_view();
        let mut routing = Vec::new();
        for result in results {
            let node = node_of(plan, &result.task.node)?;
            match &result.outcome {
                TaskOutcome::Completed(output) => routing.extend(route_writes(
                    &node.routing,
                    &node.name,
                    Some(node),
                    output.goto(),
                    &snapshot,
                    step,
                )?),
                TaskOutcome::Failed { error } => {
                    if let Some(channel) = &node.fallback {
                        let failure = NodeFailure {
                            node: node.name.clone(),
                            error: error.clone(),
                        };
                        routing.push((channel.clone(), serde_json::to_value(failure)?));
                    }
                }
                TaskOutcome::Suspended { .. } | TaskOutcome::Skipped => {}
            }
        }
        self.store.propose_writes(step, routing)?;
        updated.extend(self.store.commit(step, false)?);
        updated.sort();
        updated.dedup();

        let mut by_node: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for result in results {
            if let TaskOutcome::Completed(output) = &result.outcome {
                by_node
                    .entry(result.task.node.clone())
                    .or_default()
                    .push(output.update().clone());
            }
        }
        let writes = by_node
            .into_iter()
            .map(|(node, mut updates)| {
                let value = if updates.len() == 1 {
                    updates.remove(0)
                } else {
                    Value::Array(updates)
                };
                (node, value)
            })
            .collect();

        Ok(Merged {
            versions_seen,
            updated,
            writes,
        })
    }

    /// Persist a suspended checkpoint and report the open slots
    async fn suspend(
        &mut self,
        step: i64,
        records: Vec<TaskRecord>,
        interrupts: Vec<InterruptRecord>,
    ) -> Result<RunOutcome> {
        self.transition(LoopState::Suspended)?;
        let mut checkpoint = Checkpoint::new(self.store.checkpoint_values(), self.store.versions().clone());
        checkpoint.seq = self.latest_seq + 1;
        checkpoint.step = step;
        checkpoint.versions_seen = self.checkpoint.versions_seen.clone();
        checkpoint.pending_tasks = records;
        checkpoint.interrupts = interrupts.clone();
        let metadata = self.metadata(step, BTreeMap::new());
        self.persist(checkpoint, metadata).await?;

        self.emit_checkpoint(step);
        self.emit(StreamEvent::Interrupt {
            step,
            interrupts: interrupts.clone(),
        });
        info!(thread_id = %self.thread_id, step, open = interrupts.len(), "Run suspended");
        Ok(self.outcome(RunStatus::Interrupted { interrupts }))
    }

    /// Append `checkpoint` to the thread and make it the rollback target
    async fn persist(&mut self, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Result<()> {
        if let Some(saver) = &self.saver {
            let parent = self
                .checkpoint_config
                .clone()
                .unwrap_or_else(|| CheckpointConfig::for_thread(self.thread_id.clone()));
            let saved = saver.put(&parent, checkpoint.clone(), metadata).await?;
            debug!(
                thread_id = %self.thread_id,
                checkpoint_id = %checkpoint.id,
                seq = checkpoint.seq,
                step = checkpoint.step,
                "Checkpoint saved"
            );
            self.checkpoint_config = Some(saved);
        }
        self.latest_seq = checkpoint.seq;
        self.fork = false;
        self.checkpoint = checkpoint;
        Ok(())
    }

    fn metadata(&self, step: i64, writes: BTreeMap<String, Value>) -> CheckpointMetadata {
        let source = if self.fork {
            CheckpointSource::Fork
        } else {
            CheckpointSource::Loop
        };
        CheckpointMetadata::new()
            .with_source(source)
            .with_step(step)
            .with_writes(writes)
    }

    /// End the run with `err`, restoring the store when a merge touched it
    fn fail(&mut self, step: i64, err: GraphError, rollback: bool) -> GraphError {
        if rollback {
            match ChannelStore::from_checkpoint(&self.plan, &self.checkpoint) {
                Ok(store) => self.store = store,
                Err(e) => error!(thread_id = %self.thread_id, error = %e, "Rollback failed"),
            }
        }
        debug!(thread_id = %self.thread_id, from = %self.state, to = %LoopState::Terminated, "Loop transition");
        self.state = LoopState::Terminated;
        error!(thread_id = %self.thread_id, step, error = %err, rolled_back = rollback, "Superstep failed");
        err
    }

    fn transition(&mut self, next: LoopState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(GraphError::Execution(format!(
                "invalid loop transition {} -> {}",
                self.state, next
            )));
        }
        debug!(thread_id = %self.thread_id, from = %self.state, to = %next, "Loop transition");
        self.state = next;
        Ok(())
    }

    fn outcome(&self, status: RunStatus) -> RunOutcome {
        RunOutcome {
            state: self.store.state_view(),
            status,
            step: self.checkpoint.step,
            checkpoint: self.checkpoint_config.clone(),
        }
    }

    fn emit_checkpoint(&self, step: i64) {
        let Some(stream) = &self.stream else {
            return;
        };
        if !stream.has_subscribers_for(StreamMode::Checkpoints) {
            return;
        }
        let next = if self.checkpoint.pending_tasks.is_empty() {
            prepare_next_tasks(&self.plan, &self.store, &self.checkpoint.versions_seen, step + 1)
                .map(|tasks| tasks.into_iter().map(|t| t.node).collect())
                .unwrap_or_default()
        } else {
            self.checkpoint.pending_tasks.iter().map(|t| t.node.clone()).collect()
        };
        stream.emit(StreamEvent::Checkpoint {
            thread_id: self.thread_id.clone(),
            checkpoint_id: self.checkpoint.id.clone(),
            step,
            seq: self.checkpoint.seq,
            next,
        });
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(stream) = &self.stream {
            stream.emit(event);
        }
    }
}

fn node_of<'p>(plan: &'p ExecutionPlan, name: &str) -> Result<&'p PlanNode> {
    plan.node(name)
        .ok_or_else(|| GraphError::Execution(format!("unknown node '{}'", name)))
}

/// Persistable form of a task result
fn record_of(result: &TaskResult) -> Result<TaskRecord> {
    Ok(match &result.outcome {
        TaskOutcome::Completed(output) => {
            let mut record = result.task.record(TaskStatus::Completed);
            record.output = Some(serde_json::to_value(output)?);
            record
        }
        TaskOutcome::Suspended { journal, .. } => {
            let mut record = result.task.record(TaskStatus::Suspended);
            record.journal = journal.clone();
            record
        }
        TaskOutcome::Failed { error } => {
            let mut record = result.task.record(TaskStatus::Failed);
            record.error = Some(error.clone());
            record
        }
        TaskOutcome::Skipped => result.task.record(TaskStatus::Pending),
    })
}
