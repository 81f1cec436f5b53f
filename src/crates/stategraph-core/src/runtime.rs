//! Per-task context handed to node bodies
//!
//! Every task receives a [`NodeContext`] next to its input. Through it a node
//! can see where it runs (node, task id, superstep, run identity, attempt),
//! read values the caller put in [`RunConfig::configurable`](crate::RunConfig),
//! publish stream payloads, suspend the run, and journal side effects so they
//! are not repeated when the task is re-run after a resume.
//!
//! # Suspending
//!
//! ```rust
//! use stategraph_core::{NodeContext, Result};
//! use serde_json::{json, Value};
//!
//! async fn approve(state: Value, ctx: NodeContext) -> Result<Value> {
//!     let answer = ctx.interrupt(json!({"q": "approve?", "draft": state["draft"]}))?;
//!     Ok(json!({"approved": answer == "yes"}))
//! }
//! ```
//!
//! The first time through, `interrupt` returns `Err(GraphError::Interrupt)`
//! and `?` hands it to the scheduler, which persists a suspended checkpoint.
//! When the run is resumed the task runs again from the top and the same
//! `interrupt` call returns the caller's value instead. A task may call
//! `interrupt` several times; the n-th call is answered by the n-th resume
//! value.
//!
//! # Side effects before a suspend point
//!
//! Because the task body re-runs on resume, anything it does before the
//! `interrupt` call runs again. Wrap such work in [`NodeContext::run_once`]:
//! the result is recorded in the task's journal, persisted with the suspended
//! checkpoint, and replayed instead of re-executed.

use crate::error::{GraphError, Result};
use crate::stream::{StreamEvent, StreamMultiplexer};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stategraph_checkpoint::{InterruptRecord, InterruptWhen};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Failure of the node whose fallback edge scheduled the current task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub error: String,
}

/// Task state that outlives a single attempt
#[derive(Debug, Default)]
pub(crate) struct Scratchpad {
    /// Answers to the task's interrupts, in call order
    pub(crate) resume: Vec<Value>,
    /// Interrupt calls made by the current attempt
    pub(crate) counter: usize,
    pub(crate) journal: BTreeMap<String, Value>,
    /// Set when the current attempt asked to suspend
    pub(crate) pending_interrupt: Option<InterruptRecord>,
}

impl Scratchpad {
    pub(crate) fn new(resume: Vec<Value>, journal: BTreeMap<String, Value>) -> Self {
        Self {
            resume,
            journal,
            ..Self::default()
        }
    }

    /// Reset the per-attempt part before a retry
    pub(crate) fn begin_attempt(&mut self) {
        self.counter = 0;
        self.pending_interrupt = None;
    }
}

pub(crate) type SharedScratchpad = Arc<Mutex<Scratchpad>>;

struct ContextInner {
    node: String,
    task_id: String,
    step: i64,
    thread_id: String,
    attempt: usize,
    configurable: Arc<HashMap<String, Value>>,
    failure: Option<NodeFailure>,
    stream: Option<Arc<StreamMultiplexer>>,
    scratch: SharedScratchpad,
}

/// Handle a node body uses to talk to the scheduler
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.inner.node)
            .field("task_id", &self.inner.task_id)
            .field("step", &self.inner.step)
            .field("attempt", &self.inner.attempt)
            .finish()
    }
}

/// Everything the executor knows about a task when it builds its context
pub(crate) struct ContextParts {
    pub(crate) node: String,
    pub(crate) task_id: String,
    pub(crate) step: i64,
    pub(crate) thread_id: String,
    pub(crate) attempt: usize,
    pub(crate) configurable: Arc<HashMap<String, Value>>,
    pub(crate) failure: Option<NodeFailure>,
    pub(crate) stream: Option<Arc<StreamMultiplexer>>,
    pub(crate) scratch: SharedScratchpad,
}

impl NodeContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                node: parts.node,
                task_id: parts.task_id,
                step: parts.step,
                thread_id: parts.thread_id,
                attempt: parts.attempt,
                configurable: parts.configurable,
                failure: parts.failure,
                stream: parts.stream,
                scratch: parts.scratch,
            }),
        }
    }

    /// Name of the running node
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Identity of the task, stable across retries and resumes
    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    /// Superstep index
    pub fn step(&self) -> i64 {
        self.inner.step
    }

    /// Run identity
    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> usize {
        self.inner.attempt
    }

    /// Caller supplied value by key
    pub fn config(&self, key: &str) -> Option<&Value> {
        self.inner.configurable.get(key)
    }

    /// All caller supplied values
    pub fn configurable(&self) -> &HashMap<String, Value> {
        &self.inner.configurable
    }

    /// The failure that routed control here through a fallback edge
    pub fn failure(&self) -> Option<&NodeFailure> {
        self.inner.failure.as_ref()
    }

    /// Suspend the run and surface `payload` to the caller
    ///
    /// Returns the resume value once the run is resumed. The error must be
    /// propagated out of the node body; swallowing it still suspends the task.
    pub fn interrupt(&self, payload: Value) -> Result<Value> {
        let mut scratch = self.inner.scratch.lock();
        let index = scratch.counter;
        scratch.counter += 1;

        if let Some(answer) = scratch.resume.get(index) {
            debug!(task_id = %self.inner.task_id, index, "Interrupt answered from resume values");
            return Ok(answer.clone());
        }

        let record = InterruptRecord {
            id: format!("{}:{}", self.inner.task_id, index),
            task_id: self.inner.task_id.clone(),
            node: self.inner.node.clone(),
            step: self.inner.step,
            when: InterruptWhen::During,
            value: payload,
        };
        if scratch.pending_interrupt.is_none() {
            scratch.pending_interrupt = Some(record.clone());
        }
        Err(GraphError::Interrupt(record))
    }

    /// Run `f` once per task, replaying its recorded result afterwards
    ///
    /// `key` must be unique within the task. The result is stored as JSON.
    pub async fn run_once<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let recorded = self.inner.scratch.lock().journal.get(key).cloned();
        if let Some(value) = recorded {
            debug!(task_id = %self.inner.task_id, key, "Replaying journaled side effect");
            return Ok(serde_json::from_value(value)?);
        }

        let result = f().await?;
        let value = serde_json::to_value(&result)?;
        self.inner.scratch.lock().journal.insert(key.to_string(), value);
        Ok(result)
    }

    /// Publish a payload to `custom` stream subscribers
    pub fn emit(&self, data: Value) {
        if let Some(stream) = &self.inner.stream {
            stream.emit(StreamEvent::Custom {
                node: self.inner.node.clone(),
                task_id: self.inner.task_id.clone(),
                data,
            });
        }
    }

    /// Publish a piece of output to `messages` stream subscribers
    pub fn emit_token(&self, text: impl Into<String>) {
        if let Some(stream) = &self.inner.stream {
            stream.emit(StreamEvent::Token {
                node: self.inner.node.clone(),
                task_id: self.inner.task_id.clone(),
                text: text.into(),
            });
        }
    }
}
