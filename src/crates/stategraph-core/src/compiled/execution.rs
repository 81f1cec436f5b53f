//! Graph execution methods (invoke, resume)

use super::graph::require_thread_id;
use super::types::RunOutcome;
use super::CompiledGraph;
use crate::auth::AccessAction;
use crate::command::ResumeValue;
use crate::config::RunConfig;
use crate::error::Result;
use crate::pregel::loop_impl::{PregelLoop, RunInput};
use crate::stream::StreamMultiplexer;
use serde_json::Value;
use std::sync::Arc;

impl CompiledGraph {
    /// Run the graph until it finishes, suspends or runs out of steps.
    ///
    /// With a checkpointer and a `thread_id`, the run continues from the
    /// thread's latest checkpoint (or `config.checkpoint_id`). `input` is
    /// written through the channels' reducers before the first superstep;
    /// `Value::Null` on an existing thread continues without new input.
    ///
    /// # Returns
    ///
    /// A [`RunOutcome`] whose status tells why the run stopped. A step
    /// limit, an interrupt or a cancellation is not an error.
    ///
    /// # Errors
    ///
    /// - [`GraphError::RunSuspended`](crate::GraphError::RunSuspended) when the
    ///   thread waits for [`resume`](Self::resume)
    /// - merge and node failures, after which the thread still holds its last
    ///   good checkpoint
    ///
    /// # Example
    ///
    /// ```rust
    /// use stategraph_core::{Reducer, RunConfig, StateGraph, START, END};
    /// use stategraph_checkpoint::InMemoryCheckpointSaver;
    /// use serde_json::json;
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut graph = StateGraph::new();
    /// graph.add_channel("count", Reducer::Sum);
    /// graph.add_node("inc", |_, _| async { Ok(json!({"count": 1})) });
    /// graph.add_edge(START, "inc").add_edge("inc", END);
    ///
    /// let compiled = graph
    ///     .compile()?
    ///     .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
    ///
    /// // Turn 1 and turn 2 share the thread, so the sum accumulates
    /// compiled.invoke(json!({}), RunConfig::new("counter")).await?;
    /// let outcome = compiled.invoke(json!({}), RunConfig::new("counter")).await?;
    /// assert_eq!(outcome.state["count"], json!(2));
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip(self, input, config), fields(thread_id = ?config.thread_id))]
    pub async fn invoke(&self, input: Value, config: RunConfig) -> Result<RunOutcome> {
        self.execute(AccessAction::Invoke, RunInput::Invoke(input), config, None)
            .await
    }

    /// Answer open interrupts and continue the suspended run.
    ///
    /// A bare value answers the only open interrupt; a map keyed by
    /// interrupt id answers several. Tasks whose interrupt got no answer
    /// stay suspended and the run returns `Interrupted` again.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NothingToResume`](crate::GraphError::NothingToResume)
    /// - [`GraphError::AmbiguousResume`](crate::GraphError::AmbiguousResume)
    ///   for a bare value while several interrupts are open
    /// - [`GraphError::UnknownInterrupt`](crate::GraphError::UnknownInterrupt)
    #[tracing::instrument(skip(self, value, config), fields(thread_id = ?config.thread_id))]
    pub async fn resume(&self, value: impl Into<ResumeValue>, config: RunConfig) -> Result<RunOutcome> {
        require_thread_id(config.thread_id.as_deref())?;
        self.execute(AccessAction::Resume, RunInput::Resume(value.into()), config, None)
            .await
    }

    /// Like [`invoke`](Self::invoke), publishing events to a caller-owned
    /// multiplexer.
    ///
    /// Subscribe to `stream` before calling; the multiplexer is not closed
    /// when the run ends.
    #[tracing::instrument(skip(self, input, config, stream), fields(thread_id = ?config.thread_id))]
    pub async fn invoke_observed(
        &self,
        input: Value,
        config: RunConfig,
        stream: Arc<StreamMultiplexer>,
    ) -> Result<RunOutcome> {
        self.execute(AccessAction::Invoke, RunInput::Invoke(input), config, Some(stream))
            .await
    }

    /// Build, authorize and drive one run
    pub(crate) async fn execute(
        &self,
        action: AccessAction,
        input: RunInput,
        config: RunConfig,
        stream: Option<Arc<StreamMultiplexer>>,
    ) -> Result<RunOutcome> {
        let run = self.prepare(action, config, stream).await?;
        run.run(input).await
    }

    /// A loop for `config` whose caller passed the access hooks
    pub(crate) async fn prepare(
        &self,
        action: AccessAction,
        config: RunConfig,
        stream: Option<Arc<StreamMultiplexer>>,
    ) -> Result<PregelLoop> {
        let configurable = config.configurable.clone();
        let run = PregelLoop::new(
            self.plan.clone(),
            self.checkpoint_saver.clone(),
            self.config.clone(),
            config,
            stream,
        )?;
        self.authorize(action, run.thread_id(), &configurable).await?;
        Ok(run)
    }
}
