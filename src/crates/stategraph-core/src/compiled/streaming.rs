//! Streaming execution methods
//!
//! A streamed run executes on its own tokio task. The returned stream
//! yields the run's chunks in emission order and ends when the run does;
//! a failed run contributes its error as the last item.
//!
//! The stream only observes the run. Dropping it leaves the run going to
//! completion, checkpoints included; stop it with the token passed through
//! [`RunConfig::with_cancellation`].
//!
//! ```text
//!   stream() ──spawn──► PregelLoop ──emit──► StreamMultiplexer
//!      │                                           │
//!      └──────────── RunStream ◄── Subscription ◄──┘
//! ```

use super::graph::require_thread_id;
use super::types::RunStream;
use super::CompiledGraph;
use crate::auth::AccessAction;
use crate::command::ResumeValue;
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::pregel::loop_impl::RunInput;
use crate::stream::{StreamMode, StreamMultiplexer};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

impl CompiledGraph {
    /// Run the graph and stream its events in `modes`
    ///
    /// An empty mode list streams [`StreamMode::Values`]. The subscriber's
    /// buffer follows [`EngineConfig::stream_buffer`](crate::EngineConfig::stream_buffer).
    ///
    /// Dropping the returned stream does not stop the run. Cancel the token
    /// given to [`RunConfig::with_cancellation`] for that.
    ///
    /// ```rust
    /// use stategraph_core::{Reducer, RunConfig, StateGraph, StreamEvent, StreamMode, START, END};
    /// use futures::StreamExt;
    /// use serde_json::json;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut graph = StateGraph::new();
    /// graph.add_channel("log", Reducer::Append);
    /// graph.add_node("a", |_, _| async { Ok(json!({"log": ["A"]})) });
    /// graph.add_edge(START, "a").add_edge("a", END);
    ///
    /// let compiled = graph.compile()?;
    /// let mut stream = compiled
    ///     .stream(json!({}), RunConfig::default(), &[StreamMode::Updates])
    ///     .await?;
    /// while let Some(chunk) = stream.next().await {
    ///     if let StreamEvent::Updates { node, .. } = chunk?.event {
    ///         assert_eq!(node, "a");
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip(self, input, config), fields(thread_id = ?config.thread_id))]
    pub async fn stream(&self, input: Value, config: RunConfig, modes: &[StreamMode]) -> Result<RunStream> {
        self.spawn_streamed(AccessAction::Stream, RunInput::Invoke(input), config, modes)
            .await
    }

    /// Resume a suspended run and stream its events in `modes`
    ///
    /// Like [`stream`](Self::stream), the run outlives the returned stream.
    #[tracing::instrument(skip(self, value, config), fields(thread_id = ?config.thread_id))]
    pub async fn stream_resume(
        &self,
        value: impl Into<ResumeValue>,
        config: RunConfig,
        modes: &[StreamMode],
    ) -> Result<RunStream> {
        require_thread_id(config.thread_id.as_deref())?;
        self.spawn_streamed(AccessAction::Resume, RunInput::Resume(value.into()), config, modes)
            .await
    }

    async fn spawn_streamed(
        &self,
        action: AccessAction,
        input: RunInput,
        config: RunConfig,
        modes: &[StreamMode],
    ) -> Result<RunStream> {
        let mux = Arc::new(StreamMultiplexer::new());
        let mut subscription = mux.subscribe(modes, self.config.stream_buffer);
        let run = self.prepare(action, config, Some(mux.clone())).await?;
        let thread_id = run.thread_id().to_string();

        let handle = tokio::spawn(async move {
            let result = run.run(input).await;
            mux.close();
            result
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(chunk) = subscription.recv().await {
                yield Ok(chunk);
            }
            if subscription.dropped() > 0 {
                debug!(thread_id = %thread_id, dropped = subscription.dropped(), "Stream ended with dropped chunks");
            }
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => yield Err(e),
                Err(e) => yield Err(GraphError::Execution(format!("run task failed: {}", e))),
            }
        }))
    }
}
