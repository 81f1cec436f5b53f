//! # stategraph-core - Stateful graphs on a superstep scheduler
//!
//! Build a graph of async nodes that share named state channels, then run
//! it with checkpointing, human-in-the-loop interrupts, time travel and
//! streaming.
//!
//! ## Core Concepts
//!
//! ### 1. StateGraph
//!
//! [`StateGraph`] is the entry point for defining graphs:
//! - **Channels**: named state fields, each with a [`Reducer`] deciding how
//!   writes are merged
//! - **Nodes**: async functions receiving state and returning a partial
//!   update or a [`Command`]
//! - **Edges**: direct, join, conditional and fallback transitions
//!
//! ### 2. Supersteps
//!
//! Execution follows the bulk-synchronous model of Google's Pregel:
//! - Every node scheduled in a superstep sees the same state
//! - Their writes are merged at the barrier, in task order
//! - Routing decisions are taken against the merged state
//! - A checkpoint is written after every superstep
//!
//! ### 3. Checkpointing & Time Travel
//!
//! With a [`CheckpointSaver`] every run is a thread of checkpoints:
//! - **Resume** after a crash from the last checkpoint
//! - **Inspect** any checkpoint with [`CompiledGraph::get_state_history`]
//! - **Fork** by continuing from an older checkpoint id
//!
//! ### 4. Human-in-the-Loop
//!
//! - [`NodeContext::interrupt`] suspends a task with a payload
//! - `interrupt_before` / `interrupt_after` breakpoints suspend the run
//!   around named nodes
//! - [`CompiledGraph::resume`] answers the open interrupts
//! - [`CompiledGraph::update_state`] edits state while suspended
//!
//! ## Quick Start
//!
//! ```rust
//! use stategraph_core::{Reducer, RunConfig, StateGraph, START, END};
//! use stategraph_core::InMemoryCheckpointSaver;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new();
//! graph.add_channel("log", Reducer::Append);
//!
//! graph.add_node("draft", |_, _| async { Ok(json!({"log": ["draft"]})) });
//! graph.add_node("review", |_, ctx| async move {
//!     let verdict = ctx.interrupt(json!({"q": "approve?"}))?;
//!     Ok(json!({"log": [format!("review:{}", verdict.as_str().unwrap_or("?"))]}))
//! });
//! graph.add_node("publish", |_, _| async { Ok(json!({"log": ["publish"]})) });
//!
//! graph.add_edge(START, "draft")
//!     .add_edge("draft", "review")
//!     .add_edge("review", "publish")
//!     .add_edge("publish", END);
//!
//! let compiled = graph
//!     .compile()?
//!     .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
//! let config = RunConfig::new("article-7");
//!
//! let paused = compiled.invoke(json!({}), config.clone()).await?;
//! assert_eq!(paused.interrupts()[0].value, json!({"q": "approve?"}));
//!
//! let done = compiled.resume("yes", config).await?;
//! assert_eq!(done.state["log"], json!(["draft", "review:yes", "publish"]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`builder`] | `StateGraph` builder |
//! | [`graph`] | Graph definition types |
//! | [`pregel`] | Compiler and superstep scheduler |
//! | [`compiled`] | Invocation API |
//! | [`state`] | Channel declarations and reducers |
//! | [`interrupt`] | Breakpoints and resume handling |
//! | [`runtime`] | Context handed to node bodies |
//! | [`stream`] | Stream modes and multiplexer |
//! | [`config`] | Engine and per-run configuration |
//! | [`auth`] | Access hooks |
//! | [`retry`] | Retry policies |
//! | [`error`] | Error taxonomy |

pub mod auth;
pub mod builder;
pub mod command;
pub mod compiled;
pub mod config;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod messages;
pub mod pregel;
pub mod retry;
pub mod runtime;
pub mod send;
pub mod state;
pub mod stream;

pub use auth::{AccessAction, AccessHook, AccessRequest};
pub use builder::StateGraph;
pub use command::{Command, GotoTarget, NodeOutput, ResumeValue};
pub use compiled::{CompiledGraph, RunOutcome, RunStatus, RunStream, StateSnapshot, StateSnapshotStream};
pub use config::{EngineConfig, RunConfig};
pub use error::{CompileError, GraphError, Result};
pub use graph::{Branch, Edge, Graph, NodeFn, NodeId, NodeKind, NodeOptions, NodeSpec, RouterFn, END, START, TASKS};
pub use interrupt::InterruptConfig;
pub use pregel::ExecutionPlan;
pub use retry::{RetryOn, RetryPolicy, RetryPredicate};
pub use runtime::{NodeContext, NodeFailure};
pub use send::{ConditionalEdgeResult, Send};
pub use state::{ChannelSpec, CustomReducer, Reducer};
pub use stream::{BufferPolicy, StreamChunk, StreamEvent, StreamMode, StreamMultiplexer, Subscription};

pub use stategraph_checkpoint::{
    CheckpointConfig, CheckpointSaver, FileCheckpointSaver, InMemoryCheckpointSaver, InterruptRecord, InterruptWhen,
    TaskRecord, TaskStatus,
};
pub use tokio_util::sync::CancellationToken;
