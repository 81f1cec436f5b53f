//! CompiledGraph execution engine for running stateful workflows
//!
//! Once a graph is built with [`StateGraph`](crate::StateGraph) and compiled,
//! it becomes a [`CompiledGraph`]: an immutable plan that can run any number
//! of times, concurrently, each run identified by a thread id.
//!
//! # Overview
//!
//! - **Deterministic Execution** - Same input + checkpoint = same checkpoints
//! - **Parallel Processing** - Nodes of one superstep run concurrently
//! - **State Persistence** - One checkpoint per superstep
//! - **Real-time Streaming** - Seven stream modes, many subscribers per run
//! - **Human-in-the-Loop** - Suspend with a payload, resume with an answer
//! - **Time Travel** - Continue or fork from any historical checkpoint
//!
//! # Entry points
//!
//! | Method | Returns |
//! |--------|---------|
//! | [`invoke`](CompiledGraph::invoke) | [`RunOutcome`] once the run stops |
//! | [`resume`](CompiledGraph::resume) | [`RunOutcome`] after answering open interrupts |
//! | [`stream`](CompiledGraph::stream) | [`RunStream`] of chunks in the requested modes |
//! | [`get_state`](CompiledGraph::get_state) | [`StateSnapshot`] with the nodes that run next |
//! | [`get_state_history`](CompiledGraph::get_state_history) | snapshots, newest first |
//! | [`update_state`](CompiledGraph::update_state) | config of the checkpoint holding the edit |
//!
//! Every entry point consults the registered [`AccessHook`](crate::AccessHook)s
//! first.

mod execution;
mod graph;
mod state;
mod streaming;
pub(crate) mod types;
#[cfg(test)]
mod tests;

pub use graph::CompiledGraph;
pub use types::{RunOutcome, RunStatus, RunStream, StateSnapshot, StateSnapshotStream};
