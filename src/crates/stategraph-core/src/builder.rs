//! StateGraph builder API for constructing stateful graph workflows
//!
//! [`StateGraph`] collects channels, nodes, edges and breakpoints through a
//! fluent `&mut Self` interface, then [`compile`](StateGraph::compile)s them
//! into an immutable [`CompiledGraph`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  StateGraph (Builder)                                   │
//! │                                                         │
//! │  channels: log (Append), status (LastValue), ...        │
//! │                                                         │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐             │
//! │  │  Node A  │──→│  Node B  │──→│  Node C  │             │
//! │  └──────────┘   └──────────┘   └──────────┘             │
//! └─────────────────────────────────────────────────────────┘
//!                       │ compile()
//!                       ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  CompiledGraph (Executable)                             │
//! │                                                         │
//! │  • Validated plan shared by every run                   │
//! │  • Superstep execution with checkpoints                 │
//! │  • Interrupts, resume and time travel                   │
//! │  • Streaming                                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Edge kinds
//!
//! | Method | Behaviour |
//! |--------|-----------|
//! | [`add_edge`](StateGraph::add_edge) | `to` runs in the superstep after `from` |
//! | [`add_join`](StateGraph::add_join) | `to` runs once every source has completed |
//! | [`add_conditional_edges`](StateGraph::add_conditional_edges) | router picks targets or sends from the merged state |
//! | [`add_fallback_edge`](StateGraph::add_fallback_edge) | `to` runs instead of failing the run when `from` exhausts its retries |
//!
//! # Quick Start
//!
//! ```rust
//! use stategraph_core::{Reducer, StateGraph, END, START};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new();
//! graph.add_channel("log", Reducer::Append);
//!
//! graph.add_node("a", |_state, _ctx| async move { Ok(json!({"log": ["A"]})) });
//! graph.add_node("b", |_state, _ctx| async move { Ok(json!({"log": ["B"]})) });
//!
//! graph.add_edge(START, "a");
//! graph.add_edge("a", "b");
//! graph.add_edge("b", END);
//!
//! let compiled = graph.compile()?;
//! let outcome = compiled.invoke(json!({}), Default::default()).await?;
//! assert_eq!(outcome.state["log"], json!(["A", "B"]));
//! # Ok(())
//! # }
//! ```

use crate::command::NodeOutput;
use crate::compiled::CompiledGraph;
use crate::error::{CompileError, Result};
use crate::graph::{Branch, Edge, Graph, NodeFn, NodeId, NodeKind, NodeOptions, NodeSpec, END, START};
use crate::runtime::NodeContext;
use crate::pregel::ExecutionPlan;
use crate::send::ConditionalEdgeResult;
use crate::state::{ChannelSpec, Reducer};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Builder for stateful graphs
///
/// Definition problems are collected while building and reported by
/// [`compile`](StateGraph::compile), so every method can return `&mut Self`.
#[derive(Debug, Default)]
pub struct StateGraph {
    graph: Graph,
    /// First problem found while building, reported by `compile`
    deferred: Option<CompileError>,
}

impl StateGraph {
    /// Creates an empty builder
    ///
    /// ```rust
    /// use stategraph_core::StateGraph;
    ///
    /// let graph = StateGraph::new();
    /// assert!(graph.graph().nodes.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state channel
    pub fn add_channel(&mut self, name: impl Into<String>, reducer: Reducer) -> &mut Self {
        self.push_channel(ChannelSpec::new(name, reducer))
    }

    /// Declare a state channel with the value it starts with on a fresh run
    pub fn add_channel_with_default(
        &mut self,
        name: impl Into<String>,
        reducer: Reducer,
        default: Value,
    ) -> &mut Self {
        self.push_channel(ChannelSpec::new(name, reducer).with_default(default))
    }

    fn push_channel(&mut self, spec: ChannelSpec) -> &mut Self {
        if self.graph.channel(&spec.name).is_some() {
            self.defer(CompileError::DuplicateChannel(spec.name.clone()));
        } else {
            self.graph.channels.push(spec);
        }
        self
    }

    /// Add a node with default options
    ///
    /// The body receives its state slice and a [`NodeContext`] and returns
    /// anything convertible into a [`NodeOutput`]: a partial update
    /// `Value`, a [`Command`](crate::Command) or `()`.
    pub fn add_node<F, Fut, T>(&mut self, name: impl Into<NodeId>, body: F) -> &mut Self
    where
        F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Into<NodeOutput>,
    {
        self.add_node_with(name, NodeOptions::new(), body)
    }

    /// Add a node with explicit reads, writes, destinations, retry or timeout
    pub fn add_node_with<F, Fut, T>(&mut self, name: impl Into<NodeId>, options: NodeOptions, body: F) -> &mut Self
    where
        F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Into<NodeOutput>,
    {
        let func: NodeFn = Arc::new(move |state, ctx| body(state, ctx).map(|r| r.map(Into::into)).boxed());
        self.push_node(NodeSpec {
            name: name.into(),
            kind: NodeKind::Function(func),
            options,
        })
    }

    /// Add a node that writes nothing
    ///
    /// Useful as a junction to hang edges on.
    pub fn add_passthrough(&mut self, name: impl Into<NodeId>) -> &mut Self {
        self.push_node(NodeSpec {
            name: name.into(),
            kind: NodeKind::Passthrough,
            options: NodeOptions::new(),
        })
    }

    fn push_node(&mut self, spec: NodeSpec) -> &mut Self {
        if self.graph.node(&spec.name).is_some() {
            self.defer(CompileError::DuplicateNode(spec.name.clone()));
        } else {
            self.graph.nodes.push(spec);
        }
        self
    }

    /// `to` runs in the superstep after `from` completes
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph.edges.push(Edge::Direct {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// `to` runs once, after every node in `sources` has completed
    ///
    /// The sources may complete in different supersteps.
    pub fn add_join<I, S>(&mut self, sources: I, to: impl Into<NodeId>) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.graph.edges.push(Edge::Join {
            sources: sources.into_iter().map(Into::into).collect(),
            target: to.into(),
        });
        self
    }

    /// Route from `from` with `router`, evaluated against the merged state
    ///
    /// `destinations` lists every node the router may return or send to;
    /// anything else is rejected at run time with
    /// [`GraphError::InvalidRoute`](crate::GraphError::InvalidRoute).
    pub fn add_conditional_edges<F, I, S>(&mut self, from: impl Into<NodeId>, router: F, destinations: I) -> &mut Self
    where
        F: Fn(&Value) -> ConditionalEdgeResult + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.graph.edges.push(Edge::Conditional {
            from: from.into(),
            branch: Branch {
                router: Arc::new(router),
                destinations: destinations.into_iter().map(Into::into).collect(),
            },
        });
        self
    }

    /// Schedule `to` instead of failing the run when `from` exhausts its retries
    pub fn add_fallback_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph.edges.push(Edge::Fallback {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Shorthand for `add_edge(START, node)`
    pub fn set_entry_point(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.add_edge(START, node)
    }

    /// Shorthand for `add_edge(node, END)`
    pub fn set_finish_point(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.add_edge(node, END)
    }

    /// Suspend the run before any of `nodes` executes
    pub fn interrupt_before<I, S>(&mut self, nodes: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.graph
            .interrupts
            .interrupt_before
            .extend(nodes.into_iter().map(Into::into));
        self
    }

    /// Suspend the run after the superstep in which any of `nodes` ran
    pub fn interrupt_after<I, S>(&mut self, nodes: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.graph
            .interrupts
            .interrupt_after
            .extend(nodes.into_iter().map(Into::into));
        self
    }

    /// The definition collected so far
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Validate the definition and build an executable graph
    ///
    /// # Errors
    ///
    /// [`GraphError::Compile`](crate::GraphError::Compile) naming the node,
    /// edge or channel at fault. Problems found while building (duplicate
    /// names) are reported before structural ones.
    ///
    /// ```rust
    /// use stategraph_core::{CompileError, GraphError, StateGraph, START};
    ///
    /// let mut graph = StateGraph::new();
    /// graph.add_passthrough("a").add_edge(START, "missing");
    /// let err = graph.compile().unwrap_err();
    /// assert!(matches!(err, GraphError::Compile(CompileError::UnknownNode { .. })));
    /// ```
    pub fn compile(self) -> Result<CompiledGraph> {
        if let Some(err) = self.deferred {
            return Err(err.into());
        }
        let plan = ExecutionPlan::compile(&self.graph)?;
        Ok(CompiledGraph::new(plan))
    }

    fn defer(&mut self, err: CompileError) {
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }
}
