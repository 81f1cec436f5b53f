//! Graph definition: nodes, edges and channels before compilation
//!
//! A [`Graph`] is plain data collected by [`StateGraph`](crate::StateGraph).
//! Nothing in it is validated until [`compile`](crate::StateGraph::compile)
//! turns it into an [`ExecutionPlan`](crate::pregel::ExecutionPlan).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Graph                            │
//! │                                                          │
//! │  START ──► plan ──► research ──┐                         │
//! │                  └─► draft ────┴─(join)─► review ─┬─► END │
//! │                                                   │      │
//! │                               router(state) ──────┘      │
//! │                                                          │
//! │  channels: { "notes": Append, "draft": LastValue }       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Edge kinds
//!
//! | Edge | Fires when | Schedules |
//! |------|-----------|-----------|
//! | [`Edge::Direct`] | source task completes | target in the next superstep |
//! | [`Edge::Join`] | every source completed at least once since the target last ran | target |
//! | [`Edge::Conditional`] | source task completes | whatever the router returns, evaluated on the merged state |
//! | [`Edge::Fallback`] | source exhausts its retries | target, with the failure in its context |
//!
//! Node bodies are resolved to function pointers once; the scheduler never
//! looks a node up by name to call it.

use crate::command::NodeOutput;
use crate::error::Result;
use crate::interrupt::InterruptConfig;
use crate::retry::RetryPolicy;
use crate::runtime::NodeContext;
use crate::send::ConditionalEdgeResult;
use crate::state::ChannelSpec;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a node in the graph
pub type NodeId = String;

/// Special node identifier for graph entry point
///
/// `START` never runs; edges leaving it fire when input is written.
pub const START: &str = "__start__";

/// Special node identifier for graph termination
///
/// Routing to `END` schedules nothing.
pub const END: &str = "__end__";

/// Internal channel carrying fan-out instructions between supersteps
pub const TASKS: &str = "__tasks__";

/// Type-erased async node body
pub type NodeFn = Arc<dyn Fn(Value, NodeContext) -> BoxFuture<'static, Result<NodeOutput>> + Send + Sync>;

/// Conditional edge router
pub type RouterFn = Arc<dyn Fn(&Value) -> ConditionalEdgeResult + Send + Sync>;

/// What running a node does
#[derive(Clone)]
pub enum NodeKind {
    /// Call a user function
    Function(NodeFn),
    /// Write nothing; only exists to hang edges on
    Passthrough,
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Function(_) => f.write_str("Function(<function>)"),
            NodeKind::Passthrough => f.write_str("Passthrough"),
        }
    }
}

/// Per-node settings
///
/// ```rust
/// use stategraph_core::{NodeOptions, RetryPolicy};
/// use std::time::Duration;
///
/// let options = NodeOptions::new()
///     .reads(["query"])
///     .writes(["results"])
///     .retry(RetryPolicy::new(3))
///     .timeout(Duration::from_secs(10));
/// assert_eq!(options.writes.as_deref(), Some(&["results".to_string()][..]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Channels included in the node's input; all channels when unset
    pub reads: Option<Vec<String>>,

    /// Channels the node may write; all channels when unset
    pub writes: Option<Vec<String>>,

    /// Nodes a `Command` returned by this node may route to
    pub destinations: Vec<String>,

    /// Overrides the engine's default retry policy
    pub retry: Option<RetryPolicy>,

    /// Overrides the engine's per-attempt deadline
    pub timeout: Option<Duration>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn writes<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn destinations<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A registered node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    pub kind: NodeKind,
    pub options: NodeOptions,
}

/// Router plus the nodes it may return
#[derive(Clone)]
pub struct Branch {
    pub router: RouterFn,
    pub destinations: Vec<NodeId>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("router", &"<function>")
            .field("destinations", &self.destinations)
            .finish()
    }
}

/// Transition between nodes
#[derive(Debug, Clone)]
pub enum Edge {
    /// Unconditional transition
    Direct { from: NodeId, to: NodeId },

    /// Waiting edge: `target` runs once all `sources` completed
    Join { sources: Vec<NodeId>, target: NodeId },

    /// Router evaluated against the merged state
    Conditional { from: NodeId, branch: Branch },

    /// Taken instead of failing the superstep when `from` exhausts its retries
    Fallback { from: NodeId, to: NodeId },
}

/// Collected definition of a graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Nodes in registration order, which is also task order
    pub nodes: Vec<NodeSpec>,

    pub channels: Vec<ChannelSpec>,

    pub edges: Vec<Edge>,

    pub interrupts: InterruptConfig,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Look up a channel by name
    pub fn channel(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Reducer;

    #[test]
    fn test_lookup() {
        let mut graph = Graph::new();
        graph.nodes.push(NodeSpec {
            name: "a".into(),
            kind: NodeKind::Passthrough,
            options: NodeOptions::new().writes(["x"]),
        });
        graph.channels.push(ChannelSpec::new("x", Reducer::Sum));

        assert!(graph.node("a").is_some());
        assert!(graph.node("b").is_none());
        assert!(graph.channel("x").unwrap().reducer.accepts_concurrent_writes());
    }

    #[test]
    fn test_debug_hides_functions() {
        let branch = Branch {
            router: Arc::new(|_| ConditionalEdgeResult::End),
            destinations: vec!["a".into()],
        };
        let text = format!("{:?}", Edge::Conditional { from: "s".into(), branch });
        assert!(text.contains("<function>"));
        assert!(text.contains("destinations"));
    }
}
