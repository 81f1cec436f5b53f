//! Fan-out: one routing decision, many tasks
//!
//! A conditional edge normally names the nodes that run next; every one of
//! them reads the shared state. Returning [`Send`] instructions instead
//! schedules one *push task* per instruction, each receiving its own input
//! payload rather than a state slice. All push tasks of a superstep run
//! alongside the edge-triggered tasks of that superstep and are ordered by
//! the position of their `Send` in the routing result.
//!
//! ```text
//!          router(state)
//!   ┌──────────┼──────────┐
//!   ▼          ▼          ▼
//! Send(p,1)  Send(p,2)  Send(p,3)     one superstep, three tasks
//!   │          │          │
//!   └──────────┼──────────┘
//!              ▼
//!        "results" (Append)           writes merged in one batch
//! ```
//!
//! # Example
//!
//! ```rust
//! use stategraph_core::{ConditionalEdgeResult, Reducer, Send, StateGraph, END, START};
//! use serde_json::{json, Value};
//!
//! let mut graph = StateGraph::new();
//! graph.add_channel("items", Reducer::LastValue);
//! graph.add_channel("results", Reducer::Append);
//! graph.add_passthrough("split");
//! graph.add_node("square", |input: Value, _ctx| async move {
//!     let n = input.as_i64().unwrap_or_default();
//!     Ok(json!({"results": [n * n]}))
//! });
//! graph.add_edge(START, "split");
//! graph.add_conditional_edges(
//!     "split",
//!     |state: &Value| {
//!         let items = state["items"].as_array().cloned().unwrap_or_default();
//!         ConditionalEdgeResult::Send(
//!             items.into_iter().map(|item| Send::new("square", item)).collect(),
//!         )
//!     },
//!     ["square"],
//! );
//! graph.add_edge("square", END);
//! assert!(graph.compile().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Instruction to run `node` once with `arg` as its input
///
/// ```rust
/// use stategraph_core::Send;
///
/// let send = Send::new("process", serde_json::json!({"id": 7}));
/// assert_eq!(send.node(), "process");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    /// Target node to invoke
    node: String,

    /// Input handed to the target node
    arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    /// Target node name
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Input of the task
    pub fn arg(&self) -> &Value {
        &self.arg
    }

    /// Consume the Send and return its parts
    pub fn into_parts(self) -> (String, Value) {
        (self.node, self.arg)
    }
}

/// Return type of conditional edge routers
///
/// Every node named here, directly or through a `Send`, must appear among
/// the destinations declared with the conditional edge. Anything else is an
/// [`InvalidRoute`](crate::GraphError::InvalidRoute) at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalEdgeResult {
    /// Route to a single node
    Node(String),
    /// Route to several nodes; all of them run in the next superstep
    Nodes(Vec<String>),
    /// Fan out with per-task inputs
    Send(Vec<Send>),
    /// Route nowhere
    End,
}

impl ConditionalEdgeResult {
    /// Node names this result refers to, in order
    pub fn targets(&self) -> Vec<&str> {
        match self {
            ConditionalEdgeResult::Node(node) => vec![node.as_str()],
            ConditionalEdgeResult::Nodes(nodes) => nodes.iter().map(String::as_str).collect(),
            ConditionalEdgeResult::Send(sends) => sends.iter().map(Send::node).collect(),
            ConditionalEdgeResult::End => Vec::new(),
        }
    }
}

impl From<&str> for ConditionalEdgeResult {
    fn from(node: &str) -> Self {
        ConditionalEdgeResult::Node(node.to_string())
    }
}

impl From<String> for ConditionalEdgeResult {
    fn from(node: String) -> Self {
        ConditionalEdgeResult::Node(node)
    }
}

impl From<Vec<String>> for ConditionalEdgeResult {
    fn from(nodes: Vec<String>) -> Self {
        ConditionalEdgeResult::Nodes(nodes)
    }
}

impl From<Vec<&str>> for ConditionalEdgeResult {
    fn from(nodes: Vec<&str>) -> Self {
        ConditionalEdgeResult::Nodes(nodes.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<Send>> for ConditionalEdgeResult {
    fn from(sends: Vec<Send>) -> Self {
        ConditionalEdgeResult::Send(sends)
    }
}

impl From<Send> for ConditionalEdgeResult {
    fn from(send: Send) -> Self {
        ConditionalEdgeResult::Send(vec![send])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_parts() {
        let send = Send::new("worker", json!({"n": 1}));
        assert_eq!(send.arg(), &json!({"n": 1}));
        let (node, arg) = send.into_parts();
        assert_eq!(node, "worker");
        assert_eq!(arg["n"], 1);
    }

    #[test]
    fn test_send_serde_shape() {
        let send = Send::new("worker", json!(3));
        let value = serde_json::to_value(&send).unwrap();
        assert_eq!(value, json!({"node": "worker", "arg": 3}));
        let back: Send = serde_json::from_value(value).unwrap();
        assert_eq!(back, send);
    }

    #[test]
    fn test_result_targets() {
        let result: ConditionalEdgeResult = vec!["a", "b"].into();
        assert_eq!(result.targets(), vec!["a", "b"]);

        let fanout: ConditionalEdgeResult =
            vec![Send::new("w", json!(1)), Send::new("w", json!(2))].into();
        assert_eq!(fanout.targets(), vec!["w", "w"]);

        assert!(ConditionalEdgeResult::End.targets().is_empty());
    }
}
