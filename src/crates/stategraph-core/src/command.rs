//! Node return values and dynamic control flow
//!
//! A node body returns a [`NodeOutput`]: either a plain partial update, or a
//! [`Command`] that combines an update with routing instructions.
//!
//! ```text
//! NodeOutput
//! ├── Update(Value)          {"field": value, ...} or null
//! └── Command
//!     ├── update             same shape as Update
//!     └── goto               nodes and/or Sends to schedule next
//! ```
//!
//! Goto targets are added to whatever the node's static edges schedule; they
//! do not replace them. Every target must be declared up front through
//! [`NodeOptions::destinations`](crate::NodeOptions::destinations) so the
//! compiler can check reachability.
//!
//! # Example
//!
//! ```rust
//! use stategraph_core::{Command, Send};
//! use serde_json::json;
//!
//! let cmd = Command::new()
//!     .with_update(json!({"status": "triaged"}))
//!     .with_goto("review")
//!     .with_goto(Send::new("notify", json!({"channel": "ops"})));
//! assert_eq!(cmd.goto.len(), 2);
//! ```
//!
//! [`ResumeValue`] is the counterpart used by callers: the value handed back
//! to a suspended node when the run is resumed.

use crate::send::Send;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Routing target of a [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GotoTarget {
    /// Schedule a node reading the shared state
    Node(String),
    /// Schedule a push task with its own input
    Send(Send),
}

impl From<String> for GotoTarget {
    fn from(node: String) -> Self {
        GotoTarget::Node(node)
    }
}

impl From<&str> for GotoTarget {
    fn from(node: &str) -> Self {
        GotoTarget::Node(node.to_string())
    }
}

impl From<Send> for GotoTarget {
    fn from(send: Send) -> Self {
        GotoTarget::Send(send)
    }
}

/// Update plus routing returned by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Command {
    /// State update to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    /// Targets scheduled in the next superstep
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goto: Vec<GotoTarget>,
}

impl Command {
    /// Create a new empty command
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state update
    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    /// Add a goto target
    pub fn with_goto(mut self, goto: impl Into<GotoTarget>) -> Self {
        self.goto.push(goto.into());
        self
    }

    /// Add one push task per `Send`
    pub fn with_sends(mut self, sends: impl IntoIterator<Item = Send>) -> Self {
        self.goto.extend(sends.into_iter().map(GotoTarget::Send));
        self
    }

    /// Check if command is empty (no operations)
    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.goto.is_empty()
    }
}

/// What a node body produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Partial state update, `null` for none
    Update(Value),
    /// Update with routing
    Command(Command),
}

impl NodeOutput {
    /// The partial update carried by this output
    pub fn update(&self) -> &Value {
        static NONE: Value = Value::Null;
        match self {
            NodeOutput::Update(update) => update,
            NodeOutput::Command(cmd) => cmd.update.as_ref().unwrap_or(&NONE),
        }
    }

    /// Routing targets carried by this output
    pub fn goto(&self) -> &[GotoTarget] {
        match self {
            NodeOutput::Update(_) => &[],
            NodeOutput::Command(cmd) => &cmd.goto,
        }
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        NodeOutput::Update(Value::Null)
    }
}

impl From<Value> for NodeOutput {
    fn from(update: Value) -> Self {
        NodeOutput::Update(update)
    }
}

impl From<Command> for NodeOutput {
    fn from(cmd: Command) -> Self {
        NodeOutput::Command(cmd)
    }
}

impl From<()> for NodeOutput {
    fn from(_: ()) -> Self {
        NodeOutput::default()
    }
}

/// Value supplied by the caller when resuming a suspended run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    /// Answer the only open interrupt
    Single(Value),
    /// Answer specific interrupts by id
    ByInterruptId(HashMap<String, Value>),
}

impl From<Value> for ResumeValue {
    fn from(value: Value) -> Self {
        ResumeValue::Single(value)
    }
}

impl From<&str> for ResumeValue {
    fn from(value: &str) -> Self {
        ResumeValue::Single(Value::String(value.to_string()))
    }
}

impl From<HashMap<String, Value>> for ResumeValue {
    fn from(map: HashMap<String, Value>) -> Self {
        ResumeValue::ByInterruptId(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_builder() {
        let cmd = Command::new()
            .with_update(json!({"x": 1}))
            .with_goto("next")
            .with_sends(vec![Send::new("w", json!(1)), Send::new("w", json!(2))]);
        assert_eq!(cmd.goto.len(), 3);
        assert_eq!(cmd.goto[0], GotoTarget::Node("next".into()));
        assert!(!cmd.is_empty());
        assert!(Command::new().is_empty());
    }

    #[test]
    fn test_node_output_accessors() {
        let plain: NodeOutput = json!({"a": 1}).into();
        assert_eq!(plain.update(), &json!({"a": 1}));
        assert!(plain.goto().is_empty());

        let routed: NodeOutput = Command::new().with_goto("b").into();
        assert_eq!(routed.update(), &Value::Null);
        assert_eq!(routed.goto().len(), 1);

        let nothing: NodeOutput = ().into();
        assert_eq!(nothing, NodeOutput::Update(Value::Null));
    }

    #[test]
    fn test_node_output_survives_persistence() {
        let output: NodeOutput = Command::new()
            .with_update(json!({"n": 2}))
            .with_goto(Send::new("w", json!({"k": "v"})))
            .with_goto("end")
            .into();
        let stored = serde_json::to_value(&output).unwrap();
        let restored: NodeOutput = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, output);
    }

    #[test]
    fn test_resume_value_shapes() {
        let single: ResumeValue = "yes".into();
        assert_eq!(single, ResumeValue::Single(json!("yes")));

        let by_id: ResumeValue = HashMap::from([("0:a:0".to_string(), json!(1))]).into();
        assert!(matches!(by_id, ResumeValue::ByInterruptId(ref m) if m.len() == 1));
    }
}
