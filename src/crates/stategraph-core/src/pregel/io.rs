//! Translation between caller/node values and channel writes.
//!
//! Every value entering the store passes through here: run input, node
//! updates and external state edits. All three must be a JSON object whose
//! keys are declared channels (or `null`, meaning no writes).

use super::plan::{ExecutionPlan, PlanNode};
use crate::error::{GraphError, Result};
use crate::graph::START;
use serde_json::Value;

/// Channel writes of a node's partial update
///
/// Keys outside the node's declared writes, or an update that is not an
/// object, are a [`GraphError::NodeReturnShape`].
pub(crate) fn update_writes(node: &PlanNode, step: i64, update: &Value) -> Result<Vec<(String, Value)>> {
    let map = match update {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        other => {
            return Err(GraphError::NodeReturnShape {
                node: node.name.clone(),
                step,
                message: format!("expected an object or null, got {}", kind(other)),
            })
        }
    };
    let mut writes = Vec::with_capacity(map.len());
    for (channel, value) in map {
        if !node.writes.contains(channel) {
            return Err(GraphError::NodeReturnShape {
                node: node.name.clone(),
                step,
                message: format!("channel '{}' is not among the node's writes", channel),
            });
        }
        writes.push((channel.clone(), value.clone()));
    }
    Ok(writes)
}

/// Channel writes of the run input
pub(crate) fn input_writes(plan: &ExecutionPlan, input: &Value) -> Result<Vec<(String, Value)>> {
    state_writes(plan, -1, input, START)
}

/// Channel writes of an external state edit
///
/// With `as_node` the keys are checked against that node's declared writes.
pub(crate) fn edit_writes(
    plan: &ExecutionPlan,
    step: i64,
    values: &Value,
    as_node: Option<&PlanNode>,
) -> Result<Vec<(String, Value)>> {
    let Some(node) = as_node else {
        return state_writes(plan, step, values, "update_state");
    };
    let writes = state_writes(plan, step, values, &node.name)?;
    if let Some((channel, _)) = writes.iter().find(|(c, _)| !node.writes.contains(c)) {
        return Err(GraphError::InvalidUpdate {
            channel: channel.clone(),
            step,
            message: format!("node '{}' does not write this channel", node.name),
        });
    }
    Ok(writes)
}

fn state_writes(plan: &ExecutionPlan, step: i64, values: &Value, origin: &str) -> Result<Vec<(String, Value)>> {
    let map = match values {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        other => {
            return Err(GraphError::InvalidUpdate {
                channel: origin.to_string(),
                step,
                message: format!("expected an object or null, got {}", kind(other)),
            })
        }
    };
    let mut writes = Vec::with_capacity(map.len());
    for (channel, value) in map {
        if !plan.is_state_channel(channel) {
            return Err(GraphError::InvalidUpdate {
                channel: channel.clone(),
                step,
                message: "channel is not declared".to_string(),
            });
        }
        writes.push((channel.clone(), value.clone()));
    }
    Ok(writes)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Graph, NodeKind, NodeOptions, NodeSpec};
    use crate::state::{ChannelSpec, Reducer};
    use serde_json::json;

    fn plan() -> ExecutionPlan {
        let mut graph = Graph::new();
        graph.channels.push(ChannelSpec::new("draft", Reducer::LastValue));
        graph.channels.push(ChannelSpec::new("notes", Reducer::Append));
        graph.nodes.push(NodeSpec {
            name: "writer".into(),
            kind: NodeKind::Passthrough,
            options: NodeOptions::new().writes(["draft"]),
        });
        graph.edges.push(Edge::Direct {
            from: START.into(),
            to: "writer".into(),
        });
        ExecutionPlan::compile(&graph).unwrap()
    }

    #[test]
    fn test_update_must_respect_declared_writes() {
        let plan = plan();
        let node = plan.node("writer").unwrap();

        assert!(update_writes(node, 0, &Value::Null).unwrap().is_empty());
        assert_eq!(
            update_writes(node, 0, &json!({"draft": "v1"})).unwrap(),
            vec![("draft".to_string(), json!("v1"))]
        );

        let err = update_writes(node, 4, &json!({"notes": ["x"]})).unwrap_err();
        assert!(matches!(err, GraphError::NodeReturnShape { ref node, step: 4, .. } if node == "writer"));

        let err = update_writes(node, 4, &json!(["draft"])).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_input_keys_must_be_channels() {
        let plan = plan();
        assert_eq!(input_writes(&plan, &json!({"notes": "n"})).unwrap().len(), 1);

        let err = input_writes(&plan, &json!({"unknown": 1})).unwrap_err();
        assert!(matches!(err, GraphError::InvalidUpdate { ref channel, step: -1, .. } if channel == "unknown"));

        assert!(input_writes(&plan, &json!(3)).is_err());
    }

    #[test]
    fn test_edit_as_node() {
        let plan = plan();
        let writer = plan.node("writer");
        assert!(edit_writes(&plan, 2, &json!({"draft": "fixed"}), writer).is_ok());
        assert!(edit_writes(&plan, 2, &json!({"notes": "n"}), writer).is_err());
        assert!(edit_writes(&plan, 2, &json!({"notes": "n"}), None).is_ok());
    }
}
