//! Core Pregel algorithm functions.
//!
//! This module implements the two decisions the scheduler makes at every
//! superstep boundary:
//! - Task preparation based on channel versions
//! - Routing writes produced by completed tasks
//!
//! Both are pure functions of the plan and the channel store, which is what
//! makes a replay from the same checkpoint produce the same tasks.

use super::channels::ChannelStore;
use super::plan::{trigger_channel, ExecutionPlan, PlanNode, Routing, Successor};
use super::types::PlannedTask;
use crate::command::GotoTarget;
use crate::error::{GraphError, Result};
use crate::graph::{END, TASKS};
use crate::runtime::NodeFailure;
use crate::send::{ConditionalEdgeResult, Send};
use serde_json::{json, Value};
use stategraph_checkpoint::{ChannelVersions, TaskSource};
use std::collections::BTreeMap;

/// Compute the tasks of superstep `step`.
///
/// # Algorithm
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────┐
/// │                  prepare_next_tasks() Flow                  │
/// └─────────────────────────────────────────────────────────────┘
///
///  1. Pull tasks, in node registration order
///     for node in plan.nodes:
///         fired = [ch in node.triggers
///                  where available(ch)
///                  and version[ch] > versions_seen[node][ch]]
///         if fired: task "{step}:{node}" reading node.reads
///
///  2. Push tasks, in the order the sends were written
///     for (i, send) in __tasks__:
///         task "{step}:send:{i}:{node}" with input = send.arg
/// ```
///
/// Pull tasks always precede push tasks. Task order is the tie-break for
/// every merge that depends on write order.
pub(crate) fn prepare_next_tasks(
    plan: &ExecutionPlan,
    store: &ChannelStore,
    versions_seen: &BTreeMap<String, ChannelVersions>,
    step: i64,
) -> Result<Vec<PlannedTask>> {
    let mut tasks = Vec::new();

    for node in &plan.nodes {
        let seen = versions_seen.get(&node.name);
        let fired: Vec<String> = node
            .triggers
            .iter()
            .filter(|channel| {
                store.is_available(channel)
                    && store
                        .version(channel)
                        .map(|v| v.is_newer_than(seen.and_then(|s| s.get(*channel))))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        if fired.is_empty() {
            continue;
        }

        let failure = node
            .fallback_triggers
            .iter()
            .filter(|channel| fired.contains(channel))
            .find_map(|channel| store.get(channel))
            .map(serde_json::from_value::<NodeFailure>)
            .transpose()?;

        tasks.push(PlannedTask {
            id: format!("{}:{}", step, node.name),
            node: node.name.clone(),
            step,
            source: TaskSource::Edge,
            triggers: fired,
            input: store.read_slice(node.reads.as_deref()),
            failure,
            resume: Vec::new(),
            journal: BTreeMap::new(),
        });
    }

    if let Some(Value::Array(sends)) = store.get(TASKS) {
        for (index, item) in sends.into_iter().enumerate() {
            let send: Send = serde_json::from_value(item)?;
            let (node, arg) = send.into_parts();
            if plan.node(&node).is_none() {
                return Err(GraphError::Execution(format!(
                    "fan-out instruction targets unknown node '{}'",
                    node
                )));
            }
            tasks.push(PlannedTask {
                id: format!("{}:send:{}:{}", step, index, node),
                node,
                step,
                source: TaskSource::Send {
                    index,
                    arg: arg.clone(),
                },
                triggers: vec![TASKS.to_string()],
                input: arg,
                failure: None,
                resume: Vec::new(),
                journal: BTreeMap::new(),
            });
        }
    }

    Ok(tasks)
}

/// Rebuild a planned task from its persisted record.
///
/// Edge tasks re-read their input from the restored store, which holds the
/// values the task originally saw.
pub(crate) fn task_from_record(
    plan: &ExecutionPlan,
    store: &ChannelStore,
    record: &stategraph_checkpoint::TaskRecord,
    step: i64,
) -> Result<PlannedTask> {
    let node = plan
        .node(&record.node)
        .ok_or_else(|| GraphError::Execution(format!("checkpoint references unknown node '{}'", record.node)))?;
    let input = match &record.source {
        TaskSource::Edge => store.read_slice(node.reads.as_deref()),
        TaskSource::Send { arg, .. } => arg.clone(),
    };
    let failure = node
        .fallback_triggers
        .iter()
        .filter(|channel| record.triggers.contains(channel))
        .find_map(|channel| store.get(channel))
        .map(serde_json::from_value::<NodeFailure>)
        .transpose()?;

    Ok(PlannedTask {
        id: record.id.clone(),
        node: record.node.clone(),
        step,
        source: record.source.clone(),
        triggers: record.triggers.clone(),
        input,
        failure,
        resume: record.resume.clone(),
        journal: record.journal.clone(),
    })
}

/// Writes that schedule the successors of `source`.
///
/// `snapshot` is the merged state routers are evaluated against. `node` is
/// the completed node, `None` for START; its `Command` gotos are checked
/// against its declared destinations.
///
/// ```text
/// Successor::Trigger      ──► branch:to:{next} = source
/// Successor::Barrier      ──► join:...:to:{next} = member
/// router(snapshot) = Node ──► branch:to:{node} = source
/// router(snapshot) = Send ──► __tasks__ += {node, arg}
/// goto Node / Send        ──► same as the router results
/// ```
pub(crate) fn route_writes(
    routing: &Routing,
    source: &str,
    node: Option<&PlanNode>,
    gotos: &[GotoTarget],
    snapshot: &Value,
    step: i64,
) -> Result<Vec<(String, Value)>> {
    let mut writes = Vec::new();

    for successor in &routing.successors {
        match successor {
            Successor::Trigger { channel } => writes.push((channel.clone(), json!(source))),
            Successor::Barrier { channel, member } => writes.push((channel.clone(), json!(member))),
        }
    }

    for branch in &routing.branches {
        let result = (branch.router)(snapshot);
        let allowed = |target: &str| branch.destinations.iter().any(|d| d == target);
        match result {
            ConditionalEdgeResult::End => {}
            ConditionalEdgeResult::Node(target) => {
                push_target(&mut writes, source, &target, step, allowed)?;
            }
            ConditionalEdgeResult::Nodes(targets) => {
                for target in targets {
                    push_target(&mut writes, source, &target, step, allowed)?;
                }
            }
            ConditionalEdgeResult::Send(sends) => {
                for send in sends {
                    push_send(&mut writes, source, send, step, allowed)?;
                }
            }
        }
    }

    if let Some(node) = node {
        let allowed = |target: &str| node.destinations.contains(target);
        for goto in gotos {
            match goto {
                GotoTarget::Node(target) => push_target(&mut writes, source, target, step, allowed)?,
                GotoTarget::Send(send) => push_send(&mut writes, source, send.clone(), step, allowed)?,
            }
        }
    }

    Ok(writes)
}

fn push_target(
    writes: &mut Vec<(String, Value)>,
    source: &str,
    target: &str,
    step: i64,
    allowed: impl Fn(&str) -> bool,
) -> Result<()> {
    if target == END {
        return Ok(());
    }
    if !allowed(target) {
        return Err(GraphError::InvalidRoute {
            node: source.to_string(),
            target: target.to_string(),
            step,
        });
    }
    writes.push((trigger_channel(target), json!(source)));
    Ok(())
}

fn push_send(
    writes: &mut Vec<(String, Value)>,
    source: &str,
    send: Send,
    step: i64,
    allowed: impl Fn(&str) -> bool,
) -> Result<()> {
    if !allowed(send.node()) {
        return Err(GraphError::InvalidRoute {
            node: source.to_string(),
            target: send.node().to_string(),
            step,
        });
    }
    writes.push((TASKS.to_string(), serde_json::to_value(&send)?));
    Ok(())
}
