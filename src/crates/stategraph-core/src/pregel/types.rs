//! Core Pregel data types.

use crate::command::NodeOutput;
use crate::runtime::NodeFailure;
use serde_json::Value;
use stategraph_checkpoint::{InterruptRecord, TaskRecord, TaskSource, TaskStatus};
use std::collections::BTreeMap;
use std::fmt;

/// A unit of work scheduled for one superstep.
#[derive(Debug, Clone)]
pub(crate) struct PlannedTask {
    /// `{step}:{node}` for edge tasks, `{step}:send:{index}:{node}` for sends
    pub(crate) id: String,
    pub(crate) node: String,
    pub(crate) step: i64,
    pub(crate) source: TaskSource,
    pub(crate) triggers: Vec<String>,
    pub(crate) input: Value,
    /// Set when a fallback edge scheduled the task
    pub(crate) failure: Option<NodeFailure>,
    /// Answers to the task's interrupts from earlier runs
    pub(crate) resume: Vec<Value>,
    pub(crate) journal: BTreeMap<String, Value>,
}

impl PlannedTask {
    /// Persistable form with the given status
    pub(crate) fn record(&self, status: TaskStatus) -> TaskRecord {
        let mut record = TaskRecord::pending(
            self.id.clone(),
            self.node.clone(),
            self.source.clone(),
            self.triggers.clone(),
        );
        record.status = status;
        record.resume = self.resume.clone();
        record.journal = self.journal.clone();
        record
    }

    pub(crate) fn is_push(&self) -> bool {
        matches!(self.source, TaskSource::Send { .. })
    }
}

/// How a task ended.
#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome {
    Completed(NodeOutput),
    /// Waiting for a resume value; carries the journal built so far
    Suspended {
        interrupt: InterruptRecord,
        journal: BTreeMap<String, Value>,
    },
    /// Retries exhausted and a fallback edge takes over
    Failed { error: String },
    /// Not started because the run was cancelled
    Skipped,
}

impl TaskOutcome {
    pub(crate) fn is_suspended(&self) -> bool {
        matches!(self, TaskOutcome::Suspended { .. })
    }
}

/// Task together with the way it ended.
#[derive(Debug, Clone)]
pub(crate) struct TaskResult {
    pub(crate) task: PlannedTask,
    pub(crate) outcome: TaskOutcome,
}

/// Phases of the superstep loop.
///
/// ```text
/// Idle ─► Planning ─► Executing ─► Merging ─► Checkpointing ─┐
///            ▲    └──────────────┴─► Suspended ◄─────────────┤
///            └───────────────────────────────────────────────┘
///  Planning / Executing / Merging / Checkpointing ─► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    Idle,
    Planning,
    Executing,
    Merging,
    Checkpointing,
    Suspended,
    Terminated,
}

impl LoopState {
    pub(crate) fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Idle, Suspended)
                | (Idle, Terminated)
                | (Planning, Executing)
                | (Planning, Suspended)
                | (Planning, Terminated)
                | (Executing, Merging)
                | (Executing, Suspended)
                | (Executing, Terminated)
                | (Merging, Checkpointing)
                | (Merging, Terminated)
                | (Checkpointing, Planning)
                | (Checkpointing, Suspended)
                | (Checkpointing, Terminated)
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Planning => "planning",
            LoopState::Executing => "executing",
            LoopState::Merging => "merging",
            LoopState::Checkpointing => "checkpointing",
            LoopState::Suspended => "suspended",
            LoopState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loop_transitions() {
        assert!(LoopState::Idle.can_transition_to(LoopState::Planning));
        assert!(LoopState::Checkpointing.can_transition_to(LoopState::Planning));
        assert!(LoopState::Executing.can_transition_to(LoopState::Suspended));
        assert!(!LoopState::Merging.can_transition_to(LoopState::Suspended));
        assert!(!LoopState::Terminated.can_transition_to(LoopState::Planning));
        assert_eq!(LoopState::Checkpointing.to_string(), "checkpointing");
    }

    #[test]
    fn test_record_keeps_resume_state() {
        let task = PlannedTask {
            id: "2:send:0:worker".into(),
            node: "worker".into(),
            step: 2,
            source: TaskSource::Send {
                index: 0,
                arg: json!({"item": 1}),
            },
            triggers: vec!["__tasks__".into()],
            input: json!({"item": 1}),
            failure: None,
            resume: vec![json!("ok")],
            journal: BTreeMap::from([("fetch".to_string(), json!(3))]),
        };
        assert!(task.is_push());

        let record = task.record(TaskStatus::Suspended);
        assert_eq!(record.status, TaskStatus::Suspended);
        assert_eq!(record.resume, vec![json!("ok")]);
        assert_eq!(record.journal.get("fetch"), Some(&json!(3)));
    }
}
