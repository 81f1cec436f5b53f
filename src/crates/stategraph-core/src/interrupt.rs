//! Interrupt controller: suspending a run and resuming it with outside input
//!
//! A run can stop and wait for a caller in three ways:
//!
//! | Kind | Raised by | Slot id | Resume value |
//! |------|-----------|---------|--------------|
//! | `Before` | [`InterruptConfig`] breakpoint | `{task_id}:before` | ignored |
//! | `During` | [`NodeContext::interrupt`](crate::NodeContext::interrupt) | `{task_id}:{n}` | returned by the n-th `interrupt` call |
//! | `After` | [`InterruptConfig`] breakpoint | `{task_id}:after` | ignored |
//!
//! # State machine of a task
//!
//! ```text
//!             ┌────────── resume with value ──────────┐
//!             ▼                                       │
//! Pending ──run──► Completed                          │
//!    │     └─────► Suspended ── open During slot ─────┘
//!    │     └─────► Failed (fallback edge takes over)
//!    └── Before breakpoint: stays Pending until resumed
//! ```
//!
//! The states are persisted in the suspended checkpoint as
//! [`TaskRecord`]s, so a run can be resumed by a different process. On
//! resume only `Pending` tasks and `Suspended` tasks whose slots were
//! answered run again; completed tasks keep their recorded output.
//!
//! # Answering slots
//!
//! [`ResumeValue::Single`] answers the only open `During` slot and is
//! rejected with [`GraphError::AmbiguousResume`] when several are open.
//! [`ResumeValue::ByInterruptId`] answers any subset; tasks whose slots stay
//! unanswered remain suspended and the run suspends again after the others
//! finish. Breakpoint slots are cleared by every resume.

use crate::command::ResumeValue;
use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stategraph_checkpoint::{Checkpoint, InterruptRecord, InterruptWhen, TaskRecord, TaskStatus};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Static breakpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Nodes to interrupt before execution
    pub interrupt_before: BTreeSet<String>,

    /// Nodes to interrupt after their superstep commits
    pub interrupt_after: BTreeSet<String>,

    /// Whether to interrupt before all nodes
    pub interrupt_before_all: bool,

    /// Whether to interrupt after all nodes
    pub interrupt_after_all: bool,
}

impl InterruptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if should interrupt before a specific node
    pub fn should_interrupt_before(&self, node: &str) -> bool {
        self.interrupt_before_all || self.interrupt_before.contains(node)
    }

    /// Check if should interrupt after a specific node
    pub fn should_interrupt_after(&self, node: &str) -> bool {
        self.interrupt_after_all || self.interrupt_after.contains(node)
    }

    /// Named nodes, for validation against the graph
    pub(crate) fn named_nodes(&self) -> impl Iterator<Item = &String> {
        self.interrupt_before.iter().chain(self.interrupt_after.iter())
    }
}

/// Slot opened by a `Before` breakpoint
pub(crate) fn before_record(task: &TaskRecord, step: i64) -> InterruptRecord {
    breakpoint_record(task, step, InterruptWhen::Before, "before")
}

/// Slot opened by an `After` breakpoint
pub(crate) fn after_record(task: &TaskRecord, step: i64) -> InterruptRecord {
    breakpoint_record(task, step, InterruptWhen::After, "after")
}

fn breakpoint_record(task: &TaskRecord, step: i64, when: InterruptWhen, suffix: &str) -> InterruptRecord {
    InterruptRecord {
        id: format!("{}:{}", task.id, suffix),
        task_id: task.id.clone(),
        node: task.node.clone(),
        step,
        when,
        value: Value::Null,
    }
}

/// Apply a caller's answers to a suspended checkpoint
///
/// Answered `During` slots move their value onto the owning task record;
/// unanswered ones stay in `checkpoint.interrupts`. Breakpoint slots are
/// removed.
pub(crate) fn apply_resume(checkpoint: &mut Checkpoint, resume: ResumeValue) -> Result<()> {
    let open_during: Vec<&InterruptRecord> = checkpoint
        .interrupts
        .iter()
        .filter(|r| r.when == InterruptWhen::During)
        .collect();

    let answers: HashMap<String, Value> = match resume {
        ResumeValue::Single(value) => match open_during.as_slice() {
            [] => HashMap::new(),
            [only] => HashMap::from([(only.id.clone(), value)]),
            many => return Err(GraphError::AmbiguousResume { open: many.len() }),
        },
        ResumeValue::ByInterruptId(map) => {
            if let Some(unknown) = map
                .keys()
                .find(|id| !checkpoint.interrupts.iter().any(|r| &r.id == *id))
            {
                return Err(GraphError::UnknownInterrupt(unknown.clone()));
            }
            map
        }
    };

    let mut remaining = Vec::new();
    for record in std::mem::take(&mut checkpoint.interrupts) {
        if record.when != InterruptWhen::During {
            debug!(interrupt_id = %record.id, "Breakpoint cleared by resume");
            continue;
        }
        match answers.get(&record.id) {
            Some(value) => {
                let task = checkpoint
                    .pending_tasks
                    .iter_mut()
                    .find(|t| t.id == record.task_id)
                    .ok_or_else(|| {
                        GraphError::Execution(format!(
                            "interrupt '{}' belongs to unknown task '{}'",
                            record.id, record.task_id
                        ))
                    })?;
                task.resume.push(value.clone());
                debug!(interrupt_id = %record.id, task_id = %task.id, "Interrupt answered");
            }
            None => remaining.push(record),
        }
    }
    checkpoint.interrupts = remaining;
    Ok(())
}

/// Whether `task` must run when its superstep is re-entered
pub(crate) fn is_runnable_on_resume(task: &TaskRecord, open: &[InterruptRecord]) -> bool {
    match task.status {
        TaskStatus::Pending => true,
        TaskStatus::Suspended => !open
            .iter()
            .any(|r| r.task_id == task.id && r.when == InterruptWhen::During),
        TaskStatus::Completed | TaskStatus::Failed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stategraph_checkpoint::TaskSource;

    fn suspended(tasks: &[&str]) -> Checkpoint {
        let mut checkpoint = Checkpoint::empty();
        checkpoint.step = 1;
        for (i, node) in tasks.iter().enumerate() {
            let mut task = TaskRecord::pending(
                format!("1:send:{}:{}", i, node),
                *node,
                TaskSource::Send { index: i, arg: json!(i) },
                vec!["__tasks__".into()],
            );
            task.status = TaskStatus::Suspended;
            checkpoint.interrupts.push(InterruptRecord {
                id: format!("{}:0", task.id),
                task_id: task.id.clone(),
                node: node.to_string(),
                step: 1,
                when: InterruptWhen::During,
                value: json!({"q": node}),
            });
            checkpoint.pending_tasks.push(task);
        }
        checkpoint
    }

    #[test]
    fn test_single_value_answers_only_slot() {
        let mut checkpoint = suspended(&["b"]);
        apply_resume(&mut checkpoint, json!("yes").into()).unwrap();

        assert!(checkpoint.interrupts.is_empty());
        assert_eq!(checkpoint.pending_tasks[0].resume, vec![json!("yes")]);
        assert!(is_runnable_on_resume(&checkpoint.pending_tasks[0], &checkpoint.interrupts));
    }

    #[test]
    fn test_single_value_is_ambiguous_with_two_slots() {
        let mut checkpoint = suspended(&["a", "b"]);
        let err = apply_resume(&mut checkpoint, json!("yes").into()).unwrap_err();
        assert!(matches!(err, GraphError::AmbiguousResume { open: 2 }));
        assert_eq!(checkpoint.interrupts.len(), 2);
    }

    #[test]
    fn test_answer_by_id_leaves_others_suspended() {
        let mut checkpoint = suspended(&["a", "b"]);
        let answers = HashMap::from([("1:send:1:b:0".to_string(), json!(true))]);
        apply_resume(&mut checkpoint, answers.into()).unwrap();

        assert_eq!(checkpoint.interrupts.len(), 1);
        assert_eq!(checkpoint.interrupts[0].node, "a");
        assert!(!is_runnable_on_resume(&checkpoint.pending_tasks[0], &checkpoint.interrupts));
        assert!(is_runnable_on_resume(&checkpoint.pending_tasks[1], &checkpoint.interrupts));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut checkpoint = suspended(&["a"]);
        let answers = HashMap::from([("nope".to_string(), json!(1))]);
        let err = apply_resume(&mut checkpoint, answers.into()).unwrap_err();
        assert!(matches!(err, GraphError::UnknownInterrupt(ref id) if id == "nope"));
    }

    #[test]
    fn test_breakpoints_cleared_by_any_resume() {
        let mut checkpoint = Checkpoint::empty();
        let task = TaskRecord::pending("0:a", "a", TaskSource::Edge, vec!["branch:to:a".into()]);
        checkpoint.interrupts.push(before_record(&task, 0));
        checkpoint.pending_tasks.push(task);

        apply_resume(&mut checkpoint, Value::Null.into()).unwrap();
        assert!(checkpoint.interrupts.is_empty());
        assert!(checkpoint.pending_tasks[0].resume.is_empty());
    }

    #[test]
    fn test_breakpoint_config() {
        let mut config = InterruptConfig::new();
        config.interrupt_before.insert("review".into());
        assert!(config.should_interrupt_before("review"));
        assert!(!config.should_interrupt_after("review"));
        config.interrupt_after_all = true;
        assert!(config.should_interrupt_after("anything"));
    }
}
