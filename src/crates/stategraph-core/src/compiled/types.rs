//! Type definitions for compiled graph execution
//!
//! Results returned by the invocation API. A run that stops early for a
//! reason other than a failure still returns `Ok`: the reason is in
//! [`RunStatus`].
//!
//! ```text
//! invoke / resume ──► RunOutcome { state, status, step, checkpoint }
//!                                   │
//!                                   ├─ Completed           fixed point reached
//!                                   ├─ Interrupted([..])   waiting for resume
//!                                   ├─ StepLimitExceeded   budget used up
//!                                   └─ Cancelled           token fired
//!
//! get_state ─────► StateSnapshot { values, next, tasks, interrupts, .. }
//! ```

use crate::error::Result;
use crate::stream::StreamChunk;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stategraph_checkpoint::{CheckpointConfig, CheckpointMetadata, InterruptRecord, TaskRecord};
use std::pin::Pin;

/// Chunks of a streamed run; a failed run ends with its error
pub type RunStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Snapshots of a thread's history
pub type StateSnapshotStream = Pin<Box<dyn Stream<Item = Result<StateSnapshot>> + Send>>;

/// Why a run returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// No task was runnable
    Completed,

    /// The run is suspended; answer these slots with `resume`
    Interrupted { interrupts: Vec<InterruptRecord> },

    /// The step limit was reached with work still scheduled
    StepLimitExceeded { limit: usize },

    /// The run's cancellation token fired; the last superstep was discarded
    Cancelled,
}

/// Result of `invoke` or `resume`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// State as of the last committed superstep
    pub state: Value,

    pub status: RunStatus,

    /// Index of the last checkpointed superstep, `-1` if none ran
    pub step: i64,

    /// Latest checkpoint of the run; `None` without a checkpointer
    pub checkpoint: Option<CheckpointConfig>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.status, RunStatus::Interrupted { .. })
    }

    /// Open interrupt slots, empty unless the run is suspended
    pub fn interrupts(&self) -> &[InterruptRecord] {
        match &self.status {
            RunStatus::Interrupted { interrupts } => interrupts,
            _ => &[],
        }
    }
}

/// View of a run at one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State channel values
    pub values: Value,

    /// Nodes that run when the run continues
    pub next: Vec<String>,

    /// Tasks of an unfinished superstep
    pub tasks: Vec<TaskRecord>,

    /// Open interrupt slots
    pub interrupts: Vec<InterruptRecord>,

    pub config: CheckpointConfig,

    pub parent_config: Option<CheckpointConfig>,

    pub metadata: CheckpointMetadata,

    pub step: i64,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stategraph_checkpoint::InterruptWhen;

    #[test]
    fn test_outcome_accessors() {
        let record = InterruptRecord {
            id: "1:b:0".into(),
            task_id: "1:b".into(),
            node: "b".into(),
            step: 1,
            when: InterruptWhen::During,
            value: json!({"q": "approve?"}),
        };
        let outcome = RunOutcome {
            state: json!({}),
            status: RunStatus::Interrupted {
                interrupts: vec![record],
            },
            step: 0,
            checkpoint: None,
        };
        assert!(outcome.is_interrupted());
        assert!(!outcome.is_completed());
        assert_eq!(outcome.interrupts()[0].value, json!({"q": "approve?"}));
    }

    #[test]
    fn test_status_serializes_tagged() {
        let value = serde_json::to_value(RunStatus::StepLimitExceeded { limit: 4 }).unwrap();
        assert_eq!(value, json!({"status": "step_limit_exceeded", "limit": 4}));
    }
}
