//! Checkpoint data structures
//!
//! A [`Checkpoint`] is the durable image of a run at a superstep boundary: the
//! serialized value of every channel, the per-channel versions, the versions
//! each node has already consumed, and the scheduler bookkeeping needed to pick
//! up a suspended superstep (pending task records and open interrupt slots).
//!
//! ```text
//! CheckpointTuple
//! ├── config          thread_id + checkpoint_id
//! ├── checkpoint      seq, step, channel_values, channel_versions,
//! │                   versions_seen, pending_tasks, interrupts
//! ├── metadata        source, step, per-node writes, parents
//! ├── parent_config   previous checkpoint of the thread
//! └── pending_writes  task output recorded mid-superstep
//! ```
//!
//! Checkpoints of one thread are totally ordered by `seq`. `step` is the
//! superstep index and can repeat: a suspended superstep and the committed
//! checkpoint that later completes it share the same step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Pending write tuple: (task_id, channel, value)
pub type PendingWrite = (String, String, Value);

/// Channel version, either integer or float
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
}

impl ChannelVersion {
    /// The version following this one
    pub fn next(&self) -> Self {
        match self {
            ChannelVersion::Int(v) => ChannelVersion::Int(v + 1),
            ChannelVersion::Float(v) => ChannelVersion::Float(v + 1.0),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            ChannelVersion::Int(v) => *v as f64,
            ChannelVersion::Float(v) => *v,
        }
    }

    /// True if `self` is strictly newer than `seen` (a missing version is never newer)
    pub fn is_newer_than(&self, seen: Option<&ChannelVersion>) -> bool {
        match seen {
            Some(seen) => self.partial_cmp(seen) == Some(Ordering::Greater),
            None => true,
        }
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = BTreeMap<String, ChannelVersion>;

/// How a checkpoint came to exist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written by the scheduler at the end of a superstep
    Loop,
    /// Written by an external state update
    Update,
    /// First checkpoint of a run continued from an older checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Superstep index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Partial updates merged in this checkpoint, keyed by the node that produced them
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub writes: BTreeMap<String, Value>,

    /// Parent checkpoint ids, keyed by namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Set the per-node writes
    pub fn with_writes(mut self, writes: BTreeMap<String, Value>) -> Self {
        self.writes = writes;
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// How a task was scheduled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSource {
    /// Triggered by an edge; reads its input from the channels
    Edge,
    /// Created by a fan-out instruction carrying its own input
    Send { index: usize, arg: Value },
}

/// Progress of a task inside an unfinished superstep
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Suspended,
    /// Retries exhausted and a fallback edge takes over
    Failed,
}

/// Persisted state machine of one task of a suspended superstep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub node: String,
    pub source: TaskSource,
    pub triggers: Vec<String>,
    pub status: TaskStatus,

    /// Node output, present once the task completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure message for tasks routed to a fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Resume values, one per interrupt the task already passed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume: Vec<Value>,

    /// Results of side effects that already ran
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub journal: BTreeMap<String, Value>,
}

impl TaskRecord {
    /// A task that has not run yet
    pub fn pending(
        id: impl Into<String>,
        node: impl Into<String>,
        source: TaskSource,
        triggers: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            node: node.into(),
            source,
            triggers,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            resume: Vec::new(),
            journal: BTreeMap::new(),
        }
    }
}

/// When an interrupt fired relative to its node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterruptWhen {
    /// Static breakpoint before the node ran
    Before,
    /// Raised from inside the node body
    During,
    /// Static breakpoint after the node's superstep committed
    After,
}

/// An open interrupt slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRecord {
    /// Slot identity used to address a resume value
    pub id: String,
    pub task_id: String,
    pub node: String,
    pub step: i64,
    pub when: InterruptWhen,
    /// Payload surfaced to the caller
    pub value: Value,
}

/// State snapshot at a superstep boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format
    pub v: i32,

    /// The ID of the checkpoint
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// Position in the thread's history, strictly increasing
    pub seq: u64,

    /// Superstep index, -1 before the first superstep
    pub step: i64,

    /// Serialized channel values
    pub channel_values: BTreeMap<String, Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node name to the trigger versions that node already consumed
    pub versions_seen: BTreeMap<String, ChannelVersions>,

    /// The channels that were updated in this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,

    /// Tasks of an unfinished superstep
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tasks: Vec<TaskRecord>,

    /// Open interrupt slots
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<InterruptRecord>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a new checkpoint
    pub fn new(channel_values: BTreeMap<String, Value>, channel_versions: ChannelVersions) -> Self {
        Self {
            channel_values,
            channel_versions,
            ..Self::empty()
        }
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            seq: 0,
            step: -1,
            channel_values: BTreeMap::new(),
            channel_versions: BTreeMap::new(),
            versions_seen: BTreeMap::new(),
            updated_channels: None,
            pending_tasks: Vec::new(),
            interrupts: Vec::new(),
        }
    }

    /// Copy with a fresh id and timestamp, ready to be saved as the next checkpoint
    pub fn successor(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            seq: self.seq + 1,
            ..self.clone()
        }
    }

    /// Whether the run stopped at this checkpoint waiting for a resume
    pub fn is_suspended(&self) -> bool {
        !self.interrupts.is_empty()
    }

    /// Highest version of any channel
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions
            .values()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }
}

/// Configuration identifying a thread and optionally one of its checkpoints
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    /// Thread ID grouping the checkpoints of one run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint ID, `None` means latest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Config addressing the latest checkpoint of `thread_id`
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self::new().with_thread_id(thread_id)
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }
}

/// A checkpoint together with its config, metadata and recorded writes
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Configuration for this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Parent configuration (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint by tasks of the following superstep
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Create a new checkpoint tuple
    pub fn new(config: CheckpointConfig, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    /// Set the parent configuration
    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }
}
