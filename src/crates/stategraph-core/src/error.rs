//! Error types for graph construction and execution
//!
//! All errors implement `std::error::Error` via `thiserror`.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Compile            - malformed graph, raised before any run starts
//! ├── ConcurrentUpdate   - two writers to a single-writer channel in one superstep
//! ├── NodeReturnShape    - a node returned something that is not a partial update
//! ├── InvalidUpdate      - a channel rejected a write
//! ├── InvalidRoute       - a router or Command targeted an undeclared node
//! ├── NodeExecution      - a node failed after exhausting its retries
//! ├── Transient / Node   - raised from node bodies, classified for retry
//! ├── Timeout            - a node attempt ran past its deadline
//! ├── Interrupt          - suspend signal raised inside a node body
//! ├── RunSuspended / NothingToResume / AmbiguousResume / UnknownInterrupt
//! ├── AccessDenied       - an access hook refused the call
//! └── Checkpoint / Serialization / Yaml / Io / Configuration / Execution
//! ```
//!
//! Reaching the step limit, pausing on an interrupt and cancellation are not
//! errors: they are reported through [`RunStatus`](crate::RunStatus) on a
//! successful [`RunOutcome`](crate::RunOutcome).
//!
//! # Propagation
//!
//! Run-time errors either are retried transparently by the node's retry
//! policy, or abort the superstep that raised them. An aborted superstep
//! leaves no trace: the channel store is rolled back to the last checkpoint
//! and nothing is persisted, so the run can be continued after a fix.
//!
//! ```rust
//! use stategraph_core::error::GraphError;
//!
//! fn describe(err: &GraphError) -> String {
//!     match err {
//!         GraphError::ConcurrentUpdate { channel, step } => {
//!             format!("channel '{}' got two writers in step {}", channel, step)
//!         }
//!         GraphError::NodeExecution { node, attempts, .. } => {
//!             format!("'{}' gave up after {} attempts", node, attempts)
//!         }
//!         other => other.to_string(),
//!     }
//! }
//! ```

use stategraph_checkpoint::{CheckpointError, InterruptRecord};
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Structural problems found while compiling a graph
///
/// Every variant names the node, edge or channel at fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("graph has no entry point: add an edge from START")]
    NoEntryPoint,

    #[error("node '{0}' is registered twice")]
    DuplicateNode(String),

    #[error("channel '{0}' is declared twice")]
    DuplicateChannel(String),

    #[error("'{0}' is a reserved name")]
    ReservedName(String),

    #[error("edge {from} -> {to} references unknown node '{node}'")]
    UnknownNode {
        from: String,
        to: String,
        node: String,
    },

    #[error("edge from END to '{to}' is not allowed")]
    EdgeFromEnd { to: String },

    #[error("edge from '{from}' to START is not allowed")]
    EdgeToStart { from: String },

    #[error("join into '{target}' needs at least one source")]
    EmptyJoin { target: String },

    #[error("conditional edge from '{node}' declares no destinations")]
    EmptyBranch { node: String },

    #[error("conditional edge from '{node}' routes to unknown node '{target}'")]
    UnknownBranchTarget { node: String, target: String },

    #[error("node '{node}' references undeclared channel '{channel}'")]
    UnknownChannel { node: String, channel: String },

    #[error("node '{node}' declares unknown destination '{target}'")]
    UnknownDestination { node: String, target: String },

    #[error("node '{node}' is not reachable from START")]
    Unreachable { node: String },

    #[error("interrupt configured for unknown node '{0}'")]
    UnknownInterruptNode(String),

    #[error("fallback edge {from} -> {to} references an unknown node")]
    UnknownFallback { from: String, to: String },

    #[error("node '{node}' has more than one fallback edge")]
    DuplicateFallback { node: String },
}

/// Errors raised while building or running a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// The graph definition is malformed
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// More than one write in a superstep to a channel that allows a single writer
    #[error("Concurrent update to channel '{channel}' in step {step}")]
    ConcurrentUpdate { channel: String, step: i64 },

    /// A node returned something that is not a valid partial state update
    #[error("Node '{node}' returned an invalid update in step {step}: {message}")]
    NodeReturnShape {
        node: String,
        step: i64,
        message: String,
    },

    /// A channel rejected the value written to it
    #[error("Invalid update to channel '{channel}' in step {step}: {message}")]
    InvalidUpdate {
        channel: String,
        step: i64,
        message: String,
    },

    /// A router or Command sent control to a node it did not declare
    #[error("Node '{node}' routed to undeclared target '{target}' in step {step}")]
    InvalidRoute {
        node: String,
        target: String,
        step: i64,
    },

    /// A node failed and its retries are exhausted
    ///
    /// Carries enough context to locate the failure and continue the run
    /// once the cause is fixed.
    #[error("Node '{node}' failed in step {step} after {attempts} attempt(s): {error}")]
    NodeExecution {
        node: String,
        step: i64,
        attempts: usize,
        error: String,
    },

    /// Retryable failure raised by a node body
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent failure raised by a node body
    #[error("Node error: {0}")]
    Node(String),

    /// Operation exceeded its time limit
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Suspend signal raised by [`NodeContext::interrupt`](crate::NodeContext::interrupt)
    ///
    /// Node bodies propagate it with `?`; the scheduler turns it into a
    /// suspended checkpoint and never hands it to callers.
    #[error("Interrupted at '{}' ({})", .0.node, .0.id)]
    Interrupt(InterruptRecord),

    /// `invoke` was called on a run that waits for a resume value
    #[error("Thread '{thread_id}' is suspended; call resume instead")]
    RunSuspended { thread_id: String },

    /// `resume` was called on a run with no open interrupt
    #[error("Thread '{thread_id}' has no open interrupt")]
    NothingToResume { thread_id: String },

    /// A single resume value was given while several interrupts are open
    #[error("{open} interrupts are open; resume them by interrupt id")]
    AmbiguousResume { open: usize },

    /// A resume value addressed an interrupt that is not open
    #[error("Unknown interrupt id '{0}'")]
    UnknownInterrupt(String),

    /// An access hook refused the call
    #[error("Access denied for {action} on thread '{thread_id}': {reason}")]
    AccessDenied {
        action: String,
        thread_id: String,
        reason: String,
    },

    /// Persistence backend failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// General execution failure
    #[error("Execution error: {0}")]
    Execution(String),
}

impl GraphError {
    /// Retryable error raised from a node body
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Permanent error raised from a node body
    pub fn node(message: impl Into<String>) -> Self {
        Self::Node(message.into())
    }

    /// Whether the default retry classification treats this error as transient
    ///
    /// ```rust
    /// use stategraph_core::error::GraphError;
    ///
    /// assert!(GraphError::transient("rate limited").is_transient());
    /// assert!(!GraphError::node("bad input").is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Whether this is the suspend signal rather than a failure
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt(_))
    }

    /// Attach superstep context to a channel error raised during a merge
    pub(crate) fn from_channel(channel: &str, step: i64, err: CheckpointError) -> Self {
        match err {
            CheckpointError::ConcurrentUpdate(_) => Self::ConcurrentUpdate {
                channel: channel.to_string(),
                step,
            },
            CheckpointError::InvalidUpdate(message) => Self::InvalidUpdate {
                channel: channel.to_string(),
                step,
                message,
            },
            other => Self::Checkpoint(other),
        }
    }
}
