//! # stategraph-checkpoint - Channels and State Persistence
//!
//! Building blocks shared by the stategraph execution engine and its storage
//! backends:
//!
//! - **Channels** - named state cells, each with its own merge function
//! - **Checkpoints** - the durable image of a run at a superstep boundary
//! - **[`CheckpointSaver`]** - the persistence seam, with an in-memory and a
//!   file-backed implementation
//!
//! ## Channels
//!
//! Every channel implements [`Channel`]. A superstep hands each channel the
//! batch of writes addressed to it, in deterministic task order, and the
//! channel folds the batch into its value in one `update` call.
//!
//! | Channel | Merge |
//! |---------|-------|
//! | [`LastValueChannel`] | one writer per superstep, otherwise `ConcurrentUpdate` |
//! | [`AnyValueChannel`] | last write in batch order wins |
//! | [`TopicChannel`] | appends, arrays flattened one level |
//! | [`UnionChannel`] | ordered set union |
//! | [`BinaryOperatorChannel`] | folds writes with a binary function |
//! | [`ReduceChannel`] | batch reducer, optionally non-associative |
//! | [`EphemeralValueChannel`] | value visible for one superstep |
//! | [`NamedBarrierValueChannel`] | opens once every named sender wrote |
//!
//! ```rust
//! use stategraph_checkpoint::{Channel, LastValueChannel, TopicChannel, BinaryOperatorChannel};
//! use serde_json::json;
//!
//! let mut status = LastValueChannel::new();
//! status.update(vec![json!("active")]).unwrap();
//! assert!(status.update(vec![json!("a"), json!("b")]).is_err());
//!
//! let mut log = TopicChannel::new();
//! log.update(vec![json!("A"), json!(["B", "C"])]).unwrap();
//! assert_eq!(log.get().unwrap(), json!(["A", "B", "C"]));
//!
//! let mut counter = BinaryOperatorChannel::sum();
//! counter.update(vec![json!(5), json!(10)]).unwrap();
//! assert_eq!(counter.get().unwrap(), json!(15));
//! ```
//!
//! ## Persistence
//!
//! ```rust
//! use stategraph_checkpoint::{
//!     Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointSaver, InMemoryCheckpointSaver,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saver = InMemoryCheckpointSaver::new();
//! let mut checkpoint = Checkpoint::empty();
//! checkpoint.seq = 1;
//! saver.save("thread-123", checkpoint, CheckpointMetadata::default()).await?;
//!
//! let history = saver.history("thread-123").await?;
//! assert_eq!(history.len(), 1);
//! assert!(saver.load("thread-123", CheckpointRef::Latest).await?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! Other stores (SQL, object storage, a remote service) plug in by
//! implementing [`CheckpointSaver`]; the engine never looks past the trait.

pub mod channels;
pub mod channels_ext;
pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use channels::{
    BatchReduceFn, BinaryOperatorChannel, BinaryOperatorFn, Channel, LastValueChannel, ReduceChannel,
    TopicChannel, UnionChannel,
};
pub use channels_ext::{AnyValueChannel, EphemeralValueChannel, NamedBarrierValueChannel};
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, InterruptRecord, InterruptWhen, PendingWrite, TaskRecord,
    TaskSource, TaskStatus,
};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointSaver;
pub use memory::InMemoryCheckpointSaver;
pub use traits::{CheckpointRef, CheckpointSaver, CheckpointStream};
