//! Streaming observation of a run
//!
//! The scheduler publishes one [`StreamEvent`] sequence per run. A
//! [`StreamMultiplexer`] fans that sequence out to any number of subscribers,
//! each of which selects the [`StreamMode`]s it cares about and receives
//! [`StreamChunk`]s tagged with the mode that matched.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Scheduler (one run)                  │
//! │                                                         │
//! │  TaskStart ─ Custom/Token ─ TaskResult ─ Updates ─      │
//! │  Values ─ Checkpoint ─ Interrupt        (per superstep) │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ emit(event)   never blocks
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │  StreamMultiplexer   │  seq assigned once per event
//!                 └───┬──────────────┬───┘
//!                     │              │
//!       filter by modes│              │filter by modes
//!                     ▼              ▼
//!            ┌──────────────┐  ┌──────────────┐
//!            │ Subscription │  │ Subscription │
//!            │  Unbounded   │  │ DropNewest(n)│
//!            └──────────────┘  └──────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every mode is derived from the same event sequence, so a subscriber
//!   asking for several modes sees them interleaved in the order the events
//!   occurred. `seq` is shared by all subscribers for the same event.
//! - Publishing never waits for a subscriber. A full bounded buffer drops
//!   the chunk and counts it; a closed subscription is removed.
//! - Subscribing never changes what the scheduler does.
//! - Interrupt events reach every subscriber exactly once, tagged with the
//!   first mode that subscriber asked for.
//!
//! # Example
//!
//! ```rust
//! use stategraph_core::stream::{BufferPolicy, StreamEvent, StreamMode, StreamMultiplexer};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mux = StreamMultiplexer::new();
//! let mut updates = mux.subscribe(&[StreamMode::Updates], BufferPolicy::Unbounded);
//!
//! mux.emit(StreamEvent::Values { step: 0, state: json!({"n": 1}) });
//! mux.emit(StreamEvent::Updates {
//!     step: 0,
//!     node: "inc".into(),
//!     task_id: "0:inc".into(),
//!     update: json!({"n": 1}),
//! });
//!
//! let chunk = updates.recv().await.unwrap();
//! assert_eq!(chunk.mode, StreamMode::Updates);
//! assert_eq!(chunk.seq, 1);
//! # }
//! ```

use futures::stream::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stategraph_checkpoint::InterruptRecord;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, warn};

/// Observation formats a subscriber can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full state after each superstep
    ///
    /// **Emits**: [`StreamEvent::Values`]
    Values,

    /// Partial update of each task, once its superstep merged
    ///
    /// **Emits**: [`StreamEvent::Updates`]
    Updates,

    /// Payloads nodes publish through [`NodeContext::emit`](crate::NodeContext::emit)
    ///
    /// **Emits**: [`StreamEvent::Custom`]
    Custom,

    /// Sub-token output from inside a node
    ///
    /// **Emits**: [`StreamEvent::Token`]
    Messages,

    /// Task lifecycle: start, result, failed attempts
    ///
    /// **Emits**: [`StreamEvent::TaskStart`], [`StreamEvent::TaskResult`], [`StreamEvent::TaskError`]
    Tasks,

    /// Every checkpoint written
    ///
    /// **Emits**: [`StreamEvent::Checkpoint`]
    Checkpoints,

    /// Verbose trace, shorthand for `Tasks` plus `Checkpoints`
    Debug,
}

impl StreamMode {
    /// Replace `Debug` by what it stands for, keeping first-seen order
    fn expand(modes: &[StreamMode]) -> Vec<StreamMode> {
        let mut expanded = Vec::new();
        for mode in modes {
            let parts: &[StreamMode] = match mode {
                StreamMode::Debug => &[StreamMode::Tasks, StreamMode::Checkpoints],
                other => std::slice::from_ref(other),
            };
            for part in parts {
                if !expanded.contains(part) {
                    expanded.push(*part);
                }
            }
        }
        expanded
    }
}

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// State after the superstep merged
    Values { step: i64, state: Value },

    /// Partial update one task contributed
    Updates {
        step: i64,
        node: String,
        task_id: String,
        update: Value,
    },

    /// Developer-emitted payload
    Custom {
        node: String,
        task_id: String,
        data: Value,
    },

    /// Sub-token output
    Token {
        node: String,
        task_id: String,
        text: String,
    },

    /// A task is about to run
    TaskStart {
        step: i64,
        task_id: String,
        node: String,
        input: Value,
        triggers: Vec<String>,
    },

    /// A task finished or suspended
    TaskResult {
        step: i64,
        task_id: String,
        node: String,
        update: Value,
        interrupted: bool,
    },

    /// An attempt of a task failed
    TaskError {
        step: i64,
        task_id: String,
        node: String,
        error: String,
        attempt: usize,
        will_retry: bool,
    },

    /// A checkpoint was written
    Checkpoint {
        thread_id: String,
        checkpoint_id: String,
        step: i64,
        seq: u64,
        next: Vec<String>,
    },

    /// The run suspended
    Interrupt {
        step: i64,
        interrupts: Vec<InterruptRecord>,
    },
}

impl StreamEvent {
    /// Mode selecting this event; `None` for events every subscriber receives
    pub fn mode(&self) -> Option<StreamMode> {
        match self {
            StreamEvent::Values { .. } => Some(StreamMode::Values),
            StreamEvent::Updates { .. } => Some(StreamMode::Updates),
            StreamEvent::Custom { .. } => Some(StreamMode::Custom),
            StreamEvent::Token { .. } => Some(StreamMode::Messages),
            StreamEvent::TaskStart { .. }
            | StreamEvent::TaskResult { .. }
            | StreamEvent::TaskError { .. } => Some(StreamMode::Tasks),
            StreamEvent::Checkpoint { .. } => Some(StreamMode::Checkpoints),
            StreamEvent::Interrupt { .. } => None,
        }
    }
}

/// Event delivered to a subscriber, tagged with the mode that selected it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Position of the event in the run, shared by all subscribers
    pub seq: u64,
    pub mode: StreamMode,
    pub event: StreamEvent,
}

/// What a subscriber's buffer does when the consumer falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Buffer everything
    #[default]
    Unbounded,
    /// Keep at most `n` undelivered chunks and drop newer ones
    DropNewest(usize),
}

enum Sink {
    Bounded(mpsc::Sender<StreamChunk>),
    Unbounded(mpsc::UnboundedSender<StreamChunk>),
}

enum Receiver {
    Bounded(mpsc::Receiver<StreamChunk>),
    Unbounded(mpsc::UnboundedReceiver<StreamChunk>),
}

struct SubscriberSlot {
    id: u64,
    modes: Vec<StreamMode>,
    sink: Sink,
    dropped: Arc<AtomicU64>,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl SubscriberSlot {
    fn mode_for(&self, event: &StreamEvent) -> Option<StreamMode> {
        match event.mode() {
            Some(mode) => self.modes.contains(&mode).then_some(mode),
            None => self.modes.first().copied(),
        }
    }

    fn deliver(&self, chunk: StreamChunk) -> Delivery {
        match &self.sink {
            Sink::Unbounded(tx) => match tx.send(chunk) {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
            Sink::Bounded(tx) => match tx.try_send(chunk) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Delivery::Dropped
                }
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

/// Fan-out of one run's events to many subscribers
pub struct StreamMultiplexer {
    seq: AtomicU64,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<SubscriberSlot>>,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl StreamMultiplexer {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber for `modes`
    ///
    /// An empty mode list subscribes to [`StreamMode::Values`].
    pub fn subscribe(&self, modes: &[StreamMode], policy: BufferPolicy) -> Subscription {
        let mut modes = StreamMode::expand(modes);
        if modes.is_empty() {
            modes.push(StreamMode::Values);
        }

        let dropped = Arc::new(AtomicU64::new(0));
        let (sink, receiver) = match policy {
            BufferPolicy::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sink::Unbounded(tx), Receiver::Unbounded(rx))
            }
            BufferPolicy::DropNewest(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (Sink::Bounded(tx), Receiver::Bounded(rx))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, ?modes, ?policy, "Stream subscriber added");
        self.subscribers.lock().push(SubscriberSlot {
            id,
            modes,
            sink,
            dropped: dropped.clone(),
        });

        Subscription { receiver, dropped }
    }

    /// Publish an event to every interested subscriber
    ///
    /// Never blocks.
    pub fn emit(&self, event: StreamEvent) {
        let mut subscribers = self.subscribers.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        subscribers.retain(|slot| {
            let Some(mode) = slot.mode_for(&event) else {
                return true;
            };
            let chunk = StreamChunk {
                seq,
                mode,
                event: event.clone(),
            };
            match slot.deliver(chunk) {
                Delivery::Sent => true,
                Delivery::Dropped => {
                    warn!(subscriber = slot.id, seq, ?mode, "Stream subscriber is full, chunk dropped");
                    true
                }
                Delivery::Closed => {
                    debug!(subscriber = slot.id, "Stream subscriber closed");
                    false
                }
            }
        });
    }

    /// Whether any live subscriber selects `mode`
    pub fn has_subscribers_for(&self, mode: StreamMode) -> bool {
        self.subscribers
            .lock()
            .iter()
            .any(|slot| slot.modes.contains(&mode))
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscriber, ending their streams
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

/// Receiving end of one subscriber
pub struct Subscription {
    receiver: Receiver,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Next chunk, `None` once the multiplexer is gone or closed
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        match &mut self.receiver {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Chunks discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Turn into a `Stream` of chunks
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = StreamChunk> + Send>> {
        match self.receiver {
            Receiver::Bounded(rx) => Box::pin(ReceiverStream::new(rx)),
            Receiver::Unbounded(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use stategraph_checkpoint::InterruptWhen;

    fn values(step: i64) -> StreamEvent {
        StreamEvent::Values {
            step,
            state: json!({"step": step}),
        }
    }

    fn interrupt() -> StreamEvent {
        StreamEvent::Interrupt {
            step: 1,
            interrupts: vec![InterruptRecord {
                id: "1:b:0".into(),
                task_id: "1:b".into(),
                node: "b".into(),
                step: 1,
                when: InterruptWhen::During,
                value: json!({"q": "approve?"}),
            }],
        }
    }

    #[test]
    fn test_debug_expands() {
        let modes = StreamMode::expand(&[StreamMode::Debug, StreamMode::Tasks, StreamMode::Values]);
        assert_eq!(
            modes,
            vec![StreamMode::Tasks, StreamMode::Checkpoints, StreamMode::Values]
        );
    }

    #[tokio::test]
    async fn test_mode_filtering_and_order() {
        let mux = StreamMultiplexer::new();
        let mut sub = mux.subscribe(&[StreamMode::Values, StreamMode::Custom], BufferPolicy::Unbounded);

        mux.emit(values(0));
        mux.emit(StreamEvent::Updates {
            step: 0,
            node: "a".into(),
            task_id: "0:a".into(),
            update: json!({}),
        });
        mux.emit(StreamEvent::Custom {
            node: "a".into(),
            task_id: "0:a".into(),
            data: json!("hi"),
        });
        mux.close();

        let chunks: Vec<StreamChunk> = sub_collect(&mut sub).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].mode, StreamMode::Values);
        assert_eq!(chunks[1].mode, StreamMode::Custom);
        assert_eq!(chunks[1].seq, 2);
    }

    async fn sub_collect(sub: &mut Subscription) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = sub.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_interrupt_reaches_every_subscriber_once() {
        let mux = StreamMultiplexer::new();
        let updates = mux.subscribe(&[StreamMode::Updates, StreamMode::Values], BufferPolicy::Unbounded);
        let tasks = mux.subscribe(&[StreamMode::Debug], BufferPolicy::DropNewest(4));

        mux.emit(interrupt());
        mux.close();

        let a: Vec<_> = updates.into_stream().collect().await;
        let b: Vec<_> = tasks.into_stream().collect().await;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].mode, StreamMode::Updates);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].mode, StreamMode::Tasks);
        assert_eq!(a[0].seq, b[0].seq);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking() {
        let mux = StreamMultiplexer::new();
        let slow = mux.subscribe(&[StreamMode::Values], BufferPolicy::DropNewest(2));
        let mut fast = mux.subscribe(&[StreamMode::Values], BufferPolicy::Unbounded);

        for step in 0..5 {
            mux.emit(values(step));
        }
        assert_eq!(slow.dropped(), 3);

        mux.close();
        assert_eq!(sub_collect(&mut fast).await.len(), 5);
        let kept: Vec<_> = slow.into_stream().collect().await;
        assert_eq!(kept.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let mux = StreamMultiplexer::new();
        let sub = mux.subscribe(&[StreamMode::Values], BufferPolicy::Unbounded);
        assert!(mux.has_subscribers_for(StreamMode::Values));
        drop(sub);

        mux.emit(values(0));
        assert_eq!(mux.subscriber_count(), 0);
        assert!(!mux.has_subscribers_for(StreamMode::Values));
    }

    #[test]
    fn test_chunk_serialization() {
        let chunk = StreamChunk {
            seq: 3,
            mode: StreamMode::Values,
            event: values(2),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["mode"], "values");
        assert_eq!(value["event"]["event"], "values");
        assert_eq!(value["event"]["data"]["step"], 2);
    }

    #[test]
    fn test_buffer_policy_yaml() {
        let policy: BufferPolicy = serde_yaml::from_str("drop_newest: 8").unwrap();
        assert_eq!(policy, BufferPolicy::DropNewest(8));
        let policy: BufferPolicy = serde_yaml::from_str("unbounded").unwrap();
        assert_eq!(policy, BufferPolicy::Unbounded);
    }
}
