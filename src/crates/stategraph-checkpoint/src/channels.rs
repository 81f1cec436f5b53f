//! Channels: named state slots and their merge functions
//!
//! Every write a superstep produces for a channel is handed to
//! [`Channel::update`] as one batch. The channel decides how the batch combines
//! with the value it already holds, and whether a batch of that size is legal at
//! all. Callers are expected to pass the batch in a deterministic order (the
//! scheduler sorts writes by task order before calling `update`).

use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Base trait for all channels
pub trait Channel: Send + Sync + Debug {
    /// Current value of the channel
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::EmptyChannel`] if the channel holds nothing
    fn get(&self) -> Result<Value>;

    /// Merge one superstep worth of writes into the channel
    ///
    /// An empty batch signals that a superstep passed without writes to this
    /// channel. Returns `true` if the stored value changed.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Serializable form of the channel state, `None` when there is nothing to persist
    fn checkpoint(&self) -> Option<Value>;

    /// Restore the channel from a value produced by [`Channel::checkpoint`]
    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()>;

    /// Whether the channel currently holds a value
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a task subscribed to it ran
    ///
    /// Returns `true` if the channel was updated.
    fn consume(&mut self) -> bool {
        false
    }

    /// Clone the channel into a Box
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Single value, at most one writer per superstep
///
/// Two writes in the same batch are a [`CheckpointError::ConcurrentUpdate`]:
/// last-write-wins has no meaningful "last" among tasks of one superstep.
#[derive(Debug, Clone, Default)]
pub struct LastValueChannel {
    value: Option<Value>,
}

impl LastValueChannel {
    /// Create a new LastValue channel
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Create a new LastValue channel with an initial value
    pub fn with_value(value: Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or(CheckpointError::EmptyChannel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut values = values.into_iter();
        let Some(value) = values.next() else {
            return Ok(false);
        };
        if values.next().is_some() {
            return Err(CheckpointError::ConcurrentUpdate(
                "last-value channel can receive only one value per step".to_string(),
            ));
        }
        self.value = Some(value);
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Append-only list
///
/// Array writes are flattened one level, so writing `["a"]` appends `"a"`.
/// A non-accumulating topic keeps only the writes of the latest superstep,
/// which is what the scheduler uses for its fan-out queue.
#[derive(Debug, Clone)]
pub struct TopicChannel {
    values: Vec<Value>,
    accumulate: bool,
}

impl TopicChannel {
    /// Create an accumulating topic
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            accumulate: true,
        }
    }

    /// Create a topic that is cleared at the start of every superstep
    pub fn per_step() -> Self {
        Self {
            values: Vec::new(),
            accumulate: false,
        }
    }

    /// All accumulated values
    pub fn get_all(&self) -> &[Value] {
        &self.values
    }
}

impl Default for TopicChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_into(target: &mut Vec<Value>, value: Value) {
    match value {
        Value::Array(items) => target.extend(items),
        other => target.push(other),
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut updated = false;
        if !self.accumulate && !self.values.is_empty() {
            self.values.clear();
            updated = true;
        }
        if values.is_empty() {
            return Ok(updated);
        }
        for value in values {
            flatten_into(&mut self.values, value);
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(Value::Array(self.values.clone()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Array(items) => {
                self.values = items;
                Ok(())
            }
            _ => Err(CheckpointError::Invalid(
                "topic channel checkpoint must be an array".to_string(),
            )),
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Ordered set union
///
/// Behaves like an accumulating [`TopicChannel`] but drops values it already
/// holds. Insertion order of first occurrence is kept.
#[derive(Debug, Clone, Default)]
pub struct UnionChannel {
    values: Vec<Value>,
}

impl UnionChannel {
    /// Create an empty union channel
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for UnionChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut incoming = Vec::new();
        for value in values {
            flatten_into(&mut incoming, value);
        }
        let before = self.values.len();
        for value in incoming {
            if !self.values.contains(&value) {
                self.values.push(value);
            }
        }
        Ok(self.values.len() != before)
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(Value::Array(self.values.clone()))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Array(items) => {
                self.values = items;
                Ok(())
            }
            _ => Err(CheckpointError::Invalid(
                "union channel checkpoint must be an array".to_string(),
            )),
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Binary operator used by [`BinaryOperatorChannel`]
pub type BinaryOperatorFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Accumulator folding every write into the stored value with a binary operator
///
/// The operator must be associative: the batch is folded left to right and
/// then folded into the stored value.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<Value>,
    operator: BinaryOperatorFn,
}

impl BinaryOperatorChannel {
    /// Create a channel around an associative binary operator
    pub fn new<F>(operator: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            operator: Arc::new(operator),
        }
    }

    /// Numeric sum. Integers stay integers until a float is seen.
    ///
    /// Integer sums are exact across the whole `i64`/`u64` range and
    /// saturate at its ends.
    pub fn sum() -> Self {
        Self::new(|a, b| match (as_integer(&a), as_integer(&b)) {
            (Some(x), Some(y)) => integer_value(x.saturating_add(y)),
            _ => {
                let x = a.as_f64().unwrap_or(0.0);
                let y = b.as_f64().unwrap_or(0.0);
                serde_json::json!(x + y)
            }
        })
    }

    /// Shallow object merge, keys from the right-hand side win
    pub fn merge_object() -> Self {
        Self::new(|a, b| match (a, b) {
            (Value::Object(mut left), Value::Object(right)) => {
                left.extend(right);
                Value::Object(left)
            }
            (_, right) => right,
        })
    }
}

fn as_integer(value: &Value) -> Option<i128> {
    value
        .as_i64()
        .map(i128::from)
        .or_else(|| value.as_u64().map(i128::from))
}

fn integer_value(n: i128) -> Value {
    if let Ok(n) = i64::try_from(n) {
        Value::from(n)
    } else if let Ok(n) = u64::try_from(n) {
        Value::from(n)
    } else if n > 0 {
        Value::from(u64::MAX)
    } else {
        Value::from(i64::MIN)
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("operator", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or(CheckpointError::EmptyChannel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let Some(reduced) = values
            .into_iter()
            .reduce(|acc, value| (self.operator)(acc, value))
        else {
            return Ok(false);
        };
        self.value = Some(match self.value.take() {
            Some(current) => (self.operator)(current, reduced),
            None => reduced,
        });
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Batch merge function: `(old, writes) -> new`
pub type BatchReduceFn =
    Arc<dyn Fn(Option<Value>, Vec<Value>) -> std::result::Result<Value, String> + Send + Sync>;

/// Channel backed by a user supplied batch merge function
///
/// When the function is not declared associative the channel accepts a single
/// writer per superstep, the same rule [`LastValueChannel`] enforces.
#[derive(Clone)]
pub struct ReduceChannel {
    value: Option<Value>,
    reducer: BatchReduceFn,
    associative: bool,
}

impl ReduceChannel {
    /// Create a channel around a batch merge function
    pub fn new(reducer: BatchReduceFn, associative: bool) -> Self {
        Self {
            value: None,
            reducer,
            associative,
        }
    }

    /// Whether concurrent writers are allowed
    pub fn is_associative(&self) -> bool {
        self.associative
    }
}

impl Debug for ReduceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceChannel")
            .field("value", &self.value)
            .field("associative", &self.associative)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for ReduceChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or(CheckpointError::EmptyChannel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        if values.len() > 1 && !self.associative {
            return Err(CheckpointError::ConcurrentUpdate(format!(
                "non-associative reducer received {} writes in one step",
                values.len()
            )));
        }
        let next = (self.reducer)(self.value.clone(), values).map_err(CheckpointError::InvalidUpdate)?;
        self.value = Some(next);
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_value_channel() {
        let mut channel = LastValueChannel::new();
        assert!(!channel.is_available());

        assert!(channel.update(vec![json!(42)]).unwrap());
        assert_eq!(channel.get().unwrap(), json!(42));

        channel.update(vec![json!(100)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(100));
    }

    #[test]
    fn test_last_value_rejects_two_writers() {
        let mut channel = LastValueChannel::new();
        let result = channel.update(vec![json!(1), json!(2)]);
        assert!(matches!(result, Err(CheckpointError::ConcurrentUpdate(_))));
        assert!(!channel.is_available(), "failed update must not change the value");
    }

    #[test]
    fn test_last_value_empty_update_is_noop() {
        let mut channel = LastValueChannel::with_value(json!("keep"));
        assert!(!channel.update(vec![]).unwrap());
        assert_eq!(channel.get().unwrap(), json!("keep"));
    }

    #[test]
    fn test_empty_get_is_error() {
        let channel = LastValueChannel::new();
        assert!(matches!(channel.get(), Err(CheckpointError::EmptyChannel)));
        assert!(channel.checkpoint().is_none());
    }

    #[test]
    fn test_topic_flattens_arrays() {
        let mut channel = TopicChannel::new();
        channel.update(vec![json!(["A"]), json!("B")]).unwrap();
        channel.update(vec![json!(["C", "D"])]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(["A", "B", "C", "D"]));
    }

    #[test]
    fn test_topic_ordering_preserved_across_steps() {
        let mut channel = TopicChannel::new();
        channel.update(vec![json!(1)]).unwrap();
        channel.update(vec![json!(2)]).unwrap();
        channel.update(vec![json!(3)]).unwrap();
        assert_eq!(channel.get_all(), &[json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_per_step_topic_clears() {
        let mut channel = TopicChannel::per_step();
        channel.update(vec![json!({"node": "a"})]).unwrap();
        assert!(channel.is_available());

        assert!(channel.update(vec![]).unwrap());
        assert!(!channel.is_available());
        assert!(!channel.update(vec![]).unwrap());
    }

    #[test]
    fn test_topic_checkpoint_restore() {
        let mut channel = TopicChannel::new();
        channel.update(vec![json!([1, 2, 3])]).unwrap();

        let mut restored = TopicChannel::new();
        restored.from_checkpoint(channel.checkpoint().unwrap()).unwrap();
        assert_eq!(restored.get().unwrap(), json!([1, 2, 3]));

        assert!(restored.from_checkpoint(json!({"not": "a list"})).is_err());
    }

    #[test]
    fn test_union_deduplicates() {
        let mut channel = UnionChannel::new();
        assert!(channel.update(vec![json!(["x", "y"]), json!("x")]).unwrap());
        assert!(!channel.update(vec![json!(["y"])]).unwrap());
        channel.update(vec![json!("z")]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(["x", "y", "z"]));
    }

    #[test]
    fn test_sum_keeps_integers() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(6));

        channel.update(vec![json!(0.5)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(6.5));
    }

    #[test]
    fn test_sum_is_exact_above_i64() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(u64::MAX - 10), json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(u64::MAX - 7));

        channel.update(vec![json!(-(i64::MAX)), json!(-1)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(u64::MAX - 7 - i64::MAX as u64 - 1));

        channel.update(vec![json!(u64::MAX)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(u64::MAX));
    }

    #[test]
    fn test_merge_object() {
        let mut channel = BinaryOperatorChannel::merge_object();
        channel
            .update(vec![json!({"a": 1, "b": 1}), json!({"b": 2})])
            .unwrap();
        channel.update(vec![json!({"c": 3})]).unwrap();
        assert_eq!(channel.get().unwrap(), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_binary_operator_clone_is_independent() {
        let mut original = BinaryOperatorChannel::sum();
        original.update(vec![json!(1)]).unwrap();

        let mut cloned = original.clone_box();
        cloned.update(vec![json!(10)]).unwrap();

        assert_eq!(original.get().unwrap(), json!(1));
        assert_eq!(cloned.get().unwrap(), json!(11));
    }

    #[test]
    fn test_reduce_channel_associative() {
        let max: BatchReduceFn = Arc::new(|old, writes| {
            let best = writes
                .iter()
                .chain(old.iter())
                .filter_map(Value::as_i64)
                .max()
                .ok_or_else(|| "expected integers".to_string())?;
            Ok(json!(best))
        });
        let mut channel = ReduceChannel::new(max, true);
        channel.update(vec![json!(3), json!(9), json!(4)]).unwrap();
        channel.update(vec![json!(5)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(9));

        let err = channel.update(vec![json!("nope")]).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidUpdate(_)));
    }

    #[test]
    fn test_reduce_channel_non_associative_single_writer() {
        let concat: BatchReduceFn = Arc::new(|old, writes| {
            let mut text = old.and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
            for write in writes {
                text.push_str(write.as_str().unwrap_or_default());
            }
            Ok(json!(text))
        });
        let mut channel = ReduceChannel::new(concat, false);
        channel.update(vec![json!("ab")]).unwrap();
        channel.update(vec![json!("cd")]).unwrap();
        assert_eq!(channel.get().unwrap(), json!("abcd"));

        let err = channel.update(vec![json!("x"), json!("y")]).unwrap_err();
        assert!(matches!(err, CheckpointError::ConcurrentUpdate(_)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn values(items: &[i64]) -> Vec<Value> {
            items.iter().map(|i| json!(i)).collect()
        }

        proptest! {
            #[test]
            fn prop_sum_ignores_batching(items in prop::collection::vec(-1000i64..1000, 1..20), split in 0usize..20) {
                let split = split.min(items.len());
                let mut once = BinaryOperatorChannel::sum();
                once.update(values(&items)).unwrap();

                let mut twice = BinaryOperatorChannel::sum();
                twice.update(values(&items[..split])).unwrap();
                twice.update(values(&items[split..])).unwrap();

                prop_assert_eq!(once.get().unwrap(), twice.get().unwrap());
            }

            #[test]
            fn prop_topic_keeps_every_write(items in prop::collection::vec(any::<i64>(), 0..20), split in 0usize..20) {
                let split = split.min(items.len());
                let mut channel = TopicChannel::new();
                channel.update(values(&items[..split])).unwrap();
                channel.update(values(&items[split..])).unwrap();

                let expected = values(&items);
                prop_assert_eq!(channel.get_all(), expected.as_slice());
            }
        }
    }
}
