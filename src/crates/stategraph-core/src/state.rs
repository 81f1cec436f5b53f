//! State schema: named channels and their merge strategies
//!
//! Graph state is an object whose keys are declared channels. Each channel
//! names a [`Reducer`] that folds all writes of a superstep into its value in
//! one call. The set is closed on purpose, with [`Reducer::Custom`] as the
//! single escape hatch.
//!
//! | Reducer | Concurrent writers | Result |
//! |---------|--------------------|--------|
//! | `LastValue` | rejected (`ConcurrentUpdate`) | the single write |
//! | `AnyValue` | allowed | last write in task order |
//! | `Append` | allowed | list extended in task order |
//! | `Union` | allowed | ordered set union |
//! | `Sum` | allowed | numeric sum |
//! | `MergeObject` | allowed | shallow merge, later task wins per key |
//! | `Messages` | allowed | append, same `"id"` replaces in place |
//! | `Ephemeral` | rejected | value visible for one superstep |
//! | `Custom` | allowed only if declared associative | user function |
//!
//! Task order is node registration order for edge-triggered tasks, followed
//! by fan-out tasks in the order their `Send`s were issued. It is the same on
//! every run, which is what makes `AnyValue` and `MergeObject` deterministic.
//!
//! A custom reducer that is not associative yields different results
//! depending on how concurrent writes are grouped, so it is limited to one
//! writer per superstep.

use crate::messages::add_messages;
use serde_json::Value;
use stategraph_checkpoint::{
    AnyValueChannel, BatchReduceFn, BinaryOperatorChannel, Channel, EphemeralValueChannel,
    LastValueChannel, ReduceChannel, TopicChannel, UnionChannel,
};
use std::fmt;
use std::sync::Arc;

/// User supplied batch merge function `(old, writes) -> new`
#[derive(Clone)]
pub struct CustomReducer {
    name: String,
    func: BatchReduceFn,
    associative: bool,
}

impl CustomReducer {
    /// A merge function that may receive several writes in one call
    ///
    /// The caller asserts that grouping writes differently never changes the
    /// result.
    pub fn associative<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<Value>, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            associative: true,
        }
    }

    /// A merge function that tolerates only one writer per superstep
    pub fn single_writer<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<Value>, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            associative: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_associative(&self) -> bool {
        self.associative
    }
}

impl fmt::Debug for CustomReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomReducer")
            .field("name", &self.name)
            .field("associative", &self.associative)
            .finish()
    }
}

/// Merge strategy of a channel
#[derive(Debug, Clone, Default)]
pub enum Reducer {
    /// Single writer per superstep
    #[default]
    LastValue,
    /// Several writers, last in task order wins
    AnyValue,
    /// List append, array writes flattened one level
    Append,
    /// Ordered set union
    Union,
    /// Numeric sum
    Sum,
    /// Shallow object merge
    MergeObject,
    /// Message history, see [`add_messages`](crate::messages::add_messages)
    Messages,
    /// Value cleared at the next superstep
    Ephemeral,
    /// User function
    Custom(CustomReducer),
}

impl Reducer {
    /// Whether several writes in one superstep are merged rather than rejected
    pub fn accepts_concurrent_writes(&self) -> bool {
        match self {
            Reducer::LastValue | Reducer::Ephemeral => false,
            Reducer::Custom(custom) => custom.is_associative(),
            _ => true,
        }
    }

    /// Fresh channel implementing this strategy
    pub(crate) fn build_channel(&self) -> Box<dyn Channel> {
        match self {
            Reducer::LastValue => Box::new(LastValueChannel::new()),
            Reducer::AnyValue => Box::new(AnyValueChannel::new()),
            Reducer::Append => Box::new(TopicChannel::new()),
            Reducer::Union => Box::new(UnionChannel::new()),
            Reducer::Sum => Box::new(BinaryOperatorChannel::sum()),
            Reducer::MergeObject => Box::new(BinaryOperatorChannel::merge_object()),
            Reducer::Messages => Box::new(ReduceChannel::new(Arc::new(add_messages), true)),
            Reducer::Ephemeral => Box::new(EphemeralValueChannel::new()),
            Reducer::Custom(custom) => {
                Box::new(ReduceChannel::new(custom.func.clone(), custom.associative))
            }
        }
    }

    /// Whether the channel forgets its value at the next superstep
    pub(crate) fn is_ephemeral(&self) -> bool {
        matches!(self, Reducer::Ephemeral)
    }
}

/// Declaration of a state channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub reducer: Reducer,
    /// Value the channel starts with on a fresh run
    pub default: Option<Value>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, reducer: Reducer) -> Self {
        Self {
            name: name.into(),
            reducer,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_concurrency_classes() {
        assert!(!Reducer::LastValue.accepts_concurrent_writes());
        assert!(!Reducer::Ephemeral.accepts_concurrent_writes());
        assert!(Reducer::Append.accepts_concurrent_writes());
        assert!(Reducer::AnyValue.accepts_concurrent_writes());
        assert!(Reducer::Messages.accepts_concurrent_writes());

        let concat = CustomReducer::single_writer("concat", |old, writes| {
            let mut text = old.and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
            for w in writes {
                text.push_str(w.as_str().unwrap_or_default());
            }
            Ok(json!(text))
        });
        assert!(!Reducer::Custom(concat).accepts_concurrent_writes());
    }

    #[test]
    fn test_built_channels_follow_strategy() {
        let mut last = Reducer::LastValue.build_channel();
        assert!(last.update(vec![json!(1), json!(2)]).is_err());

        let mut any = Reducer::AnyValue.build_channel();
        any.update(vec![json!(1), json!(2)]).unwrap();
        assert_eq!(any.get().unwrap(), json!(2));

        let mut merged = Reducer::MergeObject.build_channel();
        merged
            .update(vec![json!({"a": 1, "b": 1}), json!({"b": 2})])
            .unwrap();
        assert_eq!(merged.get().unwrap(), json!({"a": 1, "b": 2}));

        let max = CustomReducer::associative("max", |old, writes| {
            let best = writes
                .iter()
                .chain(old.iter())
                .filter_map(Value::as_i64)
                .max()
                .ok_or_else(|| "max expects integers".to_string())?;
            Ok(json!(best))
        });
        let mut custom = Reducer::Custom(max).build_channel();
        custom.update(vec![json!(3), json!(9), json!(4)]).unwrap();
        custom.update(vec![json!(5)]).unwrap();
        assert_eq!(custom.get().unwrap(), json!(9));
        assert!(custom.update(vec![json!("x")]).is_ok());
    }

    #[test]
    fn test_messages_channel_replaces_by_id() {
        let mut messages = Reducer::Messages.build_channel();
        messages
            .update(vec![json!({"id": "q", "text": "?"}), json!({"id": "a", "text": "draft"})])
            .unwrap();
        messages
            .update(vec![json!({"id": "a", "text": "final"}), json!({"id": "a2", "text": "more"})])
            .unwrap();
        assert_eq!(
            messages.get().unwrap(),
            json!([
                {"id": "q", "text": "?"},
                {"id": "a", "text": "final"},
                {"id": "a2", "text": "more"}
            ])
        );
        assert!(messages.update(vec![json!(42)]).is_err());
    }
}
