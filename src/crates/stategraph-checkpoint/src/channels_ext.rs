//! Channels with step-scoped or coordination semantics.
//!
//! - [`AnyValueChannel`]: several writers allowed, last in batch order wins
//! - [`EphemeralValueChannel`]: value lives for exactly one superstep
//! - [`NamedBarrierValueChannel`]: available once every named writer has written

use crate::channels::Channel;
use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// Single value that tolerates several writers per superstep.
///
/// The batch order decides the winner, so the value is only deterministic when
/// the caller orders the batch deterministically.
#[derive(Debug, Clone, Default)]
pub struct AnyValueChannel {
    value: Option<Value>,
}

impl AnyValueChannel {
    /// Create a new AnyValue channel.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for AnyValueChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or(CheckpointError::EmptyChannel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(value) => {
                self.value = Some(value);
                Ok(true)
            }
            None => Ok(false),
        }
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

/// Value visible only during the superstep after it was written.
///
/// An empty batch clears it. With `guard` set, two writers in one superstep
/// are a concurrent update.
#[derive(Debug, Clone)]
pub struct EphemeralValueChannel {
    value: Option<Value>,
    guard: bool,
}

impl EphemeralValueChannel {
    /// Create a guarded ephemeral channel (single writer per superstep).
    pub fn new() -> Self {
        Self {
            value: None,
            guard: true,
        }
    }

    /// Create an ephemeral channel that accepts several writers.
    pub fn new_unguarded() -> Self {
        Self {
            value: None,
            guard: false,
        }
    }
}

impl Default for EphemeralValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<Value> {
        self.value.clone().ok_or(CheckpointError::EmptyChannel)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(self.value.take().is_some());
        }
        if values.len() > 1 && self.guard {
            return Err(CheckpointError::ConcurrentUpdate(
                "ephemeral channel can receive only one value per step".to_string(),
            ));
        }
        self.value = values.into_iter().last();
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

/// Barrier that opens once every expected name has been written.
///
/// Writes are the names of the senders. Consuming the channel after the
/// waiting task ran resets it for the next round.
#[derive(Debug, Clone)]
pub struct NamedBarrierValueChannel {
    names: BTreeSet<String>,
    seen: BTreeSet<String>,
}

impl NamedBarrierValueChannel {
    /// Create a barrier waiting for `names`.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            seen: BTreeSet::new(),
        }
    }
}

impl Channel for NamedBarrierValueChannel {
    fn get(&self) -> Result<Value> {
        if self.seen != self.names {
            return Err(CheckpointError::EmptyChannel);
        }
        Ok(Value::Null)
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut updated = false;
        for value in values {
            let name = value.as_str().ok_or_else(|| {
                CheckpointError::InvalidUpdate("barrier expects sender names".to_string())
            })?;
            if !self.names.contains(name) {
                return Err(CheckpointError::InvalidUpdate(format!(
                    "'{}' is not a member of this barrier",
                    name
                )));
            }
            updated |= self.seen.insert(name.to_string());
        }
        Ok(updated)
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(Value::Array(
            self.seen.iter().cloned().map(Value::String).collect(),
        ))
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        let items = checkpoint.as_array().ok_or_else(|| {
            CheckpointError::Invalid("barrier checkpoint must be an array".to_string())
        })?;
        self.seen = items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.seen == self.names
    }

    fn consume(&mut self) -> bool {
        if self.seen == self.names {
            self.seen.clear();
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
