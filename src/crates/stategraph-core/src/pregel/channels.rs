//! Channel store: the only mutable state of a run
//!
//! Writes are proposed during a superstep and applied together by
//! [`ChannelStore::commit`]. A commit hands every channel all of its writes
//! in one batch, in task order, and either applies every batch or none of
//! them: a rejected batch leaves the store exactly as it was.
//!
//! Every channel a commit changes receives the same new version, one above
//! the highest version in the store. Versions only grow, so "changed since a
//! node last ran" is a plain comparison.

use crate::error::{GraphError, Result};
use crate::pregel::plan::ExecutionPlan;
use serde_json::{Map, Value};
use stategraph_checkpoint::{Channel, ChannelVersion, ChannelVersions, Checkpoint};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{trace, warn};

pub(crate) struct ChannelStore {
    channels: BTreeMap<String, Box<dyn Channel>>,
    versions: ChannelVersions,
    /// State channels in declaration order
    state: Vec<String>,
    /// Channels cleared by a superstep that does not write them
    expiring: BTreeSet<String>,
    pending: BTreeMap<String, Vec<Value>>,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("versions", &self.versions)
            .finish()
    }
}

impl ChannelStore {
    /// Fresh store with channel defaults applied
    pub(crate) fn new(plan: &ExecutionPlan) -> Result<Self> {
        let mut channels: BTreeMap<String, Box<dyn Channel>> = BTreeMap::new();
        let mut expiring = BTreeSet::new();

        for spec in &plan.channels {
            let mut channel = spec.reducer.build_channel();
            if let Some(default) = &spec.default {
                channel
                    .from_checkpoint(default.clone())
                    .map_err(|e| GraphError::from_channel(&spec.name, -1, e))?;
            }
            if spec.reducer.is_ephemeral() {
                expiring.insert(spec.name.clone());
            }
            channels.insert(spec.name.clone(), channel);
        }
        for (name, kind) in &plan.internal {
            if kind.expires() {
                expiring.insert(name.clone());
            }
            channels.insert(name.clone(), kind.build());
        }

        Ok(Self {
            channels,
            versions: ChannelVersions::new(),
            state: plan.channels.iter().map(|c| c.name.clone()).collect(),
            expiring,
            pending: BTreeMap::new(),
        })
    }

    /// Store holding the values of `checkpoint`
    ///
    /// Values of channels the plan no longer declares are skipped.
    pub(crate) fn from_checkpoint(plan: &ExecutionPlan, checkpoint: &Checkpoint) -> Result<Self> {
        let mut store = Self::new(plan)?;
        for (name, value) in &checkpoint.channel_values {
            match store.channels.get_mut(name) {
                Some(channel) => channel
                    .from_checkpoint(value.clone())
                    .map_err(|e| GraphError::from_channel(name, checkpoint.step, e))?,
                None => warn!(channel = %name, checkpoint_id = %checkpoint.id, "Checkpoint holds an unknown channel, skipped"),
            }
        }
        store.versions = checkpoint
            .channel_versions
            .iter()
            .filter(|(name, _)| store.channels.contains_key(*name))
            .map(|(name, version)| (name.clone(), version.clone()))
            .collect();
        Ok(store)
    }

    /// Queue writes for the next commit
    pub(crate) fn propose_writes(&mut self, step: i64, writes: Vec<(String, Value)>) -> Result<()> {
        for (channel, value) in writes {
            if !self.channels.contains_key(&channel) {
                self.pending.clear();
                return Err(GraphError::InvalidUpdate {
                    channel,
                    step,
                    message: "channel is not declared".to_string(),
                });
            }
            self.pending.entry(channel).or_default().push(value);
        }
        Ok(())
    }

    /// Apply all queued writes atomically
    ///
    /// With `expire`, channels that only live for one superstep and received
    /// no writes are cleared. Returns the names of the changed channels.
    pub(crate) fn commit(&mut self, step: i64, expire: bool) -> Result<Vec<String>> {
        let mut pending = std::mem::take(&mut self.pending);
        let mut batches: Vec<(String, Vec<Value>)> = Vec::new();
        if expire {
            for name in &self.expiring {
                let writes = pending.remove(name).unwrap_or_default();
                batches.push((name.clone(), writes));
            }
        }
        batches.extend(pending);

        let mut staged: Vec<(String, Box<dyn Channel>)> = Vec::new();
        for (name, writes) in batches {
            let Some(channel) = self.channels.get(&name) else {
                continue;
            };
            let mut next = channel.clone_box();
            let changed = next
                .update(writes)
                .map_err(|e| GraphError::from_channel(&name, step, e))?;
            if changed {
                staged.push((name, next));
            }
        }

        let mut changed: Vec<String> = Vec::with_capacity(staged.len());
        for (name, channel) in staged {
            self.channels.insert(name.clone(), channel);
            changed.push(name);
        }
        changed.sort();
        self.bump(&changed);
        trace!(step, changed = ?changed, "Channels committed");
        Ok(changed)
    }

    /// Tell the channel a task subscribed to it ran; true if that changed it
    pub(crate) fn consume(&mut self, name: &str) -> bool {
        let consumed = self
            .channels
            .get_mut(name)
            .map(|channel| channel.consume())
            .unwrap_or(false);
        if consumed {
            self.bump(&[name.to_string()]);
        }
        consumed
    }

    fn bump(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let next = self
            .versions
            .values()
            .filter_map(|v| match v {
                ChannelVersion::Int(i) => Some(*i),
                ChannelVersion::Float(f) => Some(f.ceil() as i64),
            })
            .max()
            .unwrap_or(0)
            + 1;
        for name in names {
            self.versions.insert(name.clone(), ChannelVersion::Int(next));
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Value> {
        self.channels.get(name).and_then(|c| c.get().ok())
    }

    pub(crate) fn is_available(&self, name: &str) -> bool {
        self.channels.get(name).map(|c| c.is_available()).unwrap_or(false)
    }

    pub(crate) fn version(&self, name: &str) -> Option<&ChannelVersion> {
        self.versions.get(name)
    }

    pub(crate) fn versions(&self) -> &ChannelVersions {
        &self.versions
    }

    /// All state channels that hold a value
    pub(crate) fn state_view(&self) -> Value {
        self.read_slice(None)
    }

    /// State channels named in `reads` (all when `None`) that hold a value
    pub(crate) fn read_slice(&self, reads: Option<&[String]>) -> Value {
        let mut map = Map::new();
        let names: Box<dyn Iterator<Item = &String>> = match reads {
            Some(reads) => Box::new(reads.iter()),
            None => Box::new(self.state.iter()),
        };
        for name in names {
            if let Some(value) = self.get(name) {
                map.insert(name.clone(), value);
            }
        }
        Value::Object(map)
    }

    /// Serialized form of every channel holding something
    pub(crate) fn checkpoint_values(&self) -> BTreeMap<String, Value> {
        self.channels
            .iter()
            .filter_map(|(name, channel)| channel.checkpoint().map(|v| (name.clone(), v)))
            .collect()
    }
}
