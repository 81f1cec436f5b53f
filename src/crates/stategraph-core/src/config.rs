//! Engine and per-run configuration
//!
//! [`EngineConfig`] holds the defaults a compiled graph runs with. It can be
//! loaded from YAML and adjusted through `STATEGRAPH_*` environment
//! variables:
//!
//! ```yaml
//! step_limit: 50
//! max_concurrency: 8
//! task_timeout_ms: 30000
//! retry:
//!   max_attempts: 3
//!   initial_interval: 0.2
//! stream_buffer:
//!   drop_newest: 1024
//! ```
//!
//! [`RunConfig`] carries what changes per call: the run identity, an optional
//! checkpoint to branch from, overrides, values handed to nodes and a
//! cancellation token.

use crate::error::{GraphError, Result};
use crate::retry::RetryPolicy;
use crate::stream::BufferPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Environment variable overriding [`EngineConfig::step_limit`]
pub const ENV_STEP_LIMIT: &str = "STATEGRAPH_STEP_LIMIT";
/// Environment variable overriding [`EngineConfig::max_concurrency`]
pub const ENV_MAX_CONCURRENCY: &str = "STATEGRAPH_MAX_CONCURRENCY";
/// Environment variable overriding [`EngineConfig::task_timeout_ms`]
pub const ENV_TASK_TIMEOUT_MS: &str = "STATEGRAPH_TASK_TIMEOUT_MS";

/// Default number of supersteps a single invocation may run
pub const DEFAULT_STEP_LIMIT: usize = 25;

/// Engine-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Supersteps allowed per invocation before the run stops with `StepLimitExceeded`
    pub step_limit: usize,

    /// Tasks of one superstep executing at the same time; unlimited when unset
    pub max_concurrency: Option<usize>,

    /// Deadline for a single node attempt
    pub task_timeout_ms: Option<u64>,

    /// Retry policy for nodes that do not declare their own
    pub retry: RetryPolicy,

    /// Buffering of stream subscribers created by `stream`
    pub stream_buffer: BufferPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            max_concurrency: None,
            task_timeout_ms: None,
            retry: RetryPolicy::none(),
            stream_buffer: BufferPolicy::Unbounded,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Self::from_yaml_str(&content)
    }

    /// Apply `STATEGRAPH_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, e.g. a map in tests
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_STEP_LIMIT) {
            self.step_limit = parse_var(ENV_STEP_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = Some(parse_var(ENV_MAX_CONCURRENCY, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TASK_TIMEOUT_MS) {
            self.task_timeout_ms = Some(parse_var(ENV_TASK_TIMEOUT_MS, &raw)?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.step_limit == 0 {
            return Err(GraphError::Configuration("step_limit must be at least 1".into()));
        }
        if self.max_concurrency == Some(0) {
            return Err(GraphError::Configuration("max_concurrency must be at least 1".into()));
        }
        if let BufferPolicy::DropNewest(0) = self.stream_buffer {
            return Err(GraphError::Configuration("stream_buffer capacity must be at least 1".into()));
        }
        self.retry.validate()
    }

    /// Per-attempt deadline, if any
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| GraphError::Configuration(format!("{} has invalid value '{}'", key, raw)))
}

/// Configuration of a single invocation
///
/// # Example
///
/// ```rust
/// use stategraph_core::RunConfig;
/// use serde_json::json;
///
/// let config = RunConfig::new("thread-1")
///     .with_step_limit(10)
///     .with_configurable("user_id", json!("u-42"));
/// assert_eq!(config.thread_id.as_deref(), Some("thread-1"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Run identity; a random one is generated when unset
    pub thread_id: Option<String>,

    /// Continue from this checkpoint instead of the latest one
    pub checkpoint_id: Option<String>,

    /// Override of [`EngineConfig::step_limit`]
    pub step_limit: Option<usize>,

    /// Override of [`EngineConfig::max_concurrency`]
    pub max_concurrency: Option<usize>,

    /// Values handed to every node through its context
    pub configurable: HashMap<String, Value>,

    /// Cancels the run at the next superstep boundary
    pub cancel: CancellationToken,
}

impl RunConfig {
    /// Configuration for the run identified by `thread_id`
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }

    /// Branch from a specific checkpoint
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Override the step limit
    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = Some(step_limit);
        self
    }

    /// Override the concurrency limit
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Add a value visible to nodes
    pub fn with_configurable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.step_limit, 25);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.stream_buffer, BufferPolicy::Unbounded);
        assert!(config.task_timeout().is_none());
    }

    #[test]
    fn test_from_yaml() {
        let config = EngineConfig::from_yaml_str(
            "step_limit: 7\nmax_concurrency: 2\ntask_timeout_ms: 1500\nretry:\n  max_attempts: 4\nstream_buffer:\n  drop_newest: 16\n",
        )
        .unwrap();
        assert_eq!(config.step_limit, 7);
        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.task_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.stream_buffer, BufferPolicy::DropNewest(16));
    }

    #[test]
    fn test_yaml_rejects_zero_step_limit() {
        let err = EngineConfig::from_yaml_str("step_limit: 0\n").unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[test]
    fn test_yaml_rejects_unusable_retry_intervals() {
        for yaml in [
            "retry: {initial_interval: 1.0e30, max_interval: 1.0e30, jitter: false}\n",
            "retry: {max_interval: .inf}\n",
            "retry: {backoff_factor: -2.0}\n",
            "retry: {max_attempts: 0}\n",
        ] {
            let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, GraphError::Configuration(ref msg) if msg.contains("retry")), "{}", yaml);
        }
        assert!(EngineConfig::from_yaml_str("retry: {initial_interval: 2.0, max_interval: 60.0}\n").is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            (ENV_STEP_LIMIT, "3"),
            (ENV_MAX_CONCURRENCY, "4"),
            (ENV_TASK_TIMEOUT_MS, "250"),
        ]);
        let config = EngineConfig::default()
            .with_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.step_limit, 3);
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.task_timeout_ms, Some(250));

        let err = EngineConfig::default()
            .with_overrides_from(|key| (key == ENV_STEP_LIMIT).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_STEP_LIMIT));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        tokio::fs::write(&path, "step_limit: 12\n").await.unwrap();
        let config = EngineConfig::from_file(&path).await.unwrap();
        assert_eq!(config.step_limit, 12);
    }

    #[test]
    fn test_run_config_builder() {
        let token = CancellationToken::new();
        let config = RunConfig::new("t")
            .with_checkpoint_id("cp")
            .with_max_concurrency(2)
            .with_cancellation(token.clone());
        token.cancel();
        assert!(config.cancel.is_cancelled());
        assert_eq!(config.checkpoint_id.as_deref(), Some("cp"));
    }
}
