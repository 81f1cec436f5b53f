//! CompiledGraph struct and builder methods

use crate::auth::{AccessAction, AccessHook, AccessRequest};
use crate::config::EngineConfig;
use crate::error::{GraphError, Result};
use crate::pregel::ExecutionPlan;
use serde_json::Value;
use stategraph_checkpoint::CheckpointSaver;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Compiled graph ready for execution
///
/// Cloning is cheap; clones share the plan, the checkpointer and the hooks.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) plan: Arc<ExecutionPlan>,
    pub(crate) checkpoint_saver: Option<Arc<dyn CheckpointSaver>>,
    pub(crate) config: EngineConfig,
    pub(crate) access_hooks: Vec<Arc<dyn AccessHook>>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.plan.node_names().collect::<Vec<_>>())
            .field("checkpointer", &self.checkpoint_saver.is_some())
            .field("config", &self.config)
            .field("access_hooks", &self.access_hooks.len())
            .finish()
    }
}

impl CompiledGraph {
    pub(crate) fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            checkpoint_saver: None,
            config: EngineConfig::default(),
            access_hooks: Vec::new(),
        }
    }

    /// Persist runs through `saver`
    ///
    /// Without a checkpointer runs still execute, but cannot be resumed,
    /// inspected or forked.
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpoint_saver = Some(saver);
        self
    }

    /// Replace the engine settings
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an access hook; hooks run in registration order
    pub fn with_access_hook(mut self, hook: impl AccessHook + 'static) -> Self {
        self.access_hooks.push(Arc::new(hook));
        self
    }

    /// The compiled plan
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Engine settings in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpoint_saver.as_ref()
    }

    /// Ask every hook whether `action` may touch `thread_id`
    pub(crate) async fn authorize(
        &self,
        action: AccessAction,
        thread_id: &str,
        configurable: &HashMap<String, Value>,
    ) -> Result<()> {
        if self.access_hooks.is_empty() {
            return Ok(());
        }
        let request = AccessRequest {
            action,
            thread_id: thread_id.to_string(),
            configurable: configurable.clone(),
        };
        for hook in &self.access_hooks {
            if let Err(reason) = hook.authorize(&request).await {
                warn!(%action, thread_id, reason = %reason, "Access denied");
                return Err(GraphError::AccessDenied {
                    action: action.to_string(),
                    thread_id: thread_id.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn require_saver(&self) -> Result<Arc<dyn CheckpointSaver>> {
        self.checkpoint_saver
            .clone()
            .ok_or_else(|| GraphError::Configuration("no checkpointer configured".to_string()))
    }
}

pub(crate) fn require_thread_id(thread_id: Option<&str>) -> Result<&str> {
    thread_id.ok_or_else(|| GraphError::Configuration("thread_id is required".to_string()))
}
