//! Access hooks checked at every entry point of a compiled graph
//!
//! Hooks decide whether a caller may touch a given run. They are consulted
//! before `invoke`, `stream`, `resume`, `get_state`, `get_state_history` and
//! `update_state`; resuming goes through the same check as starting.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Entry point being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessAction {
    Invoke,
    Stream,
    Resume,
    GetState,
    GetStateHistory,
    UpdateState,
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessAction::Invoke => "invoke",
            AccessAction::Stream => "stream",
            AccessAction::Resume => "resume",
            AccessAction::GetState => "get_state",
            AccessAction::GetStateHistory => "get_state_history",
            AccessAction::UpdateState => "update_state",
        };
        f.write_str(name)
    }
}

/// What a hook gets to look at
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub action: AccessAction,
    pub thread_id: String,
    pub configurable: HashMap<String, Value>,
}

/// Authorization check; `Err` carries the denial reason
#[async_trait]
pub trait AccessHook: Send + Sync {
    async fn authorize(&self, request: &AccessRequest) -> Result<(), String>;
}

#[async_trait]
impl<F> AccessHook for F
where
    F: Fn(&AccessRequest) -> Result<(), String> + Send + Sync,
{
    async fn authorize(&self, request: &AccessRequest) -> Result<(), String> {
        self(request)
    }
}
