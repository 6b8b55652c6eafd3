use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    ActivityRecord, ActivitySource, ActivityStore, Agent, AgentDefaults, AgentId, StoreError,
    StoreState,
};

/// Store en mémoire : tests, et exécutions sans persistance.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.state.lock().agents.clone()
    }

    pub fn agent(&self, key: &str) -> Option<Agent> {
        self.state.lock().find(key).cloned()
    }

    pub fn activities(&self) -> Vec<ActivityRecord> {
        self.state.lock().activities.clone()
    }
}

#[async_trait]
impl ActivityStore for InMemoryStore {
    async fn find_agent_by_key(&self, key: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.state.lock().find(key).cloned())
    }

    async fn create_agent(&self, key: &str, defaults: AgentDefaults) -> Result<Agent, StoreError> {
        self.state.lock().create(key, defaults)
    }

    async fn increment_trade_count(&self, agent_id: AgentId) -> Result<Agent, StoreError> {
        self.state.lock().increment(agent_id)
    }

    async fn record_activity(
        &self,
        agent_id: AgentId,
        signature: Option<&str>,
        source: ActivitySource,
        metadata: Value,
    ) -> Result<(), StoreError> {
        self.state.lock().record(agent_id, signature, source, metadata)
    }
}
