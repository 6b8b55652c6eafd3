// DANS : src/store/mod.rs

//! Contrat du store externe (agents et activités) et deux implémentations :
//! en mémoire, et fichier JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;

pub type AgentId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Adresse du portefeuille (base58).
    pub key: String,
    pub label: Option<String>,
    pub trade_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Champs par défaut d'un agent créé à la première activité observée.
#[derive(Debug, Clone, Default)]
pub struct AgentDefaults {
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivitySource {
    #[serde(rename = "account-watch")]
    AccountWatch,
    #[serde(rename = "program-log")]
    ProgramLog,
}

impl ActivitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountWatch => "account-watch",
            Self::ProgramLog => "program-log",
        }
    }
}

impl fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub agent_id: AgentId,
    pub signature: Option<String>,
    pub source: ActivitySource,
    pub metadata: Value,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Ce que le moniteur attend du store : lecture par clé, création,
/// incrément du compteur de trades, ajout d'une activité. Jamais de suppression.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn find_agent_by_key(&self, key: &str) -> Result<Option<Agent>, StoreError>;

    async fn create_agent(&self, key: &str, defaults: AgentDefaults) -> Result<Agent, StoreError>;

    async fn increment_trade_count(&self, agent_id: AgentId) -> Result<Agent, StoreError>;

    async fn record_activity(
        &self,
        agent_id: AgentId,
        signature: Option<&str>,
        source: ActivitySource,
        metadata: Value,
    ) -> Result<(), StoreError>;
}

/// État partagé par les deux implémentations fournies.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    next_id: AgentId,
    agents: Vec<Agent>,
    activities: Vec<ActivityRecord>,
}

impl StoreState {
    fn find(&self, key: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.key == key)
    }

    fn create(&mut self, key: &str, defaults: AgentDefaults) -> Result<Agent, StoreError> {
        if self.find(key).is_some() {
            return Err(StoreError::Backend(format!("agent {key} already exists")));
        }
        self.next_id += 1;
        let now = Utc::now();
        let agent = Agent {
            id: self.next_id,
            key: key.to_string(),
            label: defaults.label,
            trade_count: 0,
            created_at: now,
            last_active_at: now,
        };
        self.agents.push(agent.clone());
        Ok(agent)
    }

    fn increment(&mut self, agent_id: AgentId) -> Result<Agent, StoreError> {
        let agent = self
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent #{agent_id}")))?;
        agent.trade_count += 1;
        agent.last_active_at = Utc::now();
        Ok(agent.clone())
    }

    fn record(
        &mut self,
        agent_id: AgentId,
        signature: Option<&str>,
        source: ActivitySource,
        metadata: Value,
    ) -> Result<(), StoreError> {
        if !self.agents.iter().any(|a| a.id == agent_id) {
            return Err(StoreError::NotFound(format!("agent #{agent_id}")));
        }
        self.activities.push(ActivityRecord {
            agent_id,
            signature: signature.map(ToString::to_string),
            source,
            metadata,
            observed_at: Utc::now(),
        });
        Ok(())
    }
}
