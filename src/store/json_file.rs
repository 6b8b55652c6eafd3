// DANS : src/store/json_file.rs

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::{
    ActivitySource, ActivityStore, Agent, AgentDefaults, AgentId, StoreError, StoreState,
};

/// Store persistant minimal : tout l'état tient dans un fichier JSON,
/// réécrit (fichier temporaire + renommage) après chaque mutation.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Ouvre le fichier s'il existe, sinon démarre avec un état vide.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StoreState = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), agents = state.agents.len(), "[Store] État chargé depuis le disque.");
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "[Store] Le fichier n'existe pas. Démarrage avec un état vide.");
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.state.lock().await.agents.clone()
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for JsonFileStore {
    async fn find_agent_by_key(&self, key: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.state.lock().await.find(key).cloned())
    }

    async fn create_agent(&self, key: &str, defaults: AgentDefaults) -> Result<Agent, StoreError> {
        let mut state = self.state.lock().await;
        let agent = state.create(key, defaults)?;
        self.persist(&state).await?;
        Ok(agent)
    }

    async fn increment_trade_count(&self, agent_id: AgentId) -> Result<Agent, StoreError> {
        let mut state = self.state.lock().await;
        let agent = state.increment(agent_id)?;
        self.persist(&state).await?;
        Ok(agent)
    }

    async fn record_activity(
        &self,
        agent_id: AgentId,
        signature: Option<&str>,
        source: ActivitySource,
        metadata: Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record(agent_id, signature, source, metadata)?;
        self.persist(&state).await
    }
}
