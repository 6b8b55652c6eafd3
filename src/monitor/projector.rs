// DANS : src/monitor/projector.rs

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info, warn};

use super::classifier::{ClassifiedEvent, MatchKind};
use super::registry::TrackedTarget;
use crate::monitoring::metrics::MonitorMetrics;
use crate::store::{ActivitySource, ActivityStore, Agent, AgentDefaults, StoreError};

/// Une activité attribuée à un portefeuille suivi, prête à être projetée.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityObservation {
    pub wallet: TrackedTarget,
    pub signature: Option<String>,
    pub source: ActivitySource,
    pub metadata: Value,
}

impl ActivityObservation {
    /// `None` pour tout ce qui n'est pas une activité attribuée à une cible.
    pub fn from_event(event: ClassifiedEvent) -> Option<Self> {
        match event {
            ClassifiedEvent::AccountActivity { target, provider_id, slot, raw_payload } => Some(Self {
                wallet: target,
                signature: None,
                source: ActivitySource::AccountWatch,
                metadata: json!({
                    "subscription": provider_id,
                    "slot": slot,
                    "payload": raw_payload,
                }),
            }),
            ClassifiedEvent::ProgramActivity {
                program_key,
                matched_target: Some(target),
                match_kind,
                signature,
                raw_logs,
                failed,
            } => Some(Self {
                wallet: target,
                signature: Some(signature),
                source: ActivitySource::ProgramLog,
                metadata: json!({
                    "program": program_key.map(|k| k.to_string()),
                    "match": match match_kind {
                        Some(MatchKind::AccountKeys) => "account-keys",
                        _ => "log-substring",
                    },
                    "failed": failed,
                    "logs": raw_logs,
                }),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutcome {
    Created(Agent),
    Incremented(Agent),
    /// `(portefeuille, signature)` déjà projeté : rien n'a été écrit.
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectorSettings {
    /// Idempotence par signature. Désactivée, une même signature vue deux fois
    /// (account + logs, ou après une reconnexion) produit deux enregistrements.
    pub dedup_signatures: bool,
    pub seen_signature_limit: usize,
    /// Événements projetés simultanément. Au-delà, la file n'est plus lue et
    /// l'émetteur attend.
    pub max_in_flight: usize,
}

impl Default for ProjectorSettings {
    fn default() -> Self {
        Self { dedup_signatures: true, seen_signature_limit: 10_000, max_in_flight: 64 }
    }
}

/// Ensemble borné des signatures déjà projetées (FIFO).
struct SeenSignatures {
    limit: usize,
    queue: VecDeque<(String, String)>,
    set: HashSet<(String, String)>,
}

impl SeenSignatures {
    fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), queue: VecDeque::new(), set: HashSet::new() }
    }

    fn contains(&self, entry: &(String, String)) -> bool {
        self.set.contains(entry)
    }

    fn insert(&mut self, entry: (String, String)) {
        if !self.set.insert(entry.clone()) {
            return;
        }
        self.queue.push_back(entry);
        while self.queue.len() > self.limit {
            if let Some(oldest) = self.queue.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

pub struct ActivityProjector {
    store: Arc<dyn ActivityStore>,
    settings: ProjectorSettings,
    seen: Mutex<SeenSignatures>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<MonitorMetrics>,
}

impl ActivityProjector {
    pub fn new(store: Arc<dyn ActivityStore>, settings: ProjectorSettings, metrics: Arc<MonitorMetrics>) -> Self {
        Self {
            store,
            seen: Mutex::new(SeenSignatures::new(settings.seen_signature_limit)),
            settings,
            key_locks: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Crée l'agent s'il est absent (compteur à 0), sinon incrémente son compteur,
    /// puis ajoute l'activité. Les écritures d'un même portefeuille sont sérialisées.
    pub async fn handle(&self, observation: ActivityObservation) -> Result<ProjectionOutcome, StoreError> {
        let key = observation.wallet.key.to_string();
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.project(&key, observation).await
        };
        self.release_key_lock(&key, lock);
        result
    }

    async fn project(&self, key: &str, observation: ActivityObservation) -> Result<ProjectionOutcome, StoreError> {
        let seen_entry = observation
            .signature
            .as_ref()
            .filter(|_| self.settings.dedup_signatures)
            .map(|signature| (key.to_string(), signature.clone()));
        if let Some(entry) = &seen_entry {
            if self.seen.lock().contains(entry) {
                self.metrics.duplicate_skipped();
                debug!(wallet = %key, signature = %entry.1, "[Projector] Signature déjà projetée, ignorée.");
                return Ok(ProjectionOutcome::Duplicate);
            }
        }

        let (agent, created) = match self.store.find_agent_by_key(key).await? {
            Some(agent) => (self.store.increment_trade_count(agent.id).await?, false),
            None => {
                let defaults = AgentDefaults { label: observation.wallet.label.clone() };
                let agent = self.store.create_agent(key, defaults).await?;
                info!(wallet = %key, agent_id = agent.id, "[Projector] Nouvel agent créé.");
                (agent, true)
            }
        };

        // Le compteur est écrit : une nouvelle livraison ne doit plus l'incrémenter,
        // même si l'enregistrement de l'activité échoue ensuite.
        if let Some(entry) = seen_entry {
            self.seen.lock().insert(entry);
        }

        self.store
            .record_activity(agent.id, observation.signature.as_deref(), observation.source, observation.metadata)
            .await?;

        self.metrics.event_projected();
        Ok(if created { ProjectionOutcome::Created(agent) } else { ProjectionOutcome::Incremented(agent) })
    }

    /// Consomme la file d'observations jusqu'à sa fermeture. Chaque événement est
    /// traité dans sa propre tâche : une erreur du store est journalisée et n'affecte
    /// ni la connexion ni les autres événements. Au plus `max_in_flight` tâches
    /// tournent en même temps ; un store lent remplit donc la file et bloque l'émetteur.
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<ActivityObservation>) {
        let limit = self.settings.max_in_flight.max(1);
        let mut tasks = JoinSet::new();
        loop {
            while tasks.len() >= limit {
                tasks.join_next().await;
            }
            let Some(observation) = receiver.recv().await else { break };
            let projector = self.clone();
            tasks.spawn(async move {
                let wallet = observation.wallet.key;
                let signature = observation.signature.clone();
                if let Err(e) = projector.handle(observation).await {
                    projector.metrics.store_error();
                    warn!(%wallet, ?signature, error = %e, "[Projector] Échec de la projection d'une activité.");
                }
            });
            while tasks.try_join_next().is_some() {}
        }
        while tasks.join_next().await.is_some() {}
        debug!("[Projector] File d'observations fermée, projecteur arrêté.");
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks.lock().entry(key.to_string()).or_default().clone()
    }

    /// Oublie le verrou d'un portefeuille dès que plus personne ne l'attend.
    fn release_key_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}
