// DANS : src/monitor/mod.rs

pub mod classifier;
pub mod connection;
pub mod projector;
pub mod registry;

use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::monitoring::metrics::{MetricsSnapshot, MonitorMetrics};
use crate::store::ActivityStore;
use connection::{ConnectionManager, ConnectionState, ConnectionStatus, MonitorCommand};
use projector::{ActivityProjector, ProjectorSettings};
use registry::{RegistryError, Removal, Subscription, SubscriptionRegistry, TargetKind, TrackedTarget};

/// Taille de la file entre la connexion et le projecteur.
const ACTIVITY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub ws_url: String,
    pub max_subscriptions: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub resubscribe_pacing: Duration,
    pub commitment: String,
    pub account_encoding: String,
    pub dedup_signatures: bool,
    pub seen_signature_limit: usize,
    pub projector_concurrency: usize,
}

impl MonitorSettings {
    /// Valeurs par défaut de production pour un endpoint donné.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            max_subscriptions: 100,
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            resubscribe_pacing: Duration::from_millis(50),
            commitment: "confirmed".to_string(),
            account_encoding: "jsonParsed".to_string(),
            dedup_signatures: true,
            seen_signature_limit: 10_000,
            projector_concurrency: 64,
        }
    }

    pub fn projector_settings(&self) -> ProjectorSettings {
        ProjectorSettings {
            dedup_signatures: self.dedup_signatures,
            seen_signature_limit: self.seen_signature_limit,
            max_in_flight: self.projector_concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("le moniteur est déjà démarré")]
    AlreadyStarted,
    #[error("le moniteur a été arrêté")]
    Stopped,
}

/// Extrémités des canaux réservées à la tâche de connexion jusqu'au démarrage.
struct PendingStart {
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    status: watch::Sender<ConnectionStatus>,
}

/// Façade du moniteur : registre, connexion et projection assemblés.
///
/// Toutes les opérations de gestion sont synchrones et utilisables depuis
/// n'importe quel thread ; seule `join` est asynchrone.
pub struct ActivityMonitor {
    settings: MonitorSettings,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    store: Arc<dyn ActivityStore>,
    metrics: Arc<MonitorMetrics>,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    pending: Mutex<Option<PendingStart>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivityMonitor {
    pub fn new(settings: MonitorSettings, store: Arc<dyn ActivityStore>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new(settings.max_subscriptions))),
            settings,
            store,
            metrics: Arc::new(MonitorMetrics::default()),
            commands: commands_tx,
            status: status_rx,
            shutdown: shutdown_tx,
            pending: Mutex::new(Some(PendingStart { commands: commands_rx, status: status_tx })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Lance la tâche de connexion et le projecteur. Doit être appelé dans un runtime Tokio.
    pub fn start(&self) -> Result<(), MonitorError> {
        if *self.shutdown.borrow() {
            return Err(MonitorError::Stopped);
        }
        let pending = self.pending.lock().take().ok_or(MonitorError::AlreadyStarted)?;

        let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_QUEUE_CAPACITY);
        let projector = Arc::new(ActivityProjector::new(
            self.store.clone(),
            self.settings.projector_settings(),
            self.metrics.clone(),
        ));
        let projector_task = tokio::spawn(projector.run(activity_rx));

        let manager = ConnectionManager::new(
            self.settings.clone(),
            self.registry.clone(),
            pending.commands,
            activity_tx,
            pending.status,
            self.shutdown.subscribe(),
            self.metrics.clone(),
        );
        let connection_task = manager.start();

        self.tasks.lock().extend([connection_task, projector_task]);
        info!(targets = self.tracked_count(), "[Monitor] Moniteur démarré.");
        Ok(())
    }

    /// Demande l'arrêt. Idempotent ; `join` attend la fin effective des tâches.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("[Monitor] Arrêt demandé.");
        }
    }

    /// Attend la fin de la connexion puis le vidage de la file du projecteur.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "[Monitor] Une tâche s'est terminée anormalement.");
            }
        }
    }

    /// Ajoute une cible au registre puis demande son abonnement si la connexion est ouverte.
    pub fn add_target(&self, kind: TargetKind, key: &str, label: Option<String>) -> Result<(), RegistryError> {
        let target = TrackedTarget::parse(kind, key, label)?;
        self.registry.lock().add(target.clone())?;
        info!(%kind, key = %target.key, "[Monitor] Cible ajoutée.");
        // Après l'arrêt, la tâche de connexion n'écoute plus : la cible reste seulement au registre.
        let _ = self.commands.send(MonitorCommand::Subscribe { kind, key: target.key });
        Ok(())
    }

    pub fn remove_target(&self, kind: TargetKind, key: &str) -> Result<(), RegistryError> {
        let key = Pubkey::from_str(key).map_err(|_| RegistryError::InvalidKey { key: key.to_string() })?;
        let removal = self.registry.lock().remove(kind, &key)?;
        info!(%kind, %key, "[Monitor] Cible retirée.");

        match removal {
            Removal::Retiring { provider_id: Some(provider_id), epoch: Some(epoch) } => {
                let _ = self.commands.send(MonitorCommand::Unsubscribe { provider_id, epoch });
            }
            Removal::Retiring { .. } => {
                debug!(%key, "[Monitor] Annulation différée jusqu'à l'accusé de réception.");
            }
            Removal::Dropped => {}
        }
        Ok(())
    }

    pub fn tracked_count(&self) -> usize {
        self.registry.lock().count()
    }

    /// Abonnements retirés dont l'annulation n'est pas encore acquittée.
    pub fn retiring_count(&self) -> usize {
        self.registry.lock().retiring_count()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Récepteur pour suivre les changements d'état de la connexion.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.registry.lock().snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use registry::SubscriptionState;

    const WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const PROGRAM: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";

    fn monitor(max_subscriptions: usize) -> ActivityMonitor {
        let mut settings = MonitorSettings::new("ws://127.0.0.1:1");
        settings.max_subscriptions = max_subscriptions;
        ActivityMonitor::new(settings, Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn targets_are_tracked_before_start() {
        let monitor = monitor(10);
        monitor.add_target(TargetKind::Wallet, WALLET, Some("alpha".into())).unwrap();
        monitor.add_target(TargetKind::Program, PROGRAM, None).unwrap();

        assert_eq!(monitor.tracked_count(), 2);
        assert!(!monitor.is_connected());
        assert_eq!(monitor.status(), ConnectionStatus::default());
        assert!(monitor.snapshot().iter().all(|s| s.state == SubscriptionState::Pending));
    }

    #[test]
    fn capacity_and_duplicates_are_enforced() {
        let monitor = monitor(1);
        monitor.add_target(TargetKind::Wallet, WALLET, None).unwrap();

        assert_eq!(
            monitor.add_target(TargetKind::Program, PROGRAM, None),
            Err(RegistryError::CapacityExceeded { limit: 1 })
        );
        assert!(matches!(
            monitor.add_target(TargetKind::Wallet, WALLET, None),
            Err(RegistryError::AlreadyTracked { .. }) | Err(RegistryError::CapacityExceeded { .. })
        ));
        assert_eq!(monitor.tracked_count(), 1);
    }

    #[test]
    fn removal_validates_input() {
        let monitor = monitor(10);
        assert!(matches!(
            monitor.remove_target(TargetKind::Wallet, "not-a-key"),
            Err(RegistryError::InvalidKey { .. })
        ));
        assert!(matches!(
            monitor.remove_target(TargetKind::Wallet, WALLET),
            Err(RegistryError::NotTracked { .. })
        ));

        monitor.add_target(TargetKind::Wallet, WALLET, None).unwrap();
        monitor.remove_target(TargetKind::Wallet, WALLET).unwrap();
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn start_twice_and_after_stop_is_rejected() {
        let monitor = monitor(10);
        monitor.start().unwrap();
        assert_eq!(monitor.start(), Err(MonitorError::AlreadyStarted));

        // Connexion refusée : le moniteur attend 5 s avant de réessayer.
        let mut status = monitor.watch_status();
        tokio::time::timeout(
            Duration::from_secs(3),
            status.wait_for(|s| s.state == ConnectionState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        monitor.stop();
        monitor.stop();
        tokio::time::timeout(Duration::from_secs(1), monitor.join())
            .await
            .expect("l'arrêt doit interrompre l'attente de reconnexion");
        assert!(!monitor.is_connected());
        assert_eq!(monitor.status().attempt, 1);

        let stopped = self::monitor(10);
        stopped.stop();
        assert_eq!(stopped.start(), Err(MonitorError::Stopped));
    }
}
