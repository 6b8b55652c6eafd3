// DANS : src/bin/activity_monitor.rs

use activity_monitor::{
    config::Config,
    monitor::{ActivityMonitor, registry::TargetKind},
    store::{ActivityStore, InMemoryStore, JsonFileStore},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

async fn open_store(config: &Config) -> Result<Arc<dyn ActivityStore>> {
    match &config.activity_store_path {
        Some(path) => {
            let store = JsonFileStore::open(path).await?;
            info!("[Main] Persistance des activités dans {}.", path);
            Ok(Arc::new(store))
        }
        None => {
            warn!("[Main] ACTIVITY_STORE_PATH non défini : les activités restent en mémoire.");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Enregistre les cibles de la configuration. Une adresse invalide est ignorée, pas fatale.
fn seed_targets(monitor: &ActivityMonitor, config: &Config) {
    let targets = config
        .watched_programs
        .iter()
        .map(|key| (TargetKind::Program, key))
        .chain(config.tracked_wallets.iter().map(|key| (TargetKind::Wallet, key)));

    for (kind, key) in targets {
        if let Err(e) = monitor.add_target(kind, key.trim(), None) {
            warn!("[Main] Cible {} '{}' ignorée : {}", kind, key, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    activity_monitor::monitoring::logging::setup_logging();
    info!("[Main] Démarrage du moniteur d'activité on-chain.");

    let config = Config::load()?;
    let store = open_store(&config).await?;

    let monitor = ActivityMonitor::new(config.monitor_settings(), store);
    seed_targets(&monitor, &config);
    info!(
        "[Main] {} cibles suivies ({} programmes, {} portefeuilles configurés).",
        monitor.tracked_count(),
        config.watched_programs.len(),
        config.tracked_wallets.len()
    );

    monitor.start()?;

    tokio::signal::ctrl_c().await?;
    info!("[Main] Signal d'arrêt reçu.");
    monitor.stop();
    monitor.join().await;

    let metrics = monitor.metrics();
    info!(
        frames = metrics.frames_received,
        projected = metrics.events_projected,
        store_errors = metrics.store_errors,
        "[Main] Moniteur arrêté proprement."
    );
    Ok(())
}
