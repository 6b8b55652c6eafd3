// DANS : src/config.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::monitor::MonitorSettings;

/// Configuration du service, lue depuis l'environnement (et un éventuel `.env`).
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub solana_ws_url: String,
    #[serde(default)]
    pub provider_api_key: Option<String>,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_resubscribe_pacing_ms")]
    pub resubscribe_pacing_ms: u64,

    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_account_encoding")]
    pub account_encoding: String,

    // Listes séparées par des virgules (ex: WATCHED_PROGRAMS=prog1,prog2).
    #[serde(default)]
    pub watched_programs: Vec<String>,
    #[serde(default)]
    pub tracked_wallets: Vec<String>,

    #[serde(default = "default_dedup_signatures")]
    pub dedup_signatures: bool,
    #[serde(default = "default_seen_signature_limit")]
    pub seen_signature_limit: usize,
    #[serde(default = "default_projector_concurrency")]
    pub projector_concurrency: usize,

    /// Si défini, les agents et activités sont persistés dans ce fichier JSON.
    #[serde(default)]
    pub activity_store_path: Option<String>,
}

fn default_max_subscriptions() -> usize { 100 }
fn default_reconnect_base_delay_ms() -> u64 { 5_000 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_write_timeout_ms() -> u64 { 5_000 }
fn default_resubscribe_pacing_ms() -> u64 { 50 }
fn default_commitment() -> String { "confirmed".to_string() }
fn default_account_encoding() -> String { "jsonParsed".to_string() }
fn default_dedup_signatures() -> bool { true }
fn default_seen_signature_limit() -> usize { 10_000 }
fn default_projector_concurrency() -> usize { 64 }

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()
            .context("Configuration invalide ou incomplète (SOLANA_WS_URL est obligatoire)")?;
        Ok(config)
    }

    /// URL de connexion finale. La clé d'API voyage en paramètre de requête,
    /// et la même URL est réutilisée à chaque reconnexion.
    pub fn ws_endpoint(&self) -> String {
        match self.provider_api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let separator = if self.solana_ws_url.contains('?') { '&' } else { '?' };
                format!("{}{}api-key={}", self.solana_ws_url, separator, key)
            }
            None => self.solana_ws_url.clone(),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            ws_url: self.ws_endpoint(),
            max_subscriptions: self.max_subscriptions,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            resubscribe_pacing: Duration::from_millis(self.resubscribe_pacing_ms),
            commitment: self.commitment.clone(),
            account_encoding: self.account_encoding.clone(),
            dedup_signatures: self.dedup_signatures,
            seen_signature_limit: self.seen_signature_limit,
            projector_concurrency: self.projector_concurrency,
        }
    }
}
