// DANS : src/communication.rs

use serde::Serialize;
use serde_json::{Value, json};
use solana_sdk::pubkey::Pubkey;

use crate::monitor::registry::TargetKind;

// --- CONSTANTES DU PROTOCOLE JSON-RPC ---
pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_ACCOUNT_SUBSCRIBE: &str = "accountSubscribe";
pub const METHOD_ACCOUNT_UNSUBSCRIBE: &str = "accountUnsubscribe";
pub const METHOD_LOGS_SUBSCRIBE: &str = "logsSubscribe";

pub const NOTIFICATION_ACCOUNT: &str = "accountNotification";
pub const NOTIFICATION_LOGS: &str = "logsNotification";

const UNSUBSCRIBE_PREFIX: &str = "unsubscribe-";

// --- REQUÊTES SORTANTES ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn account_subscribe(address: &Pubkey, commitment: &str, encoding: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: correlation_id(TargetKind::Wallet, address),
            method: METHOD_ACCOUNT_SUBSCRIBE,
            params: json!([
                address.to_string(),
                { "commitment": commitment, "encoding": encoding }
            ]),
        }
    }

    pub fn account_unsubscribe(provider_id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: unsubscribe_correlation_id(provider_id),
            method: METHOD_ACCOUNT_UNSUBSCRIBE,
            params: json!([provider_id]),
        }
    }

    pub fn logs_subscribe(program: &Pubkey, commitment: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: correlation_id(TargetKind::Program, program),
            method: METHOD_LOGS_SUBSCRIBE,
            params: json!([
                { "mentions": [program.to_string()] },
                { "commitment": commitment }
            ]),
        }
    }

    pub fn to_text(&self) -> String {
        // La sérialisation d'une struct avec des champs String/Value ne peut pas échouer.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// --- IDENTIFIANTS DE CORRÉLATION ---
// Format : "wallet-<clé>", "program-<clé>", "unsubscribe-<id fournisseur>".

pub fn correlation_id(kind: TargetKind, key: &Pubkey) -> String {
    format!("{}-{}", kind.as_str(), key)
}

pub fn unsubscribe_correlation_id(provider_id: u64) -> String {
    format!("{UNSUBSCRIBE_PREFIX}{provider_id}")
}

/// Retrouve `(kind, clé)` à partir d'un identifiant de corrélation d'abonnement.
pub fn parse_correlation_id(id: &str) -> Option<(TargetKind, Pubkey)> {
    let (prefix, key) = id.split_once('-')?;
    let kind = TargetKind::from_prefix(prefix)?;
    let key = key.parse().ok()?;
    Some((kind, key))
}

pub fn parse_unsubscribe_correlation_id(id: &str) -> Option<u64> {
    id.strip_prefix(UNSUBSCRIBE_PREFIX)?.parse().ok()
}
