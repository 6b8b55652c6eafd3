// DANS : src/monitor/classifier.rs

use serde_json::Value;
use solana_sdk::pubkey::Pubkey;

use super::registry::{TargetIndex, TargetKind, TrackedTarget};
use crate::communication::{
    NOTIFICATION_ACCOUNT, NOTIFICATION_LOGS, parse_unsubscribe_correlation_id,
};

/// Un message entrant, étiqueté. Produit à neuf pour chaque frame, jamais persisté.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    SubscriptionAck {
        correlation_id: String,
        provider_id: u64,
    },
    UnsubscribeAck {
        correlation_id: String,
        provider_id: u64,
        success: bool,
    },
    /// Réponse d'erreur JSON-RPC à l'une de nos requêtes.
    RequestRejected {
        correlation_id: String,
        code: Option<i64>,
        message: String,
    },
    AccountActivity {
        target: TrackedTarget,
        provider_id: Option<u64>,
        slot: Option<u64>,
        raw_payload: Value,
    },
    ProgramActivity {
        program_key: Option<Pubkey>,
        matched_target: Option<TrackedTarget>,
        match_kind: Option<MatchKind>,
        signature: String,
        raw_logs: Vec<String>,
        failed: bool,
    },
    Unparsable {
        reason: UnparsableReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Clé trouvée dans une liste structurée de comptes fournie par le fournisseur.
    AccountKeys,
    /// Clé trouvée en sous-chaîne d'une ligne de log (heuristique).
    LogSubstring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnparsableReason {
    /// Pas du JSON : typiquement les keep-alive du fournisseur.
    NotJson,
    UnrecognizedFrame,
    UnknownSubscription,
    MalformedNotification,
}

impl ClassifiedEvent {
    fn unparsable(reason: UnparsableReason) -> Self {
        Self::Unparsable { reason }
    }
}

/// Classe une frame brute. Fonction pure et totale : toute suite d'octets
/// donne exactement une variante, sans I/O.
pub fn classify(frame: &[u8], index: &TargetIndex) -> ClassifiedEvent {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(_) => return ClassifiedEvent::unparsable(UnparsableReason::NotJson),
    };

    if let Some(event) = classify_response(&value) {
        return event;
    }

    match value.get("method").and_then(Value::as_str) {
        Some(NOTIFICATION_ACCOUNT) => classify_account_notification(&value, index),
        Some(NOTIFICATION_LOGS) => classify_logs_notification(&value, index),
        _ => ClassifiedEvent::unparsable(UnparsableReason::UnrecognizedFrame),
    }
}

/// Réponses aux requêtes (accusés et erreurs), reconnues à leur `id` textuel.
fn classify_response(value: &Value) -> Option<ClassifiedEvent> {
    let correlation_id = value.get("id")?.as_str()?.to_string();

    if let Some(error) = value.get("error") {
        return Some(ClassifiedEvent::RequestRejected {
            correlation_id,
            code: error.get("code").and_then(Value::as_i64),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    match value.get("result")? {
        Value::Number(n) => n.as_u64().map(|provider_id| ClassifiedEvent::SubscriptionAck {
            correlation_id,
            provider_id,
        }),
        Value::Bool(success) => {
            let provider_id = parse_unsubscribe_correlation_id(&correlation_id)?;
            Some(ClassifiedEvent::UnsubscribeAck { correlation_id, provider_id, success: *success })
        }
        _ => None,
    }
}

fn classify_account_notification(value: &Value, index: &TargetIndex) -> ClassifiedEvent {
    let Some(params) = value.get("params") else {
        return ClassifiedEvent::unparsable(UnparsableReason::MalformedNotification);
    };
    let provider_id = params.get("subscription").and_then(Value::as_u64);
    let result = params.get("result").cloned().unwrap_or(Value::Null);
    let slot = result.pointer("/context/slot").and_then(Value::as_u64);

    // L'adresse n'est pas dans la notification : on la retrouve par l'id d'abonnement,
    // sinon par `value.pubkey` quand le fournisseur l'ajoute.
    let by_subscription = provider_id
        .and_then(|id| index.by_provider_id(id))
        .filter(|t| t.kind == TargetKind::Wallet);
    let by_pubkey = || {
        result
            .pointer("/value/pubkey")
            .and_then(Value::as_str)
            .and_then(|key| index.wallet_by_key(key))
    };

    match by_subscription.or_else(by_pubkey) {
        Some(target) => ClassifiedEvent::AccountActivity {
            target: target.clone(),
            provider_id,
            slot,
            raw_payload: result,
        },
        None => ClassifiedEvent::unparsable(UnparsableReason::UnknownSubscription),
    }
}

fn classify_logs_notification(value: &Value, index: &TargetIndex) -> ClassifiedEvent {
    let Some(params) = value.get("params") else {
        return ClassifiedEvent::unparsable(UnparsableReason::MalformedNotification);
    };
    let Some(event) = params.pointer("/result/value") else {
        return ClassifiedEvent::unparsable(UnparsableReason::MalformedNotification);
    };
    let Some(signature) = event.get("signature").and_then(Value::as_str) else {
        return ClassifiedEvent::unparsable(UnparsableReason::MalformedNotification);
    };

    let raw_logs: Vec<String> = event
        .get("logs")
        .and_then(Value::as_array)
        .map(|lines| lines.iter().filter_map(Value::as_str).map(ToString::to_string).collect())
        .unwrap_or_default();
    let failed = event.get("err").is_some_and(|err| !err.is_null());

    let program_key = params
        .get("subscription")
        .and_then(Value::as_u64)
        .and_then(|id| index.by_provider_id(id))
        .filter(|t| t.kind == TargetKind::Program)
        .map(|t| t.key);

    let matched = match event.get("accountKeys").and_then(Value::as_array) {
        Some(keys) => match_account_keys(keys, index).map(|t| (t, MatchKind::AccountKeys)),
        None => match_log_lines(&raw_logs, index).map(|t| (t, MatchKind::LogSubstring)),
    };
    let (matched_target, match_kind) = match matched {
        Some((target, kind)) => (Some(target.clone()), Some(kind)),
        None => (None, None),
    };

    ClassifiedEvent::ProgramActivity {
        program_key,
        matched_target,
        match_kind,
        signature: signature.to_string(),
        raw_logs,
        failed,
    }
}

/// Correspondance exacte contre une liste structurée de participants.
fn match_account_keys<'a>(keys: &[Value], index: &'a TargetIndex) -> Option<&'a TrackedTarget> {
    keys.iter()
        .filter_map(|k| k.as_str().or_else(|| k.get("pubkey").and_then(Value::as_str)))
        .find_map(|key| index.wallet_by_key(key))
}

/// Heuristique de repli : l'adresse apparaît-elle dans le texte d'une ligne de log ?
/// Limite connue : faux positifs sur des sous-chaînes fortuites, faux négatifs pour
/// un portefeuille qui agit sans laisser son adresse dans les logs.
fn match_log_lines<'a>(logs: &[String], index: &'a TargetIndex) -> Option<&'a TrackedTarget> {
    index
        .wallets()
        .find(|(key, _)| logs.iter().any(|line| line.contains(*key)))
        .map(|(_, target)| target)
}
