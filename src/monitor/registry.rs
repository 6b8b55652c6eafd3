// DANS : src/monitor/registry.rs

use arc_swap::ArcSwap;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

use crate::communication::parse_correlation_id;

/// Nature d'une cible surveillée.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Portefeuille suivi via `accountSubscribe`.
    Wallet,
    /// Programme suivi via `logsSubscribe { mentions }`.
    Program,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Program => "program",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "wallet" => Some(Self::Wallet),
            "program" => Some(Self::Program),
            _ => None,
        }
    }

    /// Les abonnements "logs mentions" ne s'annulent pas côté fournisseur :
    /// pour un programme, un retrait revient à ne plus se réabonner.
    pub fn supports_unsubscribe(self) -> bool {
        matches!(self, Self::Wallet)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTarget {
    pub key: Pubkey,
    pub kind: TargetKind,
    pub label: Option<String>,
}

impl TrackedTarget {
    /// Valide l'adresse (base58, 32 octets) avant de construire la cible.
    pub fn parse(kind: TargetKind, key: &str, label: Option<String>) -> Result<Self, RegistryError> {
        let key = Pubkey::from_str(key.trim())
            .map_err(|_| RegistryError::InvalidKey { key: key.to_string() })?;
        Ok(Self { key, kind, label })
    }

    pub fn wallet(key: Pubkey) -> Self {
        Self { key, kind: TargetKind::Wallet, label: None }
    }

    pub fn program(key: Pubkey) -> Self {
        Self { key, kind: TargetKind::Program, label: None }
    }

    fn id(&self) -> TargetId {
        (self.kind, self.key)
    }
}

type TargetId = (TargetKind, Pubkey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Confirmed,
    Retiring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub target: TrackedTarget,
    pub provider_id: Option<u64>,
    pub state: SubscriptionState,
    /// Époque de connexion sur laquelle la requête d'abonnement a été envoyée.
    #[serde(skip)]
    requested_in: Option<u64>,
}

impl Subscription {
    fn pending(target: TrackedTarget) -> Self {
        Self { target, provider_id: None, state: SubscriptionState::Pending, requested_in: None }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capacité atteinte : {limit} abonnements maximum")]
    CapacityExceeded { limit: usize },

    #[error("{kind} {key} est déjà suivi")]
    AlreadyTracked { kind: TargetKind, key: Pubkey },

    #[error("{kind} {key} n'est pas suivi")]
    NotTracked { kind: TargetKind, key: Pubkey },

    #[error("aucun abonnement en attente pour la corrélation '{0}'")]
    NotFound(String),

    #[error("adresse invalide : '{key}'")]
    InvalidKey { key: String },
}

/// Résultat d'un retrait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// La cible est oubliée immédiatement (programme, ou abonnement jamais envoyé).
    Dropped,
    /// L'abonnement est en cours d'annulation côté fournisseur.
    /// `provider_id` vaut `None` tant que l'accusé de réception n'est pas arrivé.
    Retiring { provider_id: Option<u64>, epoch: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(TrackedTarget),
    /// L'accusé concerne une cible retirée entre-temps : il faut l'annuler.
    Retire { target: TrackedTarget, provider_id: u64 },
}

/// Vue en lecture seule publiée après chaque mutation, consommée par le classifieur.
#[derive(Debug, Default)]
pub struct TargetIndex {
    wallets: Vec<(String, TrackedTarget)>,
    by_provider_id: HashMap<u64, TrackedTarget>,
}

impl TargetIndex {
    pub fn new(
        wallets: impl IntoIterator<Item = TrackedTarget>,
        confirmed: impl IntoIterator<Item = (u64, TrackedTarget)>,
    ) -> Self {
        Self {
            wallets: wallets.into_iter().map(|t| (t.key.to_string(), t)).collect(),
            by_provider_id: confirmed.into_iter().collect(),
        }
    }

    /// Portefeuilles suivis, avec leur adresse déjà encodée en base58.
    pub fn wallets(&self) -> impl Iterator<Item = (&str, &TrackedTarget)> {
        self.wallets.iter().map(|(key, target)| (key.as_str(), target))
    }

    pub fn wallet_by_key(&self, key: &str) -> Option<&TrackedTarget> {
        self.wallets.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    pub fn by_provider_id(&self, provider_id: u64) -> Option<&TrackedTarget> {
        self.by_provider_id.get(&provider_id)
    }
}

/// Registre des cibles suivies et de l'état de leurs abonnements.
///
/// Le registre ne fait aucune I/O : il dit au `ConnectionManager` quoi envoyer.
/// Il n'est pas thread-safe en lui-même ; le moniteur le place derrière un mutex.
pub struct SubscriptionRegistry {
    capacity: usize,
    tracked: BTreeMap<TargetId, Subscription>,
    retiring: Vec<Subscription>,
    index: Arc<ArcSwap<TargetIndex>>,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tracked: BTreeMap::new(),
            retiring: Vec::new(),
            index: Arc::new(ArcSwap::from_pointee(TargetIndex::default())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Poignée partagée vers l'index publié ; reste valide pour toute la vie du registre.
    pub fn index_handle(&self) -> Arc<ArcSwap<TargetIndex>> {
        self.index.clone()
    }

    pub fn add(&mut self, target: TrackedTarget) -> Result<(), RegistryError> {
        if self.tracked.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded { limit: self.capacity });
        }
        let id = target.id();
        if self.tracked.contains_key(&id) {
            return Err(RegistryError::AlreadyTracked { kind: id.0, key: id.1 });
        }
        self.tracked.insert(id, Subscription::pending(target));
        self.publish();
        Ok(())
    }

    pub fn remove(&mut self, kind: TargetKind, key: &Pubkey) -> Result<Removal, RegistryError> {
        let mut subscription = self
            .tracked
            .remove(&(kind, *key))
            .ok_or(RegistryError::NotTracked { kind, key: *key })?;
        self.publish();

        // Rien n'a encore été demandé au fournisseur, ou il ne sait pas annuler.
        if !kind.supports_unsubscribe() || subscription.requested_in.is_none() {
            return Ok(Removal::Dropped);
        }

        subscription.state = SubscriptionState::Retiring;
        let removal = Removal::Retiring {
            provider_id: subscription.provider_id,
            epoch: subscription.requested_in,
        };
        self.retiring.push(subscription);
        Ok(removal)
    }

    pub fn confirm_subscription(
        &mut self,
        correlation_id: &str,
        provider_id: u64,
    ) -> Result<Confirmation, RegistryError> {
        let not_found = || RegistryError::NotFound(correlation_id.to_string());
        let id = parse_correlation_id(correlation_id).ok_or_else(not_found)?;

        // Une entrée en retrait sans id a été demandée avant toute ré-insertion de la
        // même cible : les accusés arrivant dans l'ordre des requêtes, elle passe d'abord.
        if let Some(retiring) = self
            .retiring
            .iter_mut()
            .find(|s| s.target.id() == id && s.provider_id.is_none())
        {
            retiring.provider_id = Some(provider_id);
            return Ok(Confirmation::Retire { target: retiring.target.clone(), provider_id });
        }

        let subscription = self
            .tracked
            .get_mut(&id)
            .filter(|s| s.state == SubscriptionState::Pending && s.requested_in.is_some())
            .ok_or_else(not_found)?;
        subscription.state = SubscriptionState::Confirmed;
        subscription.provider_id = Some(provider_id);
        let target = subscription.target.clone();
        self.publish();
        Ok(Confirmation::Confirmed(target))
    }

    /// Oublie définitivement une cible dont l'annulation a été acquittée.
    pub fn complete_retirement(&mut self, provider_id: u64) -> Option<TrackedTarget> {
        let position = self.retiring.iter().position(|s| s.provider_id == Some(provider_id))?;
        Some(self.retiring.swap_remove(position).target)
    }

    /// Instantané ordonné, sans effet de bord.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.tracked.values().cloned().collect()
    }

    /// Instantané + remise à zéro pour une nouvelle connexion : les identifiants
    /// fournisseur ne survivent pas à la socket, tout repasse en `Pending`.
    pub fn resubscribe_all(&mut self, epoch: u64) -> Vec<TrackedTarget> {
        self.retiring.clear();
        let targets = self
            .tracked
            .values_mut()
            .map(|subscription| {
                subscription.state = SubscriptionState::Pending;
                subscription.provider_id = None;
                subscription.requested_in = Some(epoch);
                subscription.target.clone()
            })
            .collect();
        self.publish();
        targets
    }

    /// Réserve l'envoi d'un abonnement sur la connexion `epoch`.
    /// Retourne `None` si la cible n'est plus suivie ou a déjà été demandée sur
    /// cette connexion (par exemple via `resubscribe_all`).
    pub fn claim_request(&mut self, kind: TargetKind, key: &Pubkey, epoch: u64) -> Option<TrackedTarget> {
        let subscription = self.tracked.get_mut(&(kind, *key))?;
        if subscription.requested_in == Some(epoch) {
            return None;
        }
        subscription.requested_in = Some(epoch);
        subscription.state = SubscriptionState::Pending;
        subscription.provider_id = None;
        Some(subscription.target.clone())
    }

    pub fn lookup(&self, key: &Pubkey) -> Option<&TrackedTarget> {
        self.tracked.values().map(|s| &s.target).find(|t| &t.key == key)
    }

    pub fn subscription(&self, kind: TargetKind, key: &Pubkey) -> Option<&Subscription> {
        self.tracked.get(&(kind, *key))
    }

    pub fn count(&self) -> usize {
        self.tracked.len()
    }

    pub fn retiring_count(&self) -> usize {
        self.retiring.len()
    }

    fn publish(&self) {
        let wallets = self
            .tracked
            .values()
            .filter(|s| s.target.kind == TargetKind::Wallet)
            .map(|s| s.target.clone());
        let confirmed = self
            .tracked
            .values()
            .filter_map(|s| s.provider_id.map(|id| (id, s.target.clone())));
        self.index.store(Arc::new(TargetIndex::new(wallets, confirmed)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::correlation_id;

    fn wallet() -> TrackedTarget {
        TrackedTarget::wallet(Pubkey::new_unique())
    }

    #[test]
    fn capacity_scenario_remove_then_add() {
        let mut registry = SubscriptionRegistry::new(2);
        let (a, b, c) = (wallet(), wallet(), wallet());
        registry.add(a.clone()).unwrap();
        registry.add(b.clone()).unwrap();

        assert_eq!(
            registry.add(c.clone()),
            Err(RegistryError::CapacityExceeded { limit: 2 })
        );
        assert_eq!(registry.count(), 2);

        registry.remove(TargetKind::Wallet, &a.key).unwrap();
        registry.add(c.clone()).unwrap();

        let keys: Vec<Pubkey> = registry.snapshot().into_iter().map(|s| s.target.key).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&b.key));
        assert!(keys.contains(&c.key));
        assert!(!keys.contains(&a.key));
    }

    #[test]
    fn count_tracks_net_adds() {
        let mut registry = SubscriptionRegistry::new(10);
        let mut live = Vec::new();
        for step in 0..40 {
            if step % 3 == 2 && !live.is_empty() {
                let target: TrackedTarget = live.remove(0);
                registry.remove(target.kind, &target.key).unwrap();
            } else if live.len() < 10 {
                let target = wallet();
                registry.add(target.clone()).unwrap();
                live.push(target);
            }
            assert_eq!(registry.count(), live.len());
        }
    }

    #[test]
    fn rejected_add_leaves_set_unchanged() {
        let mut registry = SubscriptionRegistry::new(1);
        let first = wallet();
        registry.add(first.clone()).unwrap();
        let before = registry.snapshot();

        assert!(matches!(registry.add(wallet()), Err(RegistryError::CapacityExceeded { .. })));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn duplicates_and_unknown_targets_are_caller_errors() {
        let mut registry = SubscriptionRegistry::new(5);
        let target = wallet();
        registry.add(target.clone()).unwrap();
        assert!(matches!(registry.add(target.clone()), Err(RegistryError::AlreadyTracked { .. })));

        // Même clé, autre nature : cible distincte.
        registry.add(TrackedTarget::program(target.key)).unwrap();
        assert_eq!(registry.count(), 2);

        let stranger = Pubkey::new_unique();
        assert_eq!(
            registry.remove(TargetKind::Wallet, &stranger),
            Err(RegistryError::NotTracked { kind: TargetKind::Wallet, key: stranger })
        );
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let err = TrackedTarget::parse(TargetKind::Wallet, "not-base58!", None).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKey { .. }));
        assert!(TrackedTarget::parse(TargetKind::Program, "11111111111111111111111111111111", None).is_ok());
    }

    #[test]
    fn ack_confirms_pending_subscription() {
        let mut registry = SubscriptionRegistry::new(5);
        let target = wallet();
        registry.add(target.clone()).unwrap();
        registry.resubscribe_all(1);

        let id = format!("wallet-{}", target.key);
        assert_eq!(
            registry.confirm_subscription(&id, 42),
            Ok(Confirmation::Confirmed(target.clone()))
        );
        let subscription = registry.subscription(TargetKind::Wallet, &target.key).unwrap();
        assert_eq!(subscription.state, SubscriptionState::Confirmed);
        assert_eq!(subscription.provider_id, Some(42));

        let index = registry.index_handle().load_full();
        assert_eq!(index.by_provider_id(42), Some(&target));

        // Un second accusé pour la même cible ne correspond plus à rien.
        assert!(matches!(registry.confirm_subscription(&id, 43), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.confirm_subscription("garbage", 1), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn resubscribe_all_resets_provider_ids() {
        let mut registry = SubscriptionRegistry::new(5);
        let targets = [wallet(), wallet(), TrackedTarget::program(Pubkey::new_unique())];
        for t in &targets {
            registry.add(t.clone()).unwrap();
        }
        registry.resubscribe_all(1);
        for (i, t) in targets.iter().enumerate() {
            registry.confirm_subscription(&correlation_id(t.kind, &t.key), i as u64).unwrap();
        }

        let again = registry.resubscribe_all(2);
        assert_eq!(again.len(), targets.len());
        for t in &targets {
            assert_eq!(again.iter().filter(|x| *x == t).count(), 1);
        }
        assert!(registry.snapshot().iter().all(|s| {
            s.state == SubscriptionState::Pending && s.provider_id.is_none()
        }));
        assert!(registry.index_handle().load().by_provider_id(0).is_none());
    }

    #[test]
    fn snapshot_has_no_side_effects() {
        let mut registry = SubscriptionRegistry::new(5);
        let target = wallet();
        registry.add(target.clone()).unwrap();
        registry.resubscribe_all(1);
        registry.confirm_subscription(&correlation_id(TargetKind::Wallet, &target.key), 7).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].state, SubscriptionState::Confirmed);
        assert_eq!(
            registry.subscription(TargetKind::Wallet, &target.key).unwrap().provider_id,
            Some(7)
        );
    }

    #[test]
    fn claim_request_prevents_double_subscribe_within_an_epoch() {
        let mut registry = SubscriptionRegistry::new(5);
        let early = wallet();
        registry.add(early.clone()).unwrap();

        // Ajout arrivé avant la reconnexion : déjà couvert par resubscribe_all.
        registry.resubscribe_all(3);
        assert_eq!(registry.claim_request(TargetKind::Wallet, &early.key, 3), None);

        // Ajout arrivé après : il faut l'envoyer, une seule fois.
        let late = wallet();
        registry.add(late.clone()).unwrap();
        assert_eq!(registry.claim_request(TargetKind::Wallet, &late.key, 3), Some(late.clone()));
        assert_eq!(registry.claim_request(TargetKind::Wallet, &late.key, 3), None);

        // Cible retirée avant le traitement de la commande.
        assert_eq!(registry.claim_request(TargetKind::Wallet, &Pubkey::new_unique(), 3), None);
    }

    #[test]
    fn wallet_removal_retires_and_program_removal_drops() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        let p = TrackedTarget::program(Pubkey::new_unique());
        registry.add(w.clone()).unwrap();
        registry.add(p.clone()).unwrap();
        registry.resubscribe_all(1);
        registry.confirm_subscription(&correlation_id(w.kind, &w.key), 11).unwrap();
        registry.confirm_subscription(&correlation_id(p.kind, &p.key), 12).unwrap();

        assert_eq!(registry.remove(TargetKind::Program, &p.key), Ok(Removal::Dropped));
        assert_eq!(
            registry.remove(TargetKind::Wallet, &w.key),
            Ok(Removal::Retiring { provider_id: Some(11), epoch: Some(1) })
        );
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.retiring_count(), 1);
        assert!(registry.index_handle().load().by_provider_id(11).is_none());

        assert_eq!(registry.complete_retirement(11), Some(w));
        assert_eq!(registry.retiring_count(), 0);
        assert_eq!(registry.complete_retirement(11), None);
    }

    #[test]
    fn removing_before_ack_retires_when_ack_arrives() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        registry.add(w.clone()).unwrap();
        registry.resubscribe_all(1);

        assert_eq!(
            registry.remove(TargetKind::Wallet, &w.key),
            Ok(Removal::Retiring { provider_id: None, epoch: Some(1) })
        );
        assert_eq!(
            registry.confirm_subscription(&correlation_id(w.kind, &w.key), 99),
            Ok(Confirmation::Retire { target: w.clone(), provider_id: 99 })
        );
        assert_eq!(registry.complete_retirement(99), Some(w));
    }

    #[test]
    fn readding_before_ack_retires_the_first_subscription() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        let id = correlation_id(w.kind, &w.key);
        registry.add(w.clone()).unwrap();
        registry.resubscribe_all(1);
        registry.remove(TargetKind::Wallet, &w.key).unwrap();
        registry.add(w.clone()).unwrap();

        // Le premier accusé arrive avant que la nouvelle requête soit partie.
        assert_eq!(
            registry.confirm_subscription(&id, 1),
            Ok(Confirmation::Retire { target: w.clone(), provider_id: 1 })
        );
        assert_eq!(registry.claim_request(TargetKind::Wallet, &w.key, 1), Some(w.clone()));
        assert_eq!(registry.confirm_subscription(&id, 2), Ok(Confirmation::Confirmed(w.clone())));
        assert_eq!(registry.subscription(TargetKind::Wallet, &w.key).unwrap().provider_id, Some(2));
        assert_eq!(registry.complete_retirement(1), Some(w.clone()));
        assert_eq!(registry.retiring_count(), 0);
    }

    #[test]
    fn readding_after_new_request_still_retires_the_oldest() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        let id = correlation_id(w.kind, &w.key);
        registry.add(w.clone()).unwrap();
        registry.resubscribe_all(1);
        registry.remove(TargetKind::Wallet, &w.key).unwrap();
        registry.add(w.clone()).unwrap();
        registry.claim_request(TargetKind::Wallet, &w.key, 1).unwrap();

        assert_eq!(
            registry.confirm_subscription(&id, 1),
            Ok(Confirmation::Retire { target: w.clone(), provider_id: 1 })
        );
        assert_eq!(registry.confirm_subscription(&id, 2), Ok(Confirmation::Confirmed(w.clone())));
        assert!(registry.index_handle().load().by_provider_id(1).is_none());
        assert_eq!(registry.index_handle().load().by_provider_id(2), Some(&w));
    }

    #[test]
    fn ack_for_an_unrequested_entry_is_ignored() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        registry.add(w.clone()).unwrap();
        assert!(matches!(
            registry.confirm_subscription(&correlation_id(w.kind, &w.key), 5),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.subscription(TargetKind::Wallet, &w.key).unwrap().state, SubscriptionState::Pending);
    }

    #[test]
    fn removing_a_never_requested_wallet_drops_it() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        registry.add(w.clone()).unwrap();
        assert_eq!(registry.remove(TargetKind::Wallet, &w.key), Ok(Removal::Dropped));
        assert_eq!(registry.retiring_count(), 0);
    }

    #[test]
    fn reconnect_forgets_retiring_entries() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        registry.add(w.clone()).unwrap();
        registry.resubscribe_all(1);
        registry.remove(TargetKind::Wallet, &w.key).unwrap();
        assert_eq!(registry.retiring_count(), 1);

        assert!(registry.resubscribe_all(2).is_empty());
        assert_eq!(registry.retiring_count(), 0);
    }

    #[test]
    fn index_lists_wallets_only() {
        let mut registry = SubscriptionRegistry::new(5);
        let w = wallet();
        registry.add(w.clone()).unwrap();
        registry.add(TrackedTarget::program(Pubkey::new_unique())).unwrap();

        let index = registry.index_handle().load_full();
        let wallets: Vec<&TrackedTarget> = index.wallets().map(|(_, t)| t).collect();
        assert_eq!(wallets, vec![&w]);
        assert_eq!(index.wallet_by_key(&w.key.to_string()), Some(&w));
        assert_eq!(registry.lookup(&w.key), Some(&w));
    }
}
