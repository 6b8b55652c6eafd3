// DANS : src/monitoring/metrics.rs

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Compteurs du moniteur. Une instance par moniteur (pas de registre global),
/// partagée entre la tâche de connexion et le projecteur.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    // --- Flux entrant ---
    frames_received: AtomicU64,
    frames_unparsable: AtomicU64,
    subscription_acks: AtomicU64,
    requests_rejected: AtomicU64,

    // --- Connexion ---
    connections_opened: AtomicU64,
    reconnect_attempts: AtomicU64,
    subscribe_requests_sent: AtomicU64,

    // --- Projection ---
    events_projected: AtomicU64,
    duplicates_skipped: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_unparsable: u64,
    pub subscription_acks: u64,
    pub requests_rejected: u64,
    pub connections_opened: u64,
    pub reconnect_attempts: u64,
    pub subscribe_requests_sent: u64,
    pub events_projected: u64,
    pub duplicates_skipped: u64,
    pub store_errors: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MonitorMetrics {
    pub fn frame_received(&self) { bump(&self.frames_received) }
    pub fn frame_unparsable(&self) { bump(&self.frames_unparsable) }
    pub fn subscription_acked(&self) { bump(&self.subscription_acks) }
    pub fn request_rejected(&self) { bump(&self.requests_rejected) }
    pub fn connection_opened(&self) { bump(&self.connections_opened) }
    pub fn reconnect_attempted(&self) { bump(&self.reconnect_attempts) }
    pub fn subscribe_request_sent(&self) { bump(&self.subscribe_requests_sent) }
    pub fn event_projected(&self) { bump(&self.events_projected) }
    pub fn duplicate_skipped(&self) { bump(&self.duplicates_skipped) }
    pub fn store_error(&self) { bump(&self.store_errors) }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_received: load(&self.frames_received),
            frames_unparsable: load(&self.frames_unparsable),
            subscription_acks: load(&self.subscription_acks),
            requests_rejected: load(&self.requests_rejected),
            connections_opened: load(&self.connections_opened),
            reconnect_attempts: load(&self.reconnect_attempts),
            subscribe_requests_sent: load(&self.subscribe_requests_sent),
            events_projected: load(&self.events_projected),
            duplicates_skipped: load(&self.duplicates_skipped),
            store_errors: load(&self.store_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = MonitorMetrics::default();
        metrics.frame_received();
        metrics.frame_received();
        metrics.store_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.store_errors, 1);
        assert_eq!(snapshot.events_projected, 0);
    }
}
