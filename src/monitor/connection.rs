// DANS : src/monitor/connection.rs

use arc_swap::ArcSwap;
use futures_util::{
    SinkExt, StreamExt,
    stream::SplitSink,
};
use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, trace, warn};

use super::classifier::{ClassifiedEvent, classify};
use super::projector::ActivityObservation;
use super::registry::{Confirmation, SubscriptionRegistry, TargetIndex, TargetKind, TrackedTarget};
use super::MonitorSettings;
use crate::communication::JsonRpcRequest;
use crate::monitoring::metrics::MonitorMetrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Tentatives de reconnexion depuis la dernière connexion réussie.
    pub attempt: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self { state: ConnectionState::Disconnected, attempt: 0 }
    }
}

// --- PROTOCOLE POUR LES COMMANDES ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Une cible vient d'être ajoutée au registre.
    Subscribe { kind: TargetKind, key: Pubkey },
    /// Annulation d'un abonnement confirmé sur la connexion `epoch`.
    Unsubscribe { provider_id: u64, epoch: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("échec de connexion : {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("connexion non établie après {0:?}")]
    ConnectTimeout(Duration),

    #[error("échec d'écriture : {0}")]
    Write(#[source] tungstenite::Error),

    #[error("écriture bloquée plus de {0:?}")]
    WriteTimeout(Duration),

    #[error("erreur du flux : {0}")]
    Stream(#[source] tungstenite::Error),

    #[error("fermée par le fournisseur ({0:?})")]
    Closed(Option<String>),

    #[error("flux terminé")]
    Ended,
}

enum SessionEnd {
    Stopped,
    Lost(ConnectionError),
}

/// Backoff linéaire plafonné : `min(base * attempt, max)`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(attempt).min(max)
}

/// Attend la demande d'arrêt (ou la disparition de l'émetteur).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Propriétaire unique de la socket : connexion, abonnements, lecture, reconnexion.
pub struct ConnectionManager {
    settings: MonitorSettings,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    index: Arc<ArcSwap<TargetIndex>>,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    activity: mpsc::Sender<ActivityObservation>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<MonitorMetrics>,
    /// Incrémentée à chaque connexion réussie ; les ids fournisseur n'ont de sens que dans une époque.
    epoch: u64,
    attempt: u32,
}

impl ConnectionManager {
    pub fn new(
        settings: MonitorSettings,
        registry: Arc<Mutex<SubscriptionRegistry>>,
        commands: mpsc::UnboundedReceiver<MonitorCommand>,
        activity: mpsc::Sender<ActivityObservation>,
        status: watch::Sender<ConnectionStatus>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        let index = registry.lock().index_handle();
        Self {
            settings,
            registry,
            index,
            commands,
            activity,
            status,
            shutdown,
            metrics,
            epoch: 0,
            attempt: 0,
        }
    }

    /// Démarre la boucle principale dans une nouvelle tâche Tokio.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(url = %redact(&self.settings.ws_url), "[Monitor] Démarrage de la boucle de connexion.");

        while !self.stopping() {
            self.set_status(ConnectionState::Connecting);

            let end = match self.connect().await {
                Ok(Some(ws)) => {
                    self.attempt = 0;
                    self.set_status(ConnectionState::Connected);
                    self.metrics.connection_opened();
                    info!("[Monitor] Connexion WebSocket établie.");
                    self.session(ws).await
                }
                Ok(None) => SessionEnd::Stopped,
                Err(e) => SessionEnd::Lost(e),
            };

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(e) => warn!(error = %e, "[Monitor] Connexion perdue."),
            }

            self.set_status(ConnectionState::Disconnected);
            if !self.wait_before_reconnect().await {
                break;
            }
        }

        self.set_status(ConnectionState::Disconnected);
        info!("[Monitor] Boucle de connexion arrêtée.");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_status(&self, state: ConnectionState) {
        self.status.send_replace(ConnectionStatus { state, attempt: self.attempt });
    }

    /// `Ok(None)` si l'arrêt est demandé pendant la connexion.
    async fn connect(&mut self) -> Result<Option<WsStream>, ConnectionError> {
        let limit = self.settings.connect_timeout;
        let attempt = timeout(limit, connect_async(self.settings.ws_url.as_str()));
        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => Ok(None),
            result = attempt => match result {
                Ok(Ok((ws, _response))) => Ok(Some(ws)),
                Ok(Err(e)) => Err(ConnectionError::Connect(e)),
                Err(_) => Err(ConnectionError::ConnectTimeout(limit)),
            },
        }
    }

    /// Retourne `false` si l'arrêt a été demandé pendant l'attente.
    async fn wait_before_reconnect(&mut self) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.metrics.reconnect_attempted();
        let delay = reconnect_delay(
            self.attempt,
            self.settings.reconnect_base_delay,
            self.settings.reconnect_max_delay,
        );
        self.set_status(ConnectionState::Reconnecting);
        info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "[Monitor] Reconnexion programmée.");

        tokio::select! {
            _ = sleep(delay) => true,
            _ = wait_for_shutdown(&mut self.shutdown) => false,
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        self.epoch += 1;

        if let Err(e) = self.resubscribe(&mut sink).await {
            return SessionEnd::Lost(e);
        }

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    let _ = timeout(self.settings.write_timeout, sink.send(Message::Close(None))).await;
                    return SessionEnd::Stopped;
                }
                frame = stream.next() => {
                    let result = match frame {
                        Some(Ok(message)) => self.on_message(message, &mut sink).await,
                        Some(Err(e)) => Err(ConnectionError::Stream(e)),
                        None => Err(ConnectionError::Ended),
                    };
                    if let Err(e) = result {
                        return SessionEnd::Lost(e);
                    }
                }
                Some(command) = self.commands.recv() => {
                    if let Err(e) = self.on_command(command, &mut sink).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Un abonnement par cible suivie, espacés pour ne pas envoyer de rafale.
    async fn resubscribe(&self, sink: &mut WsSink) -> Result<(), ConnectionError> {
        let targets = self.registry.lock().resubscribe_all(self.epoch);
        info!(targets = targets.len(), epoch = self.epoch, "[Monitor] Réabonnement de toutes les cibles.");

        for (i, target) in targets.iter().enumerate() {
            if self.stopping() {
                break;
            }
            if i > 0 && !self.settings.resubscribe_pacing.is_zero() {
                sleep(self.settings.resubscribe_pacing).await;
            }
            self.send_subscribe(sink, target).await?;
        }
        Ok(())
    }

    async fn on_message(&self, message: Message, sink: &mut WsSink) -> Result<(), ConnectionError> {
        match message {
            Message::Text(text) => self.on_frame(text.as_bytes(), sink).await,
            Message::Binary(bytes) => self.on_frame(&bytes, sink).await,
            Message::Ping(payload) => self.send(sink, Message::Pong(payload)).await,
            Message::Close(frame) => Err(ConnectionError::Closed(
                frame.map(|f| f.reason.as_str().to_string()),
            )),
            _ => Ok(()),
        }
    }

    async fn on_frame(&self, frame: &[u8], sink: &mut WsSink) -> Result<(), ConnectionError> {
        self.metrics.frame_received();
        let event = classify(frame, &self.index.load());

        match event {
            ClassifiedEvent::SubscriptionAck { correlation_id, provider_id } => {
                self.metrics.subscription_acked();
                let confirmation = self.registry.lock().confirm_subscription(&correlation_id, provider_id);
                match confirmation {
                    Ok(Confirmation::Confirmed(target)) => {
                        debug!(kind = %target.kind, key = %target.key, provider_id, "[Monitor] Abonnement confirmé.");
                    }
                    Ok(Confirmation::Retire { target, provider_id }) => {
                        debug!(key = %target.key, provider_id, "[Monitor] Cible retirée entre-temps, annulation.");
                        self.send_request(sink, JsonRpcRequest::account_unsubscribe(provider_id)).await?;
                    }
                    Err(e) => debug!(error = %e, "[Monitor] Accusé de réception ignoré."),
                }
            }
            ClassifiedEvent::UnsubscribeAck { provider_id, success, .. } => {
                let retired = self.registry.lock().complete_retirement(provider_id);
                if !success {
                    warn!(provider_id, "[Monitor] Le fournisseur a refusé l'annulation ; cible oubliée quand même.");
                }
                debug!(provider_id, key = ?retired.map(|t| t.key), "[Monitor] Abonnement annulé.");
            }
            ClassifiedEvent::RequestRejected { correlation_id, code, message } => {
                self.metrics.request_rejected();
                warn!(%correlation_id, ?code, %message, "[Monitor] Requête rejetée par le fournisseur.");
            }
            ClassifiedEvent::Unparsable { reason } => {
                self.metrics.frame_unparsable();
                trace!(?reason, "[Monitor] Frame ignorée.");
            }
            activity => match ActivityObservation::from_event(activity) {
                Some(observation) => {
                    if self.activity.send(observation).await.is_err() {
                        warn!("[Monitor] La file du projecteur est fermée, activité perdue.");
                    }
                }
                None => trace!("[Monitor] Activité de programme sans portefeuille suivi."),
            },
        }
        Ok(())
    }

    async fn on_command(&self, command: MonitorCommand, sink: &mut WsSink) -> Result<(), ConnectionError> {
        match command {
            MonitorCommand::Subscribe { kind, key } => {
                let claimed = self.registry.lock().claim_request(kind, &key, self.epoch);
                match claimed {
                    Some(target) => self.send_subscribe(sink, &target).await,
                    // Déjà couvert par le réabonnement, ou retiré depuis.
                    None => Ok(()),
                }
            }
            MonitorCommand::Unsubscribe { provider_id, epoch } if epoch == self.epoch => {
                self.send_request(sink, JsonRpcRequest::account_unsubscribe(provider_id)).await
            }
            MonitorCommand::Unsubscribe { provider_id, .. } => {
                debug!(provider_id, "[Monitor] Annulation d'une connexion précédente ignorée.");
                Ok(())
            }
        }
    }

    async fn send_subscribe(&self, sink: &mut WsSink, target: &TrackedTarget) -> Result<(), ConnectionError> {
        let request = match target.kind {
            TargetKind::Wallet => JsonRpcRequest::account_subscribe(
                &target.key,
                &self.settings.commitment,
                &self.settings.account_encoding,
            ),
            TargetKind::Program => JsonRpcRequest::logs_subscribe(&target.key, &self.settings.commitment),
        };
        self.send_request(sink, request).await?;
        self.metrics.subscribe_request_sent();
        Ok(())
    }

    async fn send_request(&self, sink: &mut WsSink, request: JsonRpcRequest) -> Result<(), ConnectionError> {
        trace!(method = request.method, id = %request.id, "[Monitor] Envoi d'une requête.");
        self.send(sink, Message::Text(request.to_text().into())).await
    }

    /// Toute écriture a un délai maximal ; son dépassement compte comme une erreur de connexion.
    async fn send(&self, sink: &mut WsSink, message: Message) -> Result<(), ConnectionError> {
        let limit = self.settings.write_timeout;
        match timeout(limit, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Write(e)),
            Err(_) => Err(ConnectionError::WriteTimeout(limit)),
        }
    }
}

/// Masque la clé d'API dans les logs.
fn redact(url: &str) -> String {
    match url.split_once("api-key=") {
        Some((prefix, _)) => format!("{prefix}api-key=***"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(30);
        let delays: Vec<Duration> = (1..=5).map(|a| reconnect_delay(a, base, max)).collect();

        assert_eq!(delays[0], Duration::from_secs(5));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= max));
        assert_eq!(reconnect_delay(100, base, max), max);
        assert_eq!(reconnect_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn api_key_is_redacted() {
        assert_eq!(redact("wss://rpc.example.com/?api-key=secret"), "wss://rpc.example.com/?api-key=***");
        assert_eq!(redact("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000");
    }
}
