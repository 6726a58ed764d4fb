/// Module des alertes consultatives
///
/// Le collecteur émet des événements sans politique de routage: un canal
/// broadcast que les collaborateurs externes (ou le logger du démon)
/// consomment à leur guise. Un émetteur sans abonné n'est pas une erreur.
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Événement d'alerte émis par le collecteur
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    /// Seuil d'échecs consécutifs franchi sur un job
    ConsecutiveFailures {
        job_id: String,
        count: u32,
    },
    /// Connecteur suspendu par un opérateur
    ConnectorSuspended {
        exchange_id: String,
    },
    /// Fraction de refus du rate limiter au-dessus du seuil
    RateLimitSaturation {
        exchange_id: String,
        denied_fraction: f64,
    },
    /// Erreur classée permanente sur un job
    PermanentError {
        job_id: String,
        message: String,
    },
}

/// Bus d'alertes (broadcast tokio)
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<AlertEvent>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        AlertBus { tx }
    }

    /// Émet un événement; l'absence d'abonné est silencieusement ignorée
    pub fn emit(&self, event: AlertEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }

    /// Attache un abonné qui trace chaque alerte (utilisé par le démon)
    pub fn spawn_log_subscriber(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        warn!(alerte = ?event, "alerte émise");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "alertes perdues (abonné en retard)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        AlertBus::new(256)
    }
}
