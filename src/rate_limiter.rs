/// Module du rate limiter par exchange
///
/// Toute requête sortante doit passer par `wait_for_slot` et obtenir un
/// Grant. L'algorithme travaille uniquement sur l'enregistrement du
/// connecteur en base, relu à chaque tentative:
/// 1. espacement: si la dernière requête est trop récente, dormir la
///    différence (attente coopérative);
/// 2. remise à zéro de la fenêtre expirée (CAS);
/// 3. consommation dans la fenêtre courante (CAS);
/// 4. fenêtre pleine: Denied(retry_after).
///
/// PROPRIÉTÉS: jamais plus de `limit` Grants par fenêtre de `period_ms`,
/// jamais deux Grants espacés de moins de `min_delay_ms`, quel que soit le
/// nombre d'appelants concurrents ou de processus.
use crate::alerts::{AlertBus, AlertEvent};
use crate::connectors::{ConnectorRegistry, ConnectorStatus, UsageOutcome};
use crate::errors::CollectError;
use crate::utils;
use rusqlite::Connection;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Décision du limiter pour une requête sortante
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// L'appelant peut émettre sa requête
    Grant,
    /// Budget épuisé (ou échéance trop proche): réessayer après ce délai
    Denied { retry_after_ms: i64 },
}

/// Fenêtre glissante grants/refus pour la mesure de saturation
#[derive(Debug, Default)]
struct SaturationWindow {
    samples: VecDeque<(i64, bool)>,
    last_alert_at: i64,
}

/// Rate limiter partagé entre workers d'un même processus
///
/// L'état de budget vit en base; seule la mesure de saturation (purement
/// consultative) est conservée en mémoire.
pub struct RateLimiter {
    alerts: AlertBus,
    saturation_threshold: f64,
    saturation_window_ms: i64,
    windows: Mutex<HashMap<String, SaturationWindow>>,
}

impl RateLimiter {
    pub fn new(alerts: AlertBus, saturation_threshold: f64, saturation_window_ms: i64) -> Self {
        RateLimiter {
            alerts,
            saturation_threshold,
            saturation_window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Attend un créneau d'émission pour cet exchange
    ///
    /// RETOUR: Grant, ou Denied(retry_after) si la fenêtre est pleine ou
    /// si l'attente d'espacement dépasserait l'échéance du run.
    pub async fn wait_for_slot(
        &self,
        conn: &Connection,
        exchange_id: &str,
        deadline: Instant,
    ) -> Result<SlotDecision, CollectError> {
        loop {
            let connector = ConnectorRegistry::get(conn, exchange_id)?;
            if connector.status == ConnectorStatus::Suspended {
                return Err(CollectError::ConnectorSuspended(exchange_id.to_string()));
            }

            let now = utils::now_ms();

            // Espacement minimum entre deux requêtes
            if let Some(last_call) = connector.last_api_call_at {
                let wait_ms = connector.rate_limit.min_delay_ms - (now - last_call);
                if wait_ms > 0 {
                    if Instant::now() + Duration::from_millis(wait_ms as u64) >= deadline {
                        self.record(exchange_id, now, false);
                        return Ok(SlotDecision::Denied {
                            retry_after_ms: wait_ms,
                        });
                    }
                    debug!(exchange_id, wait_ms, "attente d'espacement");
                    tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
                    continue; // relire l'état: un concurrent a pu passer
                }
            }

            // Fenêtre expirée: la remise à zéro vaut acquisition
            if now - connector.window_start >= connector.rate_limit.period_ms {
                if ConnectorRegistry::reset_window_if_expired(conn, exchange_id, now)? {
                    self.record(exchange_id, now, true);
                    return Ok(SlotDecision::Grant);
                }
                continue; // un concurrent a gagné la remise à zéro
            }

            // Consommation dans la fenêtre courante
            match ConnectorRegistry::increment_usage(conn, exchange_id, now)? {
                UsageOutcome::Granted => {
                    self.record(exchange_id, now, true);
                    return Ok(SlotDecision::Grant);
                }
                UsageOutcome::Exhausted { retry_after_ms } => {
                    self.record(exchange_id, now, false);
                    return Ok(SlotDecision::Denied { retry_after_ms });
                }
                UsageOutcome::Conflict => continue,
            }
        }
    }

    /// Alimente la fenêtre de saturation et émet l'alerte au franchissement
    fn record(&self, exchange_id: &str, now: i64, granted: bool) {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows.entry(exchange_id.to_string()).or_default();
        window.samples.push_back((now, granted));
        while let Some(&(t, _)) = window.samples.front() {
            if now - t > self.saturation_window_ms {
                window.samples.pop_front();
            } else {
                break;
            }
        }

        let total = window.samples.len();
        if total < 10 {
            return;
        }
        let denied = window.samples.iter().filter(|(_, g)| !g).count();
        let denied_fraction = denied as f64 / total as f64;
        let alert_cooldown_elapsed = now - window.last_alert_at > self.saturation_window_ms;
        if denied_fraction > self.saturation_threshold && alert_cooldown_elapsed {
            window.last_alert_at = now;
            self.alerts.emit(AlertEvent::RateLimitSaturation {
                exchange_id: exchange_id.to_string(),
                denied_fraction,
            });
        }
    }
}
