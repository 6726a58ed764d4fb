/// Module du registre des connecteurs d'exchange
///
/// Un connecteur par exchange supporté, avec son budget de rate limit.
/// Le tuple (window_start, usage, last_api_call_at) est l'unique état
/// partagé du rate limiting: il vit en base, jamais en cache mémoire, et
/// n'est modifié que par UPDATE conditionnel (compare-and-set) pour rester
/// sûr avec des workers multi-processus.
use crate::errors::CollectError;
use crate::utils;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// Budget de rate limit d'un connecteur
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// Requêtes maximum par fenêtre
    pub limit: i64,
    /// Longueur de la fenêtre (ms)
    pub period_ms: i64,
    /// Espacement minimum entre deux requêtes (ms)
    pub min_delay_ms: i64,
}

/// Statut d'un connecteur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Active,
    Suspended,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Active => "active",
            ConnectorStatus::Suspended => "suspended",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "suspended" => ConnectorStatus::Suspended,
            _ => ConnectorStatus::Active,
        }
    }
}

/// Enregistrement d'un connecteur
#[derive(Debug, Clone, Serialize)]
pub struct Connector {
    pub exchange_id: String,
    pub display_name: String,
    pub status: ConnectorStatus,
    pub rate_limit: RateLimitSpec,
    pub usage: i64,
    pub window_start: i64,
    pub last_api_call_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Issue d'une tentative de consommation de budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Budget consommé, la requête peut partir
    Granted,
    /// Fenêtre pleine: réessayer après ce délai
    Exhausted { retry_after_ms: i64 },
    /// L'état observé a changé sous nos pieds: relire et retenter
    Conflict,
}

/// Registre des connecteurs
pub struct ConnectorRegistry;

impl ConnectorRegistry {
    /// Crée le connecteur ou met à jour nom et budget, idempotent sur
    /// exchange_id. L'usage et la fenêtre en cours sont préservés.
    pub fn register_or_update(
        conn: &Connection,
        exchange_id: &str,
        display_name: &str,
        rate_limit: RateLimitSpec,
    ) -> Result<Connector, CollectError> {
        let now = utils::now_ms();
        conn.execute(
            "INSERT INTO connectors
                 (exchange_id, display_name, status, rate_limit_max,
                  rate_limit_period_ms, rate_limit_min_delay_ms,
                  rate_limit_usage, rate_limit_window_start, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5, 0, ?6, ?6, ?6)
             ON CONFLICT(exchange_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 rate_limit_max = excluded.rate_limit_max,
                 rate_limit_period_ms = excluded.rate_limit_period_ms,
                 rate_limit_min_delay_ms = excluded.rate_limit_min_delay_ms,
                 updated_at = excluded.updated_at",
            params![
                exchange_id,
                display_name,
                rate_limit.limit,
                rate_limit.period_ms,
                rate_limit.min_delay_ms,
                now
            ],
        )?;

        Self::get(conn, exchange_id)
    }

    pub fn get(conn: &Connection, exchange_id: &str) -> Result<Connector, CollectError> {
        conn.query_row(
            "SELECT exchange_id, display_name, status, rate_limit_max,
                    rate_limit_period_ms, rate_limit_min_delay_ms,
                    rate_limit_usage, rate_limit_window_start,
                    last_api_call_at, created_at, updated_at
             FROM connectors WHERE exchange_id = ?1",
            params![exchange_id],
            Self::map_row,
        )
        .optional()?
        .ok_or_else(|| CollectError::ExchangeUnknown(exchange_id.to_string()))
    }

    pub fn list(
        conn: &Connection,
        status: Option<ConnectorStatus>,
    ) -> Result<Vec<Connector>, CollectError> {
        let mut stmt = conn.prepare(
            "SELECT exchange_id, display_name, status, rate_limit_max,
                    rate_limit_period_ms, rate_limit_min_delay_ms,
                    rate_limit_usage, rate_limit_window_start,
                    last_api_call_at, created_at, updated_at
             FROM connectors
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY exchange_id",
        )?;
        let connectors = stmt
            .query_map(params![status.map(|s| s.as_str())], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(connectors)
    }

    pub fn suspend(conn: &Connection, exchange_id: &str) -> Result<(), CollectError> {
        Self::set_status(conn, exchange_id, ConnectorStatus::Suspended)
    }

    pub fn resume(conn: &Connection, exchange_id: &str) -> Result<(), CollectError> {
        Self::set_status(conn, exchange_id, ConnectorStatus::Active)
    }

    fn set_status(
        conn: &Connection,
        exchange_id: &str,
        status: ConnectorStatus,
    ) -> Result<(), CollectError> {
        let changed = conn.execute(
            "UPDATE connectors SET status = ?2, updated_at = ?3 WHERE exchange_id = ?1",
            params![exchange_id, status.as_str(), utils::now_ms()],
        )?;
        if changed == 0 {
            return Err(CollectError::ExchangeUnknown(exchange_id.to_string()));
        }
        Ok(())
    }

    /// Remet la fenêtre à zéro si elle est expirée (compare-and-set)
    ///
    /// RETOUR: true si la remise à zéro a consommé la première requête de
    /// la nouvelle fenêtre (l'appelant a donc son créneau).
    pub fn reset_window_if_expired(
        conn: &Connection,
        exchange_id: &str,
        now: i64,
    ) -> Result<bool, CollectError> {
        let connector = Self::get(conn, exchange_id)?;
        if now - connector.window_start < connector.rate_limit.period_ms {
            return Ok(false);
        }

        // CAS sur la fenêtre observée: un seul gagnant par expiration
        let changed = conn.execute(
            "UPDATE connectors
             SET rate_limit_window_start = ?2, rate_limit_usage = 1,
                 last_api_call_at = ?2, updated_at = ?2
             WHERE exchange_id = ?1 AND rate_limit_window_start = ?3",
            params![exchange_id, now, connector.window_start],
        )?;
        Ok(changed == 1)
    }

    /// Consomme une unité de budget dans la fenêtre courante (compare-and-set)
    ///
    /// Utilisé uniquement par le rate limiter. L'état est relu à chaque
    /// tentative: aucune copie mémoire ne survit entre deux opérations.
    pub fn increment_usage(
        conn: &Connection,
        exchange_id: &str,
        now: i64,
    ) -> Result<UsageOutcome, CollectError> {
        let connector = Self::get(conn, exchange_id)?;

        if connector.usage >= connector.rate_limit.limit {
            let retry_after_ms =
                (connector.window_start + connector.rate_limit.period_ms - now).max(1);
            return Ok(UsageOutcome::Exhausted { retry_after_ms });
        }

        let changed = conn.execute(
            "UPDATE connectors
             SET rate_limit_usage = rate_limit_usage + 1,
                 last_api_call_at = ?2, updated_at = ?2
             WHERE exchange_id = ?1
               AND rate_limit_usage = ?3
               AND rate_limit_window_start = ?4",
            params![exchange_id, now, connector.usage, connector.window_start],
        )?;

        if changed == 1 {
            Ok(UsageOutcome::Granted)
        } else {
            Ok(UsageOutcome::Conflict)
        }
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Connector> {
        let status: String = row.get(2)?;
        Ok(Connector {
            exchange_id: row.get(0)?,
            display_name: row.get(1)?,
            status: ConnectorStatus::from_db(&status),
            rate_limit: RateLimitSpec {
                limit: row.get(3)?,
                period_ms: row.get(4)?,
                min_delay_ms: row.get(5)?,
            },
            usage: row.get(6)?,
            window_start: row.get(7)?,
            last_api_call_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
