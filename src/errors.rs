/// Module de la taxonomie d'erreurs du collecteur
///
/// Deux niveaux: `FetchError` classe les échecs remontés par l'adaptateur
/// d'exchange, `CollectError` couvre tout le pipeline (registre, store,
/// verrous). La classification pilote la politique de retry de l'exécuteur:
/// différer sans compter, backoff exponentiel, ou passage en erreur.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification stable d'un échec, persistée avec le job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimitExceeded,
    DateRangeTooWide,
    SymbolNotListed,
    TimeframeUnsupported,
    Transient,
    Permanent,
    Unknown,
    DependencyUnmet,
    ConnectorSuspended,
    LockContention,
    StoreWriteFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::DateRangeTooWide => "date_range_too_wide",
            ErrorKind::SymbolNotListed => "symbol_not_listed",
            ErrorKind::TimeframeUnsupported => "timeframe_unsupported",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
            ErrorKind::DependencyUnmet => "dependency_unmet",
            ErrorKind::ConnectorSuspended => "connector_suspended",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::StoreWriteFailed => "store_write_failed",
        }
    }
}

/// Échec d'un appel sortant vers un exchange
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limit dépassé (retry dans {retry_after_ms} ms)")]
    RateLimitExceeded { retry_after_ms: i64 },

    #[error("plage de dates trop large pour l'exchange")]
    DateRangeTooWide,

    #[error("symbole non listé: {0}")]
    SymbolNotListed(String),

    #[error("timeframe non supporté: {0}")]
    TimeframeUnsupported(String),

    #[error("erreur transitoire: {0}")]
    Transient(String),

    #[error("erreur permanente: {0}")]
    Permanent(String),

    #[error("erreur non classée: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            FetchError::DateRangeTooWide => ErrorKind::DateRangeTooWide,
            FetchError::SymbolNotListed(_) => ErrorKind::SymbolNotListed,
            FetchError::TimeframeUnsupported(_) => ErrorKind::TimeframeUnsupported,
            FetchError::Transient(_) => ErrorKind::Transient,
            FetchError::Permanent(_) => ErrorKind::Permanent,
            FetchError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// Erreur du pipeline de collecte
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("exchange inconnu: {0}")]
    ExchangeUnknown(String),

    #[error("job inconnu: {0}")]
    JobUnknown(String),

    #[error("dépendance non satisfaite: {0}")]
    DependencyUnmet(String),

    #[error("cycle de dépendances via {0}")]
    DependencyCycle(String),

    #[error("connecteur suspendu: {0}")]
    ConnectorSuspended(String),

    #[error("verrou déjà détenu: {0}")]
    LockContention(String),

    #[error("écriture du store échouée: {0}")]
    StoreWriteFailed(String),

    #[error("bougie invalide ou mal alignée à open_time={open_time} pour {timeframe}")]
    InvalidCandle { open_time: i64, timeframe: String },

    #[error("job encore référencé par: {0}")]
    JobStillReferenced(String),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error("payload de chunk illisible: {0}")]
    CorruptChunk(#[from] serde_json::Error),
}
