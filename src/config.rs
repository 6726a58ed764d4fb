/// Module de configuration du collecteur
///
/// Les valeurs par défaut couvrent un déploiement mono-machine; un fichier
/// JSON optionnel les surcharge champ par champ.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Configuration runtime du collecteur
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Chemin de la base SQLite
    pub db_path: String,
    /// Nombre de workers du pool
    pub workers: usize,
    /// Durée du verrou d'exécution (ms); doit dépasser la durée maximale
    /// d'un run, marge d'horloge comprise
    pub lock_duration_ms: i64,
    /// Pause du worker quand aucun job n'est dû (ms)
    pub poll_interval_ms: u64,
    /// Base du backoff exponentiel (ms)
    pub backoff_base_ms: i64,
    /// Échecs consécutifs avant émission d'une alerte
    pub failure_alert_threshold: u32,
    /// Temporisation après une erreur permanente (ms)
    pub permanent_cooldown_ms: i64,
    /// Fenêtre de fraîcheur des dépendances (ms); None = un timeframe du
    /// job dépendant
    pub freshness_window_ms: Option<i64>,
    /// Plafond souple de bougies par chunk avant débordement demi-mois
    pub chunk_soft_cap: usize,
    /// Amplitude du jitter de planification et de backoff (ms)
    pub scheduling_jitter_ms: i64,
    /// Dictionnaire d'erreurs externe (JSON), fusionné sur les entrées
    /// intégrées des descripteurs
    pub error_dictionary_path: Option<String>,
    /// Fraction de refus déclenchant l'alerte de saturation
    pub saturation_threshold: f64,
    /// Fenêtre glissante de la mesure de saturation (ms)
    pub saturation_window_ms: i64,
    /// Profondeur historique par timeframe (jours), surcharge les défauts
    pub historical_depth_days: HashMap<String, i64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            db_path: "candles.db".to_string(),
            workers: 4,
            lock_duration_ms: 300_000,
            poll_interval_ms: 1_000,
            backoff_base_ms: 30_000,
            failure_alert_threshold: 3,
            permanent_cooldown_ms: 21_600_000,
            freshness_window_ms: None,
            chunk_soft_cap: 20_000,
            scheduling_jitter_ms: 5_000,
            error_dictionary_path: None,
            saturation_threshold: 0.5,
            saturation_window_ms: 60_000,
            historical_depth_days: HashMap::new(),
        }
    }
}

impl CollectorConfig {
    /// Charge la configuration: défauts, puis fichier JSON si fourni
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("lecture de la config {}", p.display()))?;
                let config: CollectorConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing de la config {}", p.display()))?;
                Ok(config)
            }
            None => Ok(CollectorConfig::default()),
        }
    }
}
