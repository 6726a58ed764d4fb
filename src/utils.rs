/// Module utilitaire pour les fonctions partagées
use chrono::{DateTime, Datelike, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Formate un timestamp en millisecondes en format lisible
///
/// EXEMPLE:
/// 1700000000000 → "2023-11-14 22:13:20"
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    if let Some(datetime_utc) = DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        datetime_utc.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        "Invalid timestamp".to_string()
    }
}

/// Timestamp actuel en millisecondes UTC
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Libellé du bucket mensuel d'un open_time (format "YYYY-MM")
pub fn year_month(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m").to_string())
        .unwrap_or_else(|| "0000-00".to_string())
}

/// Jour du mois (1-31) d'un open_time, pour le routage demi-mois
pub fn day_of_month(timestamp_ms: i64) -> u32 {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.day())
        .unwrap_or(1)
}
