/// Module des timeframes supportés
///
/// Un timeframe définit la durée d'une bougie. Toute l'arithmétique
/// temporelle du collecteur (alignement, cadence, profondeur historique)
/// passe par ce module.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

/// Timeframe d'une bougie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Timeframe {
    /// Intervalle du timeframe en millisecondes
    ///
    /// INVARIANT: open_time % interval_ms == 0 pour toute bougie stockée
    pub fn interval_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => HOUR_MS,
            Timeframe::H2 => 2 * HOUR_MS,
            Timeframe::H4 => 4 * HOUR_MS,
            Timeframe::H6 => 6 * HOUR_MS,
            Timeframe::H8 => 8 * HOUR_MS,
            Timeframe::H12 => 12 * HOUR_MS,
            Timeframe::D1 => DAY_MS,
            Timeframe::D3 => 3 * DAY_MS,
            Timeframe::W1 => 7 * DAY_MS,
            Timeframe::Mo1 => 30 * DAY_MS,
        }
    }

    /// Libellé canonique ("5m", "1h", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1M",
        }
    }

    /// Tous les timeframes, du plus court au plus long
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H2,
            Timeframe::H4,
            Timeframe::H6,
            Timeframe::H8,
            Timeframe::H12,
            Timeframe::D1,
            Timeframe::D3,
            Timeframe::W1,
            Timeframe::Mo1,
        ]
    }

    /// Aligne un timestamp sur la frontière précédente du timeframe
    pub fn align_floor(&self, timestamp_ms: i64) -> i64 {
        let interval = self.interval_ms();
        timestamp_ms.div_euclid(interval) * interval
    }

    /// Prochaine frontière strictement après le timestamp
    ///
    /// Sert à planifier la prochaine exécution d'un job après un succès.
    pub fn next_boundary(&self, timestamp_ms: i64) -> i64 {
        self.align_floor(timestamp_ms) + self.interval_ms()
    }

    /// Vérifie l'alignement d'un open_time sur la frontière du timeframe
    pub fn is_aligned(&self, timestamp_ms: i64) -> bool {
        timestamp_ms.rem_euclid(self.interval_ms()) == 0
    }

    /// Profondeur historique par défaut pour un premier backfill
    ///
    /// Les petits timeframes remontent moins loin: la densité des bougies
    /// rend un historique de plusieurs années inutilement lourd.
    pub fn default_historical_depth_ms(&self) -> i64 {
        match self.interval_ms() {
            ms if ms <= 30 * MINUTE_MS => 180 * DAY_MS,
            ms if ms <= 2 * HOUR_MS => 730 * DAY_MS,
            ms if ms <= 12 * HOUR_MS => 1_095 * DAY_MS,
            _ => 1_825 * DAY_MS,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "2h" => Ok(Timeframe::H2),
            "4h" => Ok(Timeframe::H4),
            "6h" => Ok(Timeframe::H6),
            "8h" => Ok(Timeframe::H8),
            "12h" => Ok(Timeframe::H12),
            "1d" => Ok(Timeframe::D1),
            "3d" => Ok(Timeframe::D3),
            "1w" => Ok(Timeframe::W1),
            "1M" => Ok(Timeframe::Mo1),
            other => Err(format!("timeframe inconnu: {}", other)),
        }
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
