/// Module du modèle de bougie OHLCV
///
/// Une bougie est identifiée par son open_time (millisecondes UTC) au sein
/// d'une série (exchange, symbol, timeframe). Le payload des chunks stocke
/// chaque bougie sous forme compacte [t, o, h, l, c, v] pour limiter la
/// taille des documents; un septième élément optionnel transporte une
/// charge utile d'indicateurs, opaque pour le collecteur.
use crate::timeframe::Timeframe;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Une bougie OHLCV
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Charge utile d'indicateurs, opaque (None pour les données brutes)
    pub extra: Option<serde_json::Value>,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            extra: None,
        }
    }

    /// Contrôle de cohérence d'une bougie
    ///
    /// INVARIANTS: low ≤ open,close ≤ high; volume ≥ 0; valeurs finies;
    /// open_time aligné sur la frontière du timeframe.
    pub fn is_valid(&self, timeframe: Timeframe) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());

        finite
            && self.volume >= 0.0
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low >= 0.0
            && timeframe.is_aligned(self.open_time)
    }
}

impl Serialize for Candle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.extra.is_some() { 7 } else { 6 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.open_time)?;
        seq.serialize_element(&self.open)?;
        seq.serialize_element(&self.high)?;
        seq.serialize_element(&self.low)?;
        seq.serialize_element(&self.close)?;
        seq.serialize_element(&self.volume)?;
        if let Some(extra) = &self.extra {
            seq.serialize_element(extra)?;
        }
        seq.end()
    }
}

struct CandleVisitor;

impl<'de> Visitor<'de> for CandleVisitor {
    type Value = Candle;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("un tableau [open_time, o, h, l, c, v, extra?]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Candle, A::Error> {
        let missing = |i| serde::de::Error::invalid_length(i, &"au moins 6 éléments");

        let open_time = seq.next_element()?.ok_or_else(|| missing(0))?;
        let open = seq.next_element()?.ok_or_else(|| missing(1))?;
        let high = seq.next_element()?.ok_or_else(|| missing(2))?;
        let low = seq.next_element()?.ok_or_else(|| missing(3))?;
        let close = seq.next_element()?.ok_or_else(|| missing(4))?;
        let volume = seq.next_element()?.ok_or_else(|| missing(5))?;
        let extra = seq.next_element()?;

        Ok(Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            extra,
        })
    }
}

impl<'de> Deserialize<'de> for Candle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(CandleVisitor)
    }
}
