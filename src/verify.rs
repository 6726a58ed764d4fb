/// Module de vérification de l'intégrité des séries stockées
///
/// Détecte sur une série (exchange, symbol, timeframe):
/// - les GAPS: intervalles trop grands entre bougies consécutives;
/// - les OVERLAPS: intervalles trop petits (désordre inter-chunks).
/// La réparation passe par le re-fetch des plages manquantes, jamais par
/// interpolation: ce module ne fait que mesurer et rapporter.
use crate::chunk_store::ChunkStore;
use crate::errors::CollectError;
use crate::timeframe::Timeframe;
use crate::utils;
use rusqlite::Connection;
use serde::Serialize;

/// Un trou dans la série
#[derive(Debug, Clone, Serialize)]
pub struct Gap {
    /// open_time de la bougie précédant le trou
    pub after_open_time: i64,
    /// Intervalle observé (ms)
    pub interval_ms: i64,
    /// Bougies manquantes dans ce trou
    pub missing_candles: i64,
}

/// Rapport d'espacement d'une série
#[derive(Debug, Clone, Serialize)]
pub struct SpacingReport {
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle_count: i64,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
    /// Nombre attendu entre première et dernière bougie, trous compris
    pub expected_count: i64,
    pub gaps: Vec<Gap>,
    pub overlap_count: i64,
}

impl SpacingReport {
    pub fn is_continuous(&self) -> bool {
        self.gaps.is_empty() && self.overlap_count == 0
    }

    pub fn missing_total(&self) -> i64 {
        self.gaps.iter().map(|g| g.missing_candles).sum()
    }
}

/// Construit le rapport d'espacement d'une série
pub fn verify_series(
    conn: &Connection,
    exchange_id: &str,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<SpacingReport, CollectError> {
    let interval = timeframe.interval_ms();
    let candles = ChunkStore::range(
        conn,
        exchange_id,
        symbol,
        timeframe,
        0,
        i64::MAX,
        usize::MAX,
        0,
    )?;

    let mut gaps = Vec::new();
    let mut overlap_count = 0i64;
    for pair in candles.windows(2) {
        let observed = pair[1].open_time - pair[0].open_time;
        if observed > interval {
            gaps.push(Gap {
                after_open_time: pair[0].open_time,
                interval_ms: observed,
                missing_candles: (observed / interval) - 1,
            });
        } else if observed < interval {
            overlap_count += 1;
        }
    }

    let first_open_time = candles.first().map(|c| c.open_time);
    let last_open_time = candles.last().map(|c| c.open_time);
    let expected_count = match (first_open_time, last_open_time) {
        (Some(first), Some(last)) => (last - first) / interval + 1,
        _ => 0,
    };

    Ok(SpacingReport {
        exchange_id: exchange_id.to_string(),
        symbol: symbol.to_string(),
        timeframe,
        candle_count: candles.len() as i64,
        first_open_time,
        last_open_time,
        expected_count,
        gaps,
        overlap_count,
    })
}

/// Affiche un rapport dans le style des outils en ligne de commande
pub fn print_report(report: &SpacingReport) {
    println!(
        "\n=== Vérification de l'espacement pour {}/{}/{} ===",
        report.exchange_id, report.symbol, report.timeframe
    );
    println!("Nombre total de bougies: {}", report.candle_count);

    if let (Some(first), Some(last)) = (report.first_open_time, report.last_open_time) {
        println!("Première bougie: {}", utils::format_timestamp_ms(first));
        println!("Dernière bougie: {}", utils::format_timestamp_ms(last));
        println!("Nombre de bougies attendu: {}", report.expected_count);
        println!(
            "Différence: {}",
            report.candle_count - report.expected_count
        );
    }

    if report.gaps.is_empty() {
        println!("✓ Aucun gap détecté - les données sont continues!");
    } else {
        println!("--- GAPS DÉTECTÉS ({} gaps) ---", report.gaps.len());
        for gap in report.gaps.iter().take(10) {
            println!(
                "  Gap après {}: intervalle de {} ms ({} bougies manquantes)",
                utils::format_timestamp_ms(gap.after_open_time),
                gap.interval_ms,
                gap.missing_candles
            );
        }
        if report.gaps.len() > 10 {
            println!("  ... et {} autres gaps", report.gaps.len() - 10);
        }
    }

    if report.overlap_count > 0 {
        println!("⚠ {} overlaps détectés", report.overlap_count);
    }
}
