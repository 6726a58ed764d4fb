/// Module du store OHLCV par chunks
///
/// ARCHITECTURE:
/// Un chunk = un document par (exchange, symbol, timeframe, bucket), où
/// bucket est le mois calendaire UTC de l'open_time ("2026-01"). Le payload
/// est la séquence JSON des bougies, triée par open_time strictement
/// croissant et unique. Quand un chunk mensuel dépasse le plafond souple,
/// il déborde en deux buckets demi-mois ("2026-01.1" jours 1-15,
/// "2026-01.2" jours 16+); les lecteurs réunissent les buckets de façon
/// transparente.
///
/// Les écritures d'un batch sont transactionnelles: chaque tranche
/// mensuelle est incorporée entièrement ou pas du tout.
use crate::candle::Candle;
use crate::errors::CollectError;
use crate::timeframe::Timeframe;
use crate::utils;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;

/// Jour de bascule entre les deux buckets demi-mois
const HALF_MONTH_DAY: u32 = 16;

/// Résultat d'un upsert de batch
///
/// inserted + duplicates == taille du batch. Un doublon est une bougie dont
/// l'open_time existait déjà (remplacement last-write-wins des champs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Statistiques agrégées d'une série ou d'un exchange
#[derive(Debug, Clone, serde::Serialize)]
pub struct SeriesStats {
    pub candle_count: i64,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
    pub chunk_count: i64,
    pub estimated_size: i64,
}

/// Store de bougies par chunks mensuels
pub struct ChunkStore {
    soft_cap: usize,
}

impl ChunkStore {
    pub fn new(soft_cap: usize) -> Self {
        ChunkStore { soft_cap }
    }

    /// Insère un batch de bougies, dédupliqué par open_time
    ///
    /// RETOUR: (inserted, duplicates); la somme vaut la taille du batch
    pub fn upsert_batch(
        &self,
        conn: &mut Connection,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<UpsertOutcome, CollectError> {
        if candles.is_empty() {
            return Ok(UpsertOutcome {
                inserted: 0,
                duplicates: 0,
            });
        }

        for candle in candles {
            if !candle.is_valid(timeframe) {
                return Err(CollectError::InvalidCandle {
                    open_time: candle.open_time,
                    timeframe: timeframe.to_string(),
                });
            }
        }

        // Découpage du batch par mois calendaire avant écriture
        let mut by_month: BTreeMap<String, Vec<&Candle>> = BTreeMap::new();
        for candle in candles {
            by_month
                .entry(utils::year_month(candle.open_time))
                .or_default()
                .push(candle);
        }

        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        let now = utils::now_ms();

        let tx = conn.transaction()?;
        for (month, slice) in by_month {
            let outcome = Self::upsert_month_slice(&tx, exchange_id, symbol, timeframe, &month, &slice, self.soft_cap, now)?;
            inserted += outcome.inserted;
            duplicates += outcome.duplicates;
        }
        tx.commit()?;

        Ok(UpsertOutcome {
            inserted,
            duplicates,
        })
    }

    /// Incorpore la tranche mensuelle d'un batch dans son ou ses buckets
    fn upsert_month_slice(
        tx: &rusqlite::Transaction<'_>,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        month: &str,
        slice: &[&Candle],
        soft_cap: usize,
        now: i64,
    ) -> Result<UpsertOutcome, CollectError> {
        let spilled = Self::month_is_spilled(tx, exchange_id, symbol, timeframe, month)?;

        let mut inserted = 0usize;
        let mut duplicates = 0usize;

        if spilled {
            // Mois déjà débordé: routage direct par demi-mois
            let mut halves: BTreeMap<String, Vec<&Candle>> = BTreeMap::new();
            for candle in slice {
                halves
                    .entry(Self::half_bucket(month, candle.open_time))
                    .or_default()
                    .push(*candle);
            }
            for (bucket, half_slice) in halves {
                let merged = Self::merge_into_bucket(tx, exchange_id, symbol, timeframe, &bucket, &half_slice)?;
                inserted += merged.0;
                duplicates += merged.1;
                Self::write_bucket(tx, exchange_id, symbol, timeframe, &bucket, &merged.2, now)?;
            }
        } else {
            let (new_inserted, new_duplicates, merged) =
                Self::merge_into_bucket(tx, exchange_id, symbol, timeframe, month, slice)?;
            inserted += new_inserted;
            duplicates += new_duplicates;

            if merged.len() > soft_cap {
                // Débordement: le bucket mensuel éclate en deux demi-mois
                let mut first_half: Vec<Candle> = Vec::new();
                let mut second_half: Vec<Candle> = Vec::new();
                for candle in merged.into_values() {
                    if utils::day_of_month(candle.open_time) < HALF_MONTH_DAY {
                        first_half.push(candle);
                    } else {
                        second_half.push(candle);
                    }
                }
                tx.execute(
                    "DELETE FROM candle_chunks
                     WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND bucket = ?4",
                    params![exchange_id, symbol, timeframe.as_str(), month],
                )?;
                if !first_half.is_empty() {
                    let map: BTreeMap<i64, Candle> =
                        first_half.into_iter().map(|c| (c.open_time, c)).collect();
                    Self::write_bucket(tx, exchange_id, symbol, timeframe, &format!("{}.1", month), &map, now)?;
                }
                if !second_half.is_empty() {
                    let map: BTreeMap<i64, Candle> =
                        second_half.into_iter().map(|c| (c.open_time, c)).collect();
                    Self::write_bucket(tx, exchange_id, symbol, timeframe, &format!("{}.2", month), &map, now)?;
                }
            } else {
                Self::write_bucket(tx, exchange_id, symbol, timeframe, month, &merged, now)?;
            }
        }

        Ok(UpsertOutcome {
            inserted,
            duplicates,
        })
    }

    /// Vrai si le mois a déjà débordé en buckets demi-mois
    fn month_is_spilled(
        tx: &rusqlite::Transaction<'_>,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        month: &str,
    ) -> Result<bool, CollectError> {
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM candle_chunks
             WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3
               AND bucket LIKE ?4 || '.%'",
            params![exchange_id, symbol, timeframe.as_str(), month],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn half_bucket(month: &str, open_time: i64) -> String {
        if utils::day_of_month(open_time) < HALF_MONTH_DAY {
            format!("{}.1", month)
        } else {
            format!("{}.2", month)
        }
    }

    /// Fusionne une tranche dans le contenu existant d'un bucket
    ///
    /// RETOUR: (inserted, duplicates, contenu fusionné trié par open_time)
    fn merge_into_bucket(
        tx: &rusqlite::Transaction<'_>,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        bucket: &str,
        slice: &[&Candle],
    ) -> Result<(usize, usize, BTreeMap<i64, Candle>), CollectError> {
        let existing: Option<String> = tx
            .query_row(
                "SELECT payload FROM candle_chunks
                 WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3 AND bucket = ?4",
                params![exchange_id, symbol, timeframe.as_str(), bucket],
                |row| row.get(0),
            )
            .optional()?;

        let mut merged: BTreeMap<i64, Candle> = match existing {
            Some(payload) => serde_json::from_str::<Vec<Candle>>(&payload)?
                .into_iter()
                .map(|c| (c.open_time, c))
                .collect(),
            None => BTreeMap::new(),
        };

        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        for candle in slice {
            // last-write-wins sur les champs; les compteurs reflètent la
            // nouveauté logique, pas l'identité des octets
            if merged.insert(candle.open_time, (*candle).clone()).is_some() {
                duplicates += 1;
            } else {
                inserted += 1;
            }
        }

        Ok((inserted, duplicates, merged))
    }

    /// Écrit (ou remplace) un bucket et ses métadonnées
    fn write_bucket(
        tx: &rusqlite::Transaction<'_>,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        bucket: &str,
        content: &BTreeMap<i64, Candle>,
        now: i64,
    ) -> Result<(), CollectError> {
        if content.is_empty() {
            return Ok(());
        }
        let first = *content.keys().next().unwrap_or(&0);
        let last = *content.keys().next_back().unwrap_or(&0);
        let candles: Vec<&Candle> = content.values().collect();
        let payload = serde_json::to_string(&candles)?;

        tx.execute(
            "INSERT INTO candle_chunks
                 (exchange_id, symbol, timeframe, bucket, candle_count,
                  first_open_time, last_open_time, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(exchange_id, symbol, timeframe, bucket) DO UPDATE SET
                 candle_count = excluded.candle_count,
                 first_open_time = excluded.first_open_time,
                 last_open_time = excluded.last_open_time,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                exchange_id,
                symbol,
                timeframe.as_str(),
                bucket,
                content.len() as i64,
                first,
                last,
                payload,
                now
            ],
        )?;

        Ok(())
    }

    /// Les n dernières bougies, de la plus récente à la plus ancienne
    pub fn tail(
        conn: &Connection,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Candle>, CollectError> {
        let mut stmt = conn.prepare(
            "SELECT payload FROM candle_chunks
             WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3
             ORDER BY last_open_time DESC",
        )?;
        let payloads = stmt
            .query_map(params![exchange_id, symbol, timeframe.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out: Vec<Candle> = Vec::with_capacity(n.min(1024));
        for payload in payloads {
            if out.len() >= n {
                break;
            }
            let chunk: Vec<Candle> = serde_json::from_str(&payload)?;
            for candle in chunk.into_iter().rev() {
                out.push(candle);
                if out.len() >= n {
                    break;
                }
            }
        }

        Ok(out)
    }

    /// Scan paginé d'une plage [from, to], trié par open_time croissant
    pub fn range(
        conn: &Connection,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Candle>, CollectError> {
        let mut stmt = conn.prepare(
            "SELECT payload FROM candle_chunks
             WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3
               AND first_open_time <= ?4 AND last_open_time >= ?5
             ORDER BY first_open_time ASC",
        )?;
        let payloads = stmt
            .query_map(
                params![exchange_id, symbol, timeframe.as_str(), to, from],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut skipped = 0usize;
        let mut out: Vec<Candle> = Vec::new();
        for payload in payloads {
            if out.len() >= limit {
                break;
            }
            let chunk: Vec<Candle> = serde_json::from_str(&payload)?;
            for candle in chunk {
                if candle.open_time < from || candle.open_time > to {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                out.push(candle);
                if out.len() >= limit {
                    break;
                }
            }
        }

        Ok(out)
    }

    /// Statistiques agrégées; symbol et timeframe affinent le périmètre
    pub fn stats(
        conn: &Connection,
        exchange_id: &str,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
    ) -> Result<SeriesStats, CollectError> {
        let mut sql = String::from(
            "SELECT COALESCE(SUM(candle_count), 0), MIN(first_open_time),
                    MAX(last_open_time), COUNT(*), COALESCE(SUM(LENGTH(payload)), 0)
             FROM candle_chunks WHERE exchange_id = ?1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(exchange_id.to_string())];
        if let Some(sym) = symbol {
            sql.push_str(&format!(" AND symbol = ?{}", values.len() + 1));
            values.push(Box::new(sym.to_string()));
        }
        if let Some(tf) = timeframe {
            sql.push_str(&format!(" AND timeframe = ?{}", values.len() + 1));
            values.push(Box::new(tf.as_str().to_string()));
        }

        let params_ref: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let stats = conn.query_row(&sql, params_ref.as_slice(), |row| {
            Ok(SeriesStats {
                candle_count: row.get(0)?,
                first_open_time: row.get(1)?,
                last_open_time: row.get(2)?,
                chunk_count: row.get(3)?,
                estimated_size: row.get(4)?,
            })
        })?;

        Ok(stats)
    }

    /// Supprime en bloc les chunks entièrement antérieurs au seuil
    ///
    /// La rétention est consultative: le curseur des jobs n'est pas rembobiné.
    pub fn delete_chunks_older_than(
        conn: &Connection,
        cutoff_open_time: i64,
    ) -> Result<usize, CollectError> {
        let dropped = conn.execute(
            "DELETE FROM candle_chunks WHERE last_open_time < ?1",
            params![cutoff_open_time],
        )?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;

    const T0: i64 = 1_768_893_600_000; // 2026-01-20T07:20:00Z
    const M5: i64 = 300_000;

    fn candles(start: i64, step_ms: i64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let t = start + i as i64 * step_ms;
                Candle::new(t, 100.0, 101.0, 99.0, 100.5, 10.0)
            })
            .collect()
    }

    fn store() -> ChunkStore {
        ChunkStore::new(20_000)
    }

    #[test]
    fn test_upsert_single_month_chunk() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let batch = candles(T0, M5, 80);
        let outcome = store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();
        assert_eq!(outcome.inserted, 80);
        assert_eq!(outcome.duplicates, 0);

        let chunk_count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM candle_chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(chunk_count, 1);

        let bucket: String = db
            .connection()
            .query_row("SELECT bucket FROM candle_chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bucket, "2026-01");
    }

    #[test]
    fn test_idempotent_replay() {
        // rejouer un batch redonne le même ensemble stocké
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let batch = candles(T0, M5, 50);

        let first = store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();
        assert_eq!(first.inserted, 50);

        let replay = store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();
        assert_eq!(replay.inserted, 0);
        assert_eq!(replay.duplicates, 50);
        assert_eq!(replay.inserted + replay.duplicates, batch.len());

        let stored = ChunkStore::tail(db.connection(), "bybit", "ETH/USDT", Timeframe::M5, 1000)
            .unwrap();
        assert_eq!(stored.len(), 50);
    }

    #[test]
    fn test_uniqueness_per_open_time() {
        // jamais deux bougies au même open_time
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let mut batch = candles(T0, M5, 10);
        // même open_time, champs différents: last-write-wins
        let mut replayed = batch[3].clone();
        replayed.close = 999.0;
        batch.push(replayed);

        let outcome = store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();
        assert_eq!(outcome.inserted, 10);
        assert_eq!(outcome.duplicates, 1);

        let stored = ChunkStore::range(
            db.connection(),
            "bybit",
            "ETH/USDT",
            Timeframe::M5,
            0,
            i64::MAX,
            1000,
            0,
        )
        .unwrap();
        assert_eq!(stored.len(), 10);
        let times: Vec<i64> = stored.iter().map(|c| c.open_time).collect();
        let mut deduped = times.clone();
        deduped.dedup();
        assert_eq!(times, deduped);
        // le re-jeu a remplacé les champs
        assert_eq!(stored[3].close, 999.0);
    }

    #[test]
    fn test_rejects_misaligned() {
        // un open_time hors frontière est refusé
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let batch = vec![Candle::new(T0 + 1, 100.0, 101.0, 99.0, 100.5, 1.0)];
        let result = store().upsert_batch(
            db.connection_mut(),
            "bybit",
            "ETH/USDT",
            Timeframe::M5,
            &batch,
        );
        assert!(matches!(result, Err(CollectError::InvalidCandle { .. })));
    }

    #[test]
    fn test_batch_split_across_months() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        // 2026-01-31T20:00:00Z, pas 4h: chevauche janvier/février
        let start = 1_769_889_600_000;
        let batch = candles(start, Timeframe::H4.interval_ms(), 20);
        store()
            .upsert_batch(db.connection_mut(), "binance", "BTC/USDT", Timeframe::H4, &batch)
            .unwrap();

        let buckets: Vec<String> = db
            .connection()
            .prepare("SELECT bucket FROM candle_chunks ORDER BY bucket")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(buckets, vec!["2026-01", "2026-02"]);

        let all = ChunkStore::range(
            db.connection(),
            "binance",
            "BTC/USDT",
            Timeframe::H4,
            0,
            i64::MAX,
            1000,
            0,
        )
        .unwrap();
        assert_eq!(all.len(), 20);
        assert!(all.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[test]
    fn test_half_month_spill() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let tight = ChunkStore::new(100);
        // 2026-01-01T00:00:00Z, 150 bougies 4h couvrent tout janvier
        let start = 1_767_225_600_000;
        let batch = candles(start, Timeframe::H4.interval_ms(), 150);
        tight
            .upsert_batch(db.connection_mut(), "binance", "BTC/USDT", Timeframe::H4, &batch)
            .unwrap();

        let buckets: Vec<String> = db
            .connection()
            .prepare("SELECT bucket FROM candle_chunks ORDER BY bucket")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(buckets.iter().any(|b| b == "2026-01.1"));
        assert!(buckets.iter().any(|b| b == "2026-01.2"));
        assert!(!buckets.iter().any(|b| b == "2026-01"));

        // les lecteurs réunissent les buckets sans couture
        let all = ChunkStore::range(
            db.connection(),
            "binance",
            "BTC/USDT",
            Timeframe::H4,
            0,
            i64::MAX,
            1000,
            0,
        )
        .unwrap();
        assert_eq!(all.len(), 150);
        assert!(all.windows(2).all(|w| w[0].open_time < w[1].open_time));

        // les écritures suivantes sont routées vers les demi-mois
        let more = candles(start, Timeframe::H4.interval_ms(), 150);
        let outcome = tight
            .upsert_batch(db.connection_mut(), "binance", "BTC/USDT", Timeframe::H4, &more)
            .unwrap();
        assert_eq!(outcome.duplicates, 150);
    }

    #[test]
    fn test_tail_newest_first() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let batch = candles(T0, M5, 30);
        store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();

        let tail = ChunkStore::tail(db.connection(), "bybit", "ETH/USDT", Timeframe::M5, 5)
            .unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0].open_time, T0 + 29 * M5);
        assert!(tail.windows(2).all(|w| w[0].open_time > w[1].open_time));
    }

    #[test]
    fn test_range_pagination() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let batch = candles(T0, M5, 30);
        store()
            .upsert_batch(db.connection_mut(), "bybit", "ETH/USDT", Timeframe::M5, &batch)
            .unwrap();

        let page = ChunkStore::range(
            db.connection(),
            "bybit",
            "ETH/USDT",
            Timeframe::M5,
            T0,
            T0 + 29 * M5,
            10,
            10,
        )
        .unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].open_time, T0 + 10 * M5);
        assert_eq!(page[9].open_time, T0 + 19 * M5);
    }

    #[test]
    fn test_stats_and_retention() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        // deux mois de données 1d
        let start = 1_767_225_600_000; // 2026-01-01
        let batch = candles(start, Timeframe::D1.interval_ms(), 60);
        store()
            .upsert_batch(db.connection_mut(), "kraken", "ETH/USD", Timeframe::D1, &batch)
            .unwrap();

        let stats = ChunkStore::stats(db.connection(), "kraken", None, None).unwrap();
        assert_eq!(stats.candle_count, 60);
        assert_eq!(stats.chunk_count, 3); // janvier, février, mars
        assert_eq!(stats.first_open_time, Some(start));
        assert!(stats.estimated_size > 0);

        // la rétention supprime des chunks entiers
        let february = 1_769_904_000_000; // 2026-02-01
        let dropped = ChunkStore::delete_chunks_older_than(db.connection(), february).unwrap();
        assert_eq!(dropped, 1);

        let stats = ChunkStore::stats(db.connection(), "kraken", None, None).unwrap();
        assert_eq!(stats.chunk_count, 2);
        assert!(stats.first_open_time.unwrap() >= february);
    }
}
