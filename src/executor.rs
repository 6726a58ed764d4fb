/// Module de l'exécuteur de jobs
///
/// Pipeline d'un job revendiqué:
/// 1. pré-contrôles (connecteur actif, dépendances fraîches);
/// 2. détermination de la fenêtre de fetch depuis le curseur;
/// 3. boucle de pages (backfill) ou page unique (incrémental), chaque page
///    passant par le rate limiter puis le store, curseur avancé par page;
/// 4. repli en échelle sur DateRangeTooWide (5a → 1a → 6m → 3m → 1m);
/// 5. clôture: prochaine frontière + jitter en succès, backoff exponentiel
///    plafonné à un timeframe sur erreur transitoire, cooldown long et
///    statut error sur erreur permanente, report sec sur refus du limiter.
///
/// Toutes les étapes partagent une échéance dérivée de la durée du verrou;
/// un run interrompu ne recule jamais le curseur et les bougies déjà
/// écrites restent (idempotence par unicité d'open_time).
use crate::adapter::MarketDataSource;
use crate::alerts::{AlertBus, AlertEvent};
use crate::chunk_store::ChunkStore;
use crate::config::CollectorConfig;
use crate::connectors::{ConnectorRegistry, ConnectorStatus};
use crate::errors::{CollectError, ErrorKind, FetchError};
use crate::jobs::{DependencyStatus, Job, JobRegistry};
use crate::rate_limiter::{RateLimiter, SlotDecision};
use crate::utils;
use rand::Rng;
use rusqlite::Connection;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Échelle de repli des fenêtres historiques (ms), de la plus large à la
/// plus étroite
const DATE_RANGE_LADDER_MS: [i64; 5] = [
    5 * 365 * 86_400_000,
    365 * 86_400_000,
    182 * 86_400_000,
    91 * 86_400_000,
    30 * 86_400_000,
];

/// Issue d'un run, pour les logs et les tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success {
        pages: usize,
        inserted: usize,
        duplicates: usize,
    },
    Deferred {
        kind: ErrorKind,
        next_run_time: i64,
    },
    Failed {
        kind: ErrorKind,
        consecutive_failures: u32,
    },
}

/// Exécuteur d'un job revendiqué
pub struct JobExecutor<'a, S: MarketDataSource> {
    source: &'a S,
    limiter: &'a RateLimiter,
    alerts: &'a AlertBus,
    config: &'a CollectorConfig,
    store: ChunkStore,
}

impl<'a, S: MarketDataSource> JobExecutor<'a, S> {
    pub fn new(
        source: &'a S,
        limiter: &'a RateLimiter,
        alerts: &'a AlertBus,
        config: &'a CollectorConfig,
    ) -> Self {
        JobExecutor {
            source,
            limiter,
            alerts,
            config,
            store: ChunkStore::new(config.chunk_soft_cap),
        }
    }

    /// Exécute un job revendiqué; le verrou est relâché par l'appelant
    pub async fn execute(
        &self,
        conn: &mut Connection,
        job: &Job,
        now: i64,
    ) -> Result<RunOutcome, CollectError> {
        let tf_ms = job.timeframe.interval_ms();
        // marge sous la durée du verrou pour finir proprement
        let deadline =
            Instant::now() + Duration::from_millis((self.config.lock_duration_ms * 9 / 10) as u64);

        // 1. connecteur actif
        let connector = ConnectorRegistry::get(conn, &job.exchange_id)?;
        if connector.status == ConnectorStatus::Suspended {
            return self.defer(conn, job, now, now + tf_ms, ErrorKind::ConnectorSuspended);
        }

        // 2. dépendances fraîches
        let freshness = self.config.freshness_window_ms.unwrap_or(tf_ms);
        if let DependencyStatus::Blocked(reasons) =
            JobRegistry::dependency_status(conn, &job.id, freshness, now)?
        {
            debug!(job_id = %job.id, ?reasons, "dépendances non satisfaites");
            return self.defer(conn, job, now, now + tf_ms, ErrorKind::DependencyUnmet);
        }

        let info = match self.source.describe(&job.exchange_id) {
            Some(info) => info,
            None => {
                return self.fail_permanent(
                    conn,
                    job,
                    now,
                    ErrorKind::Permanent,
                    &format!("aucun descripteur pour {}", job.exchange_id),
                );
            }
        };
        if !info.supported_timeframes.contains(&job.timeframe) {
            return self.fail_permanent(
                conn,
                job,
                now,
                ErrorKind::TimeframeUnsupported,
                &format!("{} absent de {}", job.timeframe, job.exchange_id),
            );
        }

        // 3. fenêtre de fetch (demi-ouverte: la dernière bougie stockée
        // n'est jamais re-demandée)
        let mut since = match job.last_candle_time {
            Some(cursor) => cursor + tf_ms,
            None if job.collect_historical => {
                let anchor = now - self.historical_depth_ms(job);
                match info.earliest_hint_ms {
                    Some(hint) => anchor.max(hint),
                    None => anchor,
                }
            }
            None => now - tf_ms * info.max_candles_per_call as i64,
        };

        let historical_mode = job.collect_historical && !job.historical_complete;
        let mut ladder_idx = 0usize;
        let mut pages = 0usize;
        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        let mut deadline_hit = false;

        // 4. boucle de pages
        loop {
            if Instant::now() >= deadline {
                deadline_hit = true;
                break;
            }

            let slot = match self.limiter.wait_for_slot(conn, &job.exchange_id, deadline).await {
                Ok(decision) => decision,
                Err(CollectError::ConnectorSuspended(_)) => {
                    // suspension en cours de backfill: le travail reprend
                    // au prochain tick, le curseur a déjà la progression
                    return self.defer(conn, job, now, now + tf_ms, ErrorKind::ConnectorSuspended);
                }
                Err(e) => return Err(e),
            };
            if let SlotDecision::Denied { retry_after_ms } = slot {
                return self.defer(
                    conn,
                    job,
                    now,
                    now + retry_after_ms,
                    ErrorKind::RateLimitExceeded,
                );
            }

            let fetched = self
                .source
                .fetch_ohlcv(
                    &job.exchange_id,
                    &job.symbol,
                    job.timeframe,
                    since,
                    info.max_candles_per_call,
                    deadline,
                )
                .await;

            match fetched {
                Ok(page) => {
                    let page_len = page.len();
                    if page_len > 0 {
                        let outcome = match self.store.upsert_batch(
                            conn,
                            &job.exchange_id,
                            &job.symbol,
                            job.timeframe,
                            &page,
                        ) {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!(job_id = %job.id, erreur = %e, "écriture du store échouée");
                                return self.fail_transient(
                                    conn,
                                    job,
                                    now,
                                    ErrorKind::StoreWriteFailed,
                                    &e.to_string(),
                                );
                            }
                        };
                        inserted += outcome.inserted;
                        duplicates += outcome.duplicates;
                        pages += 1;

                        // le curseur capture la progression page par page
                        let last_time = page.last().map(|c| c.open_time).unwrap_or(since);
                        JobRegistry::advance_cursor(conn, &job.id, last_time)?;
                        since = last_time + tf_ms;
                    }

                    if !historical_mode {
                        break; // une seule page en incrémental
                    }
                    if page_len < info.max_candles_per_call {
                        // page courte ou vide: l'historique est rattrapé
                        JobRegistry::mark_historical_complete(conn, &job.id)?;
                        break;
                    }
                }
                Err(FetchError::DateRangeTooWide) => {
                    match Self::shrink_since(now, since, &mut ladder_idx) {
                        Some(narrower) => {
                            info!(job_id = %job.id, since = narrower, "fenêtre réduite après DateRangeTooWide");
                            since = narrower;
                            continue;
                        }
                        None => {
                            return self.fail_permanent(
                                conn,
                                job,
                                now,
                                ErrorKind::Permanent,
                                "plage de dates refusée à toutes les largeurs",
                            );
                        }
                    }
                }
                Err(FetchError::RateLimitExceeded { retry_after_ms }) => {
                    // abandon propre: le reste du travail reprendra au
                    // prochain run planifié
                    return self.defer(
                        conn,
                        job,
                        now,
                        now + retry_after_ms,
                        ErrorKind::RateLimitExceeded,
                    );
                }
                Err(e) => return self.handle_fetch_failure(conn, job, now, e),
            }
        }

        // 5. clôture en succès
        let next_run_time = if deadline_hit && historical_mode {
            // backfill interrompu par l'échéance: reprendre au plus tôt
            now + 1_000
        } else {
            job.timeframe.next_boundary(now) + self.jitter_ms()
        };
        JobRegistry::record_success(conn, &job.id, now, next_run_time)?;
        info!(
            job_id = %job.id,
            pages,
            inserted,
            duplicates,
            next_run = %utils::format_timestamp_ms(next_run_time),
            "run terminé"
        );

        Ok(RunOutcome::Success {
            pages,
            inserted,
            duplicates,
        })
    }

    /// Profondeur historique: surcharge de config ou défaut du timeframe
    fn historical_depth_ms(&self, job: &Job) -> i64 {
        self.config
            .historical_depth_days
            .get(job.timeframe.as_str())
            .map(|days| days * 86_400_000)
            .unwrap_or_else(|| job.timeframe.default_historical_depth_ms())
    }

    /// Première marche de l'échelle strictement plus étroite que `since`
    fn shrink_since(now: i64, since: i64, ladder_idx: &mut usize) -> Option<i64> {
        while *ladder_idx < DATE_RANGE_LADDER_MS.len() {
            let candidate = now - DATE_RANGE_LADDER_MS[*ladder_idx];
            *ladder_idx += 1;
            if candidate > since {
                return Some(candidate);
            }
        }
        None
    }

    fn jitter_ms(&self) -> i64 {
        let amplitude = self.config.scheduling_jitter_ms.max(0);
        rand::thread_rng().gen_range(0..=amplitude)
    }

    /// Report sans échec compté (limiter, dépendance, suspension)
    fn defer(
        &self,
        conn: &Connection,
        job: &Job,
        now: i64,
        next_run_time: i64,
        kind: ErrorKind,
    ) -> Result<RunOutcome, CollectError> {
        JobRegistry::defer(conn, &job.id, now, next_run_time)?;
        debug!(job_id = %job.id, kind = kind.as_str(), next_run = %utils::format_timestamp_ms(next_run_time), "run reporté");
        Ok(RunOutcome::Deferred {
            kind,
            next_run_time,
        })
    }

    /// Erreur transitoire (ou inconnue): backoff exponentiel plafonné à un
    /// timeframe, alerte au franchissement du seuil
    fn fail_transient(
        &self,
        conn: &Connection,
        job: &Job,
        now: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<RunOutcome, CollectError> {
        let provisional = JobRegistry::get(conn, &job.id)?.consecutive_failures + 1;
        let backoff = self
            .config
            .backoff_base_ms
            .saturating_mul(1_i64 << (provisional - 1).min(20))
            .saturating_add(self.jitter_ms())
            .min(job.timeframe.interval_ms());
        let next_run_time = now + backoff;

        let failures = JobRegistry::record_failure(
            conn,
            &job.id,
            now,
            next_run_time,
            kind,
            message,
            true,
            false,
        )?;
        warn!(job_id = %job.id, kind = kind.as_str(), failures, message, "échec transitoire");

        if failures >= self.config.failure_alert_threshold {
            self.alerts.emit(AlertEvent::ConsecutiveFailures {
                job_id: job.id.clone(),
                count: failures,
            });
        }

        Ok(RunOutcome::Failed {
            kind,
            consecutive_failures: failures,
        })
    }

    /// Erreur permanente: statut error, long cooldown, alerte
    fn fail_permanent(
        &self,
        conn: &Connection,
        job: &Job,
        now: i64,
        kind: ErrorKind,
        message: &str,
    ) -> Result<RunOutcome, CollectError> {
        let next_run_time = now + self.config.permanent_cooldown_ms;
        let failures = JobRegistry::record_failure(
            conn,
            &job.id,
            now,
            next_run_time,
            kind,
            message,
            false,
            true,
        )?;
        error!(job_id = %job.id, kind = kind.as_str(), message, "erreur permanente");
        self.alerts.emit(AlertEvent::PermanentError {
            job_id: job.id.clone(),
            message: message.to_string(),
        });

        Ok(RunOutcome::Failed {
            kind,
            consecutive_failures: failures,
        })
    }

    fn handle_fetch_failure(
        &self,
        conn: &Connection,
        job: &Job,
        now: i64,
        error: FetchError,
    ) -> Result<RunOutcome, CollectError> {
        let message = error.to_string();
        match error.kind() {
            ErrorKind::SymbolNotListed | ErrorKind::TimeframeUnsupported | ErrorKind::Permanent => {
                self.fail_permanent(conn, job, now, error.kind(), &message)
            }
            // Unknown est traité comme transitoire
            _ => self.fail_transient(conn, job, now, error.kind(), &message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ExchangeInfo;
    use crate::candle::Candle;
    use crate::chunk_store::ChunkStore;
    use crate::connectors::{ConnectorRegistry, RateLimitSpec};
    use crate::database::DatabaseManager;
    use crate::jobs::{JobRegistry, JobStatus, NewJob};
    use crate::rate_limiter::RateLimiter;
    use crate::timeframe::Timeframe;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;

    const T: i64 = 1_768_893_600_000; // 2026-01-20T07:20:00Z
    const M5: i64 = 300_000;
    const H1: i64 = 3_600_000;

    /// Source scriptée: rejoue des pages préparées et enregistre les
    /// `since` demandés
    struct ScriptedSource {
        info: ExchangeInfo,
        pages: Mutex<VecDeque<Result<Vec<Candle>, FetchError>>>,
        observed_since: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn new(exchange_id: &str, max_candles_per_call: usize) -> Self {
            ScriptedSource {
                info: ExchangeInfo {
                    exchange_id: exchange_id.to_string(),
                    display_name: exchange_id.to_string(),
                    supported_timeframes: Timeframe::all().to_vec(),
                    ohlcv_supported: true,
                    max_candles_per_call,
                    default_rate_limit: RateLimitSpec {
                        limit: 20,
                        period_ms: 1_000,
                        min_delay_ms: 0,
                    },
                    earliest_hint_ms: None,
                },
                pages: Mutex::new(VecDeque::new()),
                observed_since: Mutex::new(Vec::new()),
            }
        }

        fn push_page(&self, page: Result<Vec<Candle>, FetchError>) {
            self.pages.lock().unwrap().push_back(page);
        }

        fn observed(&self) -> Vec<i64> {
            self.observed_since.lock().unwrap().clone()
        }
    }

    impl MarketDataSource for ScriptedSource {
        fn describe(&self, exchange_id: &str) -> Option<ExchangeInfo> {
            if exchange_id == self.info.exchange_id {
                Some(self.info.clone())
            } else {
                None
            }
        }

        fn fetch_ohlcv(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
            since: i64,
            _limit: usize,
            _deadline: Instant,
        ) -> impl Future<Output = Result<Vec<Candle>, FetchError>> + Send {
            self.observed_since.lock().unwrap().push(since);
            let next = self.pages.lock().unwrap().pop_front();
            async move { next.unwrap_or_else(|| Ok(Vec::new())) }
        }
    }

    fn candles(start: i64, step_ms: i64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle::new(start + i as i64 * step_ms, 100.0, 101.0, 99.0, 100.5, 10.0))
            .collect()
    }

    struct Harness {
        db: DatabaseManager,
        source: ScriptedSource,
        limiter: RateLimiter,
        alerts: AlertBus,
        config: CollectorConfig,
    }

    impl Harness {
        fn new(limit: i64) -> Self {
            let db = DatabaseManager::open_in_memory().unwrap();
            ConnectorRegistry::register_or_update(
                db.connection(),
                "bybit",
                "Bybit",
                RateLimitSpec {
                    limit,
                    period_ms: 10_000,
                    min_delay_ms: 0,
                },
            )
            .unwrap();
            // ancre la fenêtre de budget sur l'horloge réelle du test
            db.connection()
                .execute(
                    "UPDATE connectors SET rate_limit_window_start = ?1",
                    rusqlite::params![utils::now_ms()],
                )
                .unwrap();

            let alerts = AlertBus::new(64);
            let limiter = RateLimiter::new(alerts.clone(), 0.9, 60_000);
            let mut config = CollectorConfig::default();
            config.backoff_base_ms = 1_000;
            config.scheduling_jitter_ms = 2_000;
            Harness {
                db,
                source: ScriptedSource::new("bybit", 1_000),
                limiter,
                alerts,
                config,
            }
        }

        fn job(&self, symbol: &str, timeframe: Timeframe, historical: bool) -> Job {
            JobRegistry::create(
                self.db.connection(),
                &NewJob {
                    exchange_id: "bybit".to_string(),
                    symbol: symbol.to_string(),
                    timeframe,
                    collect_historical: historical,
                },
            )
            .unwrap()
        }

        async fn run(&mut self, job_id: &str, now: i64) -> RunOutcome {
            let job = JobRegistry::get(self.db.connection(), job_id).unwrap();
            let executor =
                JobExecutor::new(&self.source, &self.limiter, &self.alerts, &self.config);
            executor
                .execute(self.db.connection_mut(), &job, now)
                .await
                .unwrap()
        }

        fn connector_usage(&self) -> i64 {
            ConnectorRegistry::get(self.db.connection(), "bybit")
                .unwrap()
                .usage
        }
    }

    #[tokio::test]
    async fn test_scenario_cold_start_incremental() {
        let mut harness = Harness::new(20);
        let job = harness.job("ETH/USDT", Timeframe::M5, false);

        // 80 bougies de 00:40 à 07:15 le 2026-01-20
        let first_open = T - 24_000_000; // 00:40
        harness.source.push_page(Ok(candles(first_open, M5, 80)));

        let outcome = harness.run(&job.id, T).await;
        assert_eq!(
            outcome,
            RunOutcome::Success {
                pages: 1,
                inserted: 80,
                duplicates: 0
            }
        );

        // un seul chunk 2026-01
        let chunks: i64 = harness
            .db
            .connection()
            .query_row("SELECT COUNT(*) FROM candle_chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(chunks, 1);
        let bucket: String = harness
            .db
            .connection()
            .query_row("SELECT bucket FROM candle_chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bucket, "2026-01");

        // curseur à 07:15, prochaine exécution à 07:25 ± jitter
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.last_candle_time, Some(first_open + 79 * M5));
        assert_eq!(loaded.last_candle_time, Some(T - M5));
        assert!(loaded.next_run_time >= T + M5);
        assert!(loaded.next_run_time <= T + M5 + harness.config.scheduling_jitter_ms);
        assert_eq!(loaded.consecutive_failures, 0);

        // une seule acquisition du limiter
        assert_eq!(harness.connector_usage(), 1);

        // la fenêtre demandée couvrait une page avant maintenant
        assert_eq!(harness.source.observed(), vec![T - M5 * 1_000]);
    }

    #[tokio::test]
    async fn test_scenario_historical_backfill_pagination() {
        let mut harness = Harness::new(20);
        let job = harness.job("BTC/USDT", Timeframe::H1, true);

        let t0 = Timeframe::H1.align_floor(T - 180 * 86_400_000);
        harness.source.push_page(Ok(candles(t0, H1, 1_000)));
        harness.source.push_page(Ok(candles(t0 + 1_000 * H1, H1, 1_000)));
        harness.source.push_page(Ok(candles(t0 + 2_000 * H1, H1, 999)));

        let outcome = harness.run(&job.id, T).await;
        assert_eq!(
            outcome,
            RunOutcome::Success {
                pages: 3,
                inserted: 2_999,
                duplicates: 0
            }
        );

        // 2999 bougies réparties sur les mois couverts
        let stats = ChunkStore::stats(harness.db.connection(), "bybit", None, None).unwrap();
        assert_eq!(stats.candle_count, 2_999);
        assert!(stats.chunk_count >= 4);

        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.last_candle_time, Some(t0 + 2_998 * H1));
        assert!(loaded.historical_complete);

        // trois acquisitions du limiter
        assert_eq!(harness.connector_usage(), 3);
    }

    #[tokio::test]
    async fn test_scenario_rate_limit_mid_backfill() {
        // budget de 2 requêtes: le refus tombe avant la troisième page
        let mut harness = Harness::new(2);
        let job = harness.job("BTC/USDT", Timeframe::H1, true);

        let t0 = Timeframe::H1.align_floor(T - 180 * 86_400_000);
        harness.source.push_page(Ok(candles(t0, H1, 1_000)));
        harness.source.push_page(Ok(candles(t0 + 1_000 * H1, H1, 1_000)));

        let now = utils::now_ms();
        let outcome = harness.run(&job.id, now).await;
        let next_run_time = match outcome {
            RunOutcome::Deferred {
                kind: ErrorKind::RateLimitExceeded,
                next_run_time,
            } => next_run_time,
            other => panic!("attendu Deferred(RateLimitExceeded), obtenu {:?}", other),
        };
        assert!(next_run_time > now);
        assert!(next_run_time <= now + 10_000);

        // 2000 bougies écrites, curseur en fin de deuxième page, aucun
        // échec compté
        let stats = ChunkStore::stats(harness.db.connection(), "bybit", None, None).unwrap();
        assert_eq!(stats.candle_count, 2_000);
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.last_candle_time, Some(t0 + 1_999 * H1));
        assert_eq!(loaded.consecutive_failures, 0);
        assert!(!loaded.historical_complete);

        // au tick suivant (fenêtre de budget expirée), la troisième page part
        harness
            .db
            .connection()
            .execute(
                "UPDATE connectors SET rate_limit_window_start = ?1",
                rusqlite::params![utils::now_ms() - 10_000],
            )
            .unwrap();
        harness.source.push_page(Ok(candles(t0 + 2_000 * H1, H1, 999)));
        let outcome = harness.run(&job.id, utils::now_ms()).await;
        assert_eq!(
            outcome,
            RunOutcome::Success {
                pages: 1,
                inserted: 999,
                duplicates: 0
            }
        );
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert!(loaded.historical_complete);
        assert_eq!(loaded.last_candle_time, Some(t0 + 2_998 * H1));
    }

    #[tokio::test]
    async fn test_scenario_date_range_ladder() {
        let mut harness = Harness::new(20);
        // profondeur 5 ans pour que l'échelle ait une marche plus étroite
        harness
            .config
            .historical_depth_days
            .insert("1h".to_string(), 5 * 365);
        let job = harness.job("BTC/USDT", Timeframe::H1, true);

        harness.source.push_page(Err(FetchError::DateRangeTooWide));
        let one_year_ago = T - 365 * 86_400_000;
        harness
            .source
            .push_page(Ok(candles(Timeframe::H1.align_floor(one_year_ago) + H1, H1, 500)));

        let outcome = harness.run(&job.id, T).await;
        assert!(matches!(outcome, RunOutcome::Success { pages: 1, .. }));

        // la deuxième requête partait d'un an en arrière
        let observed = harness.source.observed();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0], T - 5 * 365 * 86_400_000);
        assert_eq!(observed[1], one_year_ago);

        // aucun échec compté, job toujours actif
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.consecutive_failures, 0);
        assert_eq!(loaded.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_ladder_exhausted_is_permanent() {
        let mut harness = Harness::new(20);
        harness
            .config
            .historical_depth_days
            .insert("1h".to_string(), 10 * 365);
        let job = harness.job("BTC/USDT", Timeframe::H1, true);

        for _ in 0..6 {
            harness.source.push_page(Err(FetchError::DateRangeTooWide));
        }

        let outcome = harness.run(&job.id, T).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: ErrorKind::Permanent,
                ..
            }
        ));
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Error);
        assert!(loaded.next_run_time >= T + harness.config.permanent_cooldown_ms);
    }

    #[tokio::test]
    async fn test_scenario_transient_backoff_and_alert() {
        let mut harness = Harness::new(100);
        let job = harness.job("ETH/USDT", Timeframe::M5, false);
        let mut alert_rx = harness.alerts.subscribe();

        for attempt in 1..=3u32 {
            harness
                .source
                .push_page(Err(FetchError::Transient("connexion coupée".to_string())));
            let now = utils::now_ms();
            let outcome = harness.run(&job.id, now).await;
            assert_eq!(
                outcome,
                RunOutcome::Failed {
                    kind: ErrorKind::Transient,
                    consecutive_failures: attempt
                }
            );

            // backoff ≥ base·2^(k−1), plafonné à un timeframe
            let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
            let min_backoff = harness.config.backoff_base_ms * (1 << (attempt - 1));
            assert!(loaded.next_run_time >= now + min_backoff.min(M5));
            assert!(loaded.next_run_time <= now + M5);
        }

        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.consecutive_failures, 3);
        assert_eq!(loaded.last_error_kind.as_deref(), Some("transient"));

        // alerte émise au franchissement du seuil (3)
        let mut threshold_alert = None;
        while let Ok(event) = alert_rx.try_recv() {
            if let AlertEvent::ConsecutiveFailures { count, .. } = event {
                threshold_alert = Some(count);
            }
        }
        assert_eq!(threshold_alert, Some(3));
    }

    #[tokio::test]
    async fn test_scenario_dependency_gating() {
        let mut harness = Harness::new(20);
        let a = harness.job("AAA/USDT", Timeframe::H1, false);
        let b = harness.job("BBB/USDT", Timeframe::H1, false);
        JobRegistry::set_dependencies(harness.db.connection_mut(), &a.id, &[b.id.clone()])
            .unwrap();

        // dernier succès de B vieux de 2 h, fenêtre = un timeframe (1 h)
        let now = utils::now_ms();
        harness
            .db
            .connection()
            .execute(
                "UPDATE jobs SET last_success_time = ?2 WHERE id = ?1",
                rusqlite::params![b.id, now - 7_200_000],
            )
            .unwrap();

        let outcome = harness.run(&a.id, now).await;
        assert_eq!(
            outcome,
            RunOutcome::Deferred {
                kind: ErrorKind::DependencyUnmet,
                next_run_time: now + H1
            }
        );
        let loaded = JobRegistry::get(harness.db.connection(), &a.id).unwrap();
        assert_eq!(loaded.consecutive_failures, 0);
        assert_eq!(loaded.next_run_time, now + H1);
        // A n'a émis aucune requête
        assert!(harness.source.observed().is_empty());

        // B s'exécute normalement de son côté
        harness
            .source
            .push_page(Ok(candles(Timeframe::H1.align_floor(now) - 10 * H1, H1, 10)));
        let outcome = harness.run(&b.id, now).await;
        assert!(matches!(outcome, RunOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_suspended_connector_deferred() {
        let mut harness = Harness::new(20);
        let job = harness.job("ETH/USDT", Timeframe::M5, false);
        ConnectorRegistry::suspend(harness.db.connection(), "bybit").unwrap();

        let now = utils::now_ms();
        let outcome = harness.run(&job.id, now).await;
        assert_eq!(
            outcome,
            RunOutcome::Deferred {
                kind: ErrorKind::ConnectorSuspended,
                next_run_time: now + M5
            }
        );
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_on_symbol() {
        let mut harness = Harness::new(20);
        let job = harness.job("GHOST/USDT", Timeframe::M5, false);
        let mut alert_rx = harness.alerts.subscribe();

        harness
            .source
            .push_page(Err(FetchError::SymbolNotListed("GHOSTUSDT".to_string())));
        let now = utils::now_ms();
        let outcome = harness.run(&job.id, now).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: ErrorKind::SymbolNotListed,
                ..
            }
        ));

        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Error);
        assert_eq!(loaded.last_error_kind.as_deref(), Some("symbol_not_listed"));
        assert!(matches!(
            alert_rx.try_recv(),
            Ok(AlertEvent::PermanentError { .. })
        ));
    }

    #[tokio::test]
    async fn test_incremental_resumes_after_cursor() {
        // la fenêtre est demi-ouverte: on repart du curseur + un timeframe
        let mut harness = Harness::new(20);
        let job = harness.job("ETH/USDT", Timeframe::M5, false);

        harness.source.push_page(Ok(candles(T - 10 * M5, M5, 10)));
        harness.run(&job.id, T).await;
        assert_eq!(
            JobRegistry::get(harness.db.connection(), &job.id)
                .unwrap()
                .last_candle_time,
            Some(T - M5)
        );

        harness.source.push_page(Ok(candles(T, M5, 3)));
        let outcome = harness.run(&job.id, T + 3 * M5).await;
        assert!(matches!(outcome, RunOutcome::Success { .. }));

        let observed = harness.source.observed();
        assert_eq!(observed[1], T); // curseur (T − 5m) + 5m

        // le curseur n'a fait qu'avancer
        assert_eq!(
            JobRegistry::get(harness.db.connection(), &job.id)
                .unwrap()
                .last_candle_time,
            Some(T + 2 * M5)
        );
    }

    #[tokio::test]
    async fn test_store_failure_counts_as_transient() {
        let mut harness = Harness::new(20);
        let job = harness.job("ETH/USDT", Timeframe::M5, false);

        // bougie incohérente (high < low): l'écriture est refusée
        let mut bad = candles(T - 10 * M5, M5, 1);
        bad[0].high = 1.0;
        bad[0].low = 50.0;
        harness.source.push_page(Ok(bad));

        let now = utils::now_ms();
        let outcome = harness.run(&job.id, now).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                kind: ErrorKind::StoreWriteFailed,
                consecutive_failures: 1
            }
        );
        let loaded = JobRegistry::get(harness.db.connection(), &job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Active); // transitoire, pas error
    }
}
