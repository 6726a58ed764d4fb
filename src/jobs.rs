/// Module du registre des jobs de collecte
///
/// ARCHITECTURE:
/// Un job par (exchange, symbol, timeframe), persisté avec son curseur,
/// sa prochaine échéance, ses compteurs d'échec et son verrou. La
/// revendication (`claim_next_due`) est un UPDATE conditionnel sur
/// (locked_until, locked_by): au plus un exécuteur par job, quel que soit
/// le nombre de processus. Les dépendances forment un DAG contrôlé par BFS
/// avant chaque ajout d'arête.
use crate::errors::{CollectError, ErrorKind};
use crate::timeframe::Timeframe;
use crate::utils;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

/// Statut d'un job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Error => "error",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "paused" => JobStatus::Paused,
            "error" => JobStatus::Error,
            _ => JobStatus::Active,
        }
    }
}

/// Job de collecte persisté
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: JobStatus,
    pub schedule_mode: String,
    pub collect_historical: bool,
    pub last_candle_time: Option<i64>,
    pub historical_complete: bool,
    pub next_run_time: i64,
    pub last_run_time: Option<i64>,
    pub last_success_time: Option<i64>,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<i64>,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub locked_until: Option<i64>,
    pub locked_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Paramètres de création d'un job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub collect_historical: bool,
}

/// Filtre de listing
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub exchange_id: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
}

/// Résultat du contrôle de dépendances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Ready,
    Blocked(Vec<String>),
}

const SELECT_COLUMNS: &str = "id, exchange_id, symbol, timeframe, status, schedule_mode,
     collect_historical, last_candle_time, historical_complete, next_run_time,
     last_run_time, last_success_time, consecutive_failures, last_failure_time,
     last_error_kind, last_error_message, locked_until, locked_by,
     created_at, updated_at";

/// Registre des jobs
pub struct JobRegistry;

impl JobRegistry {
    /// Identifiant stable d'un job
    pub fn job_id(exchange_id: &str, symbol: &str, timeframe: Timeframe) -> String {
        format!("{}:{}:{}", exchange_id, symbol, timeframe)
    }

    /// Crée un job, immédiatement éligible
    pub fn create(conn: &Connection, new_job: &NewJob) -> Result<Job, CollectError> {
        let now = utils::now_ms();
        let id = Self::job_id(&new_job.exchange_id, &new_job.symbol, new_job.timeframe);

        // l'exchange doit être enregistré avant ses jobs
        let connector_exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connectors WHERE exchange_id = ?1",
            params![new_job.exchange_id],
            |row| row.get(0),
        )?;
        if connector_exists == 0 {
            return Err(CollectError::ExchangeUnknown(new_job.exchange_id.clone()));
        }

        conn.execute(
            "INSERT INTO jobs
                 (id, exchange_id, symbol, timeframe, status, schedule_mode,
                  collect_historical, next_run_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', 'timeframe', ?5, ?6, ?6, ?6)",
            params![
                id,
                new_job.exchange_id,
                new_job.symbol,
                new_job.timeframe.as_str(),
                new_job.collect_historical as i64,
                now
            ],
        )?;

        Self::get(conn, &id)
    }

    pub fn get(conn: &Connection, job_id: &str) -> Result<Job, CollectError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", SELECT_COLUMNS),
            params![job_id],
            Self::map_row,
        )
        .optional()?
        .ok_or_else(|| CollectError::JobUnknown(job_id.to_string()))
    }

    pub fn list(conn: &Connection, filter: &JobFilter) -> Result<Vec<Job>, CollectError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR exchange_id = ?2)
               AND (?3 IS NULL OR symbol = ?3)
               AND (?4 IS NULL OR timeframe = ?4)
             ORDER BY id",
            SELECT_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.exchange_id.as_deref(),
                    filter.symbol.as_deref(),
                    filter.timeframe.map(|t| t.as_str()),
                ],
                Self::map_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// File d'attente: jobs triés par prochaine échéance
    pub fn queue(conn: &Connection, limit: usize) -> Result<Vec<Job>, CollectError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = 'active'
             ORDER BY next_run_time ASC, consecutive_failures ASC, id ASC
             LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Revendique le prochain job dû (compare-and-set sur le verrou)
    ///
    /// Sélection: status=active, next_run_time ≤ now, verrou libre ou
    /// expiré; tri par échéance, puis échecs consécutifs, puis id.
    /// Un seul UPDATE conditionnel: le candidat est choisi par la
    /// sous-requête et verrouillé dans le même statement, donc de façon
    /// atomique vis-à-vis des autres workers et processus.
    /// RETOUR: le job verrouillé pour `worker_id`, ou None.
    pub fn claim_next_due(
        conn: &Connection,
        now: i64,
        worker_id: &str,
        lock_duration_ms: i64,
    ) -> Result<Option<Job>, CollectError> {
        let claimed: Option<String> = conn
            .query_row(
                "UPDATE jobs
                 SET locked_until = ?2, locked_by = ?3, updated_at = ?1
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE status = 'active' AND next_run_time <= ?1
                       AND (locked_until IS NULL OR locked_until < ?1)
                     ORDER BY next_run_time ASC, consecutive_failures ASC, id ASC
                     LIMIT 1
                 )
                 RETURNING id",
                params![now, now + lock_duration_ms, worker_id],
                |row| row.get(0),
            )
            .optional()?;

        match claimed {
            Some(job_id) => Ok(Some(Self::get(conn, &job_id)?)),
            None => Ok(None),
        }
    }

    /// Relâche le verrou si ce worker le détient encore
    pub fn release_lock(
        conn: &Connection,
        job_id: &str,
        worker_id: &str,
    ) -> Result<(), CollectError> {
        conn.execute(
            "UPDATE jobs SET locked_until = NULL, locked_by = NULL, updated_at = ?3
             WHERE id = ?1 AND locked_by = ?2",
            params![job_id, worker_id, utils::now_ms()],
        )?;
        Ok(())
    }

    /// Contrôle de fraîcheur des dépendances
    ///
    /// Une dépendance est satisfaite quand son last_success_time date de
    /// moins de `freshness_window_ms`; un job dépendant en erreur bloque.
    pub fn dependency_status(
        conn: &Connection,
        job_id: &str,
        freshness_window_ms: i64,
        now: i64,
    ) -> Result<DependencyStatus, CollectError> {
        let mut reasons = Vec::new();
        for dep_id in Self::list_dependencies(conn, job_id)? {
            let dep = Self::get(conn, &dep_id)?;
            if dep.status == JobStatus::Error {
                reasons.push(format!("{} en erreur", dep_id));
                continue;
            }
            match dep.last_success_time {
                Some(t) if now - t <= freshness_window_ms => {}
                Some(t) => reasons.push(format!(
                    "{} en retard (dernier succès {})",
                    dep_id,
                    utils::format_timestamp_ms(t)
                )),
                None => reasons.push(format!("{} jamais exécuté", dep_id)),
            }
        }

        if reasons.is_empty() {
            Ok(DependencyStatus::Ready)
        } else {
            Ok(DependencyStatus::Blocked(reasons))
        }
    }

    /// Remplace l'ensemble des dépendances d'un job
    ///
    /// INVARIANT: le graphe reste acyclique; contrôle BFS avant écriture.
    pub fn set_dependencies(
        conn: &mut Connection,
        job_id: &str,
        depends_on: &[String],
    ) -> Result<(), CollectError> {
        Self::get(conn, job_id)?;
        for dep_id in depends_on {
            if dep_id == job_id {
                return Err(CollectError::DependencyCycle(job_id.to_string()));
            }
            Self::get(conn, dep_id)?;
            // cycle si job_id est atteignable depuis dep_id
            if Self::reaches(conn, dep_id, job_id, Some(job_id), depends_on)? {
                return Err(CollectError::DependencyCycle(dep_id.to_string()));
            }
        }

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM job_dependencies WHERE job_id = ?1",
            params![job_id],
        )?;
        for dep_id in depends_on {
            tx.execute(
                "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                params![job_id, dep_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// BFS sur les arêtes depends_on depuis `from`, à la recherche de `target`
    ///
    /// `pending_edges` superpose les arêtes en cours d'ajout pour que le
    /// contrôle couvre l'état final du graphe.
    fn reaches(
        conn: &Connection,
        from: &str,
        target: &str,
        pending_source: Option<&str>,
        pending_edges: &[String],
    ) -> Result<bool, CollectError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<String> = VecDeque::new();
        frontier.push_back(from.to_string());

        while let Some(node) = frontier.pop_front() {
            if node == target {
                return Ok(true);
            }
            if !visited.insert(node.clone()) {
                continue;
            }

            let mut stmt =
                conn.prepare("SELECT depends_on FROM job_dependencies WHERE job_id = ?1")?;
            let next: Vec<String> = stmt
                .query_map(params![node], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            frontier.extend(next);

            if pending_source == Some(node.as_str()) {
                frontier.extend(pending_edges.iter().cloned());
            }
        }

        Ok(false)
    }

    pub fn list_dependencies(conn: &Connection, job_id: &str) -> Result<Vec<String>, CollectError> {
        let mut stmt = conn.prepare(
            "SELECT depends_on FROM job_dependencies WHERE job_id = ?1 ORDER BY depends_on",
        )?;
        let deps = stmt
            .query_map(params![job_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(deps)
    }

    /// Jobs qui dépendent de celui-ci
    pub fn find_depending_on(
        conn: &Connection,
        job_id: &str,
    ) -> Result<Vec<String>, CollectError> {
        let mut stmt = conn
            .prepare("SELECT job_id FROM job_dependencies WHERE depends_on = ?1 ORDER BY job_id")?;
        let dependents = stmt
            .query_map(params![job_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dependents)
    }

    pub fn set_status(
        conn: &Connection,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), CollectError> {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, status.as_str(), utils::now_ms()],
        )?;
        if changed == 0 {
            return Err(CollectError::JobUnknown(job_id.to_string()));
        }
        Ok(())
    }

    pub fn set_collect_historical(
        conn: &Connection,
        job_id: &str,
        collect_historical: bool,
    ) -> Result<(), CollectError> {
        let changed = conn.execute(
            "UPDATE jobs SET collect_historical = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, collect_historical as i64, utils::now_ms()],
        )?;
        if changed == 0 {
            return Err(CollectError::JobUnknown(job_id.to_string()));
        }
        Ok(())
    }

    /// Suppression, refusée tant qu'un autre job en dépend
    pub fn delete(conn: &mut Connection, job_id: &str) -> Result<(), CollectError> {
        let dependents = Self::find_depending_on(conn, job_id)?;
        if !dependents.is_empty() {
            return Err(CollectError::JobStillReferenced(dependents.join(", ")));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM job_dependencies WHERE job_id = ?1",
            params![job_id],
        )?;
        let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(CollectError::JobUnknown(job_id.to_string()));
        }
        Ok(())
    }

    /// Rend le job immédiatement dû (le verrou et le limiter s'appliquent
    /// normalement)
    pub fn execute_now(conn: &Connection, job_id: &str, now: i64) -> Result<(), CollectError> {
        let changed = conn.execute(
            "UPDATE jobs SET next_run_time = ?2, updated_at = ?2 WHERE id = ?1",
            params![job_id, now],
        )?;
        if changed == 0 {
            return Err(CollectError::JobUnknown(job_id.to_string()));
        }
        Ok(())
    }

    /// Avance le curseur après l'écriture d'une page
    ///
    /// INVARIANT: le curseur ne recule jamais, même sur re-fetch.
    pub fn advance_cursor(
        conn: &Connection,
        job_id: &str,
        candle_time: i64,
    ) -> Result<(), CollectError> {
        conn.execute(
            "UPDATE jobs
             SET last_candle_time = COALESCE(MAX(last_candle_time, ?2), last_candle_time, ?2),
                 updated_at = ?3
             WHERE id = ?1",
            params![job_id, candle_time, utils::now_ms()],
        )?;
        Ok(())
    }

    pub fn mark_historical_complete(conn: &Connection, job_id: &str) -> Result<(), CollectError> {
        conn.execute(
            "UPDATE jobs SET historical_complete = 1, updated_at = ?2 WHERE id = ?1",
            params![job_id, utils::now_ms()],
        )?;
        Ok(())
    }

    /// Clôture un run réussi: compteurs remis à zéro, prochaine échéance
    pub fn record_success(
        conn: &Connection,
        job_id: &str,
        now: i64,
        next_run_time: i64,
    ) -> Result<(), CollectError> {
        conn.execute(
            "UPDATE jobs
             SET last_run_time = ?2, last_success_time = ?2,
                 consecutive_failures = 0, last_error_kind = NULL,
                 last_error_message = NULL, next_run_time = ?3, updated_at = ?2
             WHERE id = ?1",
            params![job_id, now, next_run_time],
        )?;
        Ok(())
    }

    /// Clôture un run échoué
    ///
    /// `count_failure` incrémente les échecs consécutifs (erreurs
    /// transitoires); `to_error` bascule le job en statut error (erreurs
    /// permanentes). RETOUR: le nombre d'échecs consécutifs après mise à jour.
    pub fn record_failure(
        conn: &Connection,
        job_id: &str,
        now: i64,
        next_run_time: i64,
        kind: ErrorKind,
        message: &str,
        count_failure: bool,
        to_error: bool,
    ) -> Result<u32, CollectError> {
        conn.execute(
            "UPDATE jobs
             SET last_run_time = ?2, last_failure_time = ?2,
                 consecutive_failures = consecutive_failures + ?3,
                 last_error_kind = ?4, last_error_message = ?5,
                 status = CASE WHEN ?6 THEN 'error' ELSE status END,
                 next_run_time = ?7, updated_at = ?2
             WHERE id = ?1",
            params![
                job_id,
                now,
                count_failure as i64,
                kind.as_str(),
                message,
                to_error,
                next_run_time
            ],
        )?;

        let failures: u32 = conn.query_row(
            "SELECT consecutive_failures FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(failures)
    }

    /// Reporte l'échéance sans compter d'échec (dépendance, suspension,
    /// refus du limiter)
    pub fn defer(
        conn: &Connection,
        job_id: &str,
        now: i64,
        next_run_time: i64,
    ) -> Result<(), CollectError> {
        conn.execute(
            "UPDATE jobs SET last_run_time = ?2, next_run_time = ?3, updated_at = ?2
             WHERE id = ?1",
            params![job_id, now, next_run_time],
        )?;
        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Job> {
        let timeframe: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(Job {
            id: row.get(0)?,
            exchange_id: row.get(1)?,
            symbol: row.get(2)?,
            timeframe: Timeframe::from_str(&timeframe).unwrap_or(Timeframe::H1),
            status: JobStatus::from_db(&status),
            schedule_mode: row.get(5)?,
            collect_historical: row.get::<_, i64>(6)? != 0,
            last_candle_time: row.get(7)?,
            historical_complete: row.get::<_, i64>(8)? != 0,
            next_run_time: row.get(9)?,
            last_run_time: row.get(10)?,
            last_success_time: row.get(11)?,
            consecutive_failures: row.get(12)?,
            last_failure_time: row.get(13)?,
            last_error_kind: row.get(14)?,
            last_error_message: row.get(15)?,
            locked_until: row.get(16)?,
            locked_by: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ConnectorRegistry, RateLimitSpec};
    use crate::database::DatabaseManager;

    fn setup() -> DatabaseManager {
        let db = DatabaseManager::open_in_memory().unwrap();
        ConnectorRegistry::register_or_update(
            db.connection(),
            "bybit",
            "Bybit",
            RateLimitSpec {
                limit: 20,
                period_ms: 1_000,
                min_delay_ms: 50,
            },
        )
        .unwrap();
        db
    }

    fn new_job(symbol: &str, timeframe: Timeframe) -> NewJob {
        NewJob {
            exchange_id: "bybit".to_string(),
            symbol: symbol.to_string(),
            timeframe,
            collect_historical: false,
        }
    }

    #[test]
    fn test_create_and_uniqueness() {
        let db = setup();
        let conn = db.connection();

        let job = JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::M5)).unwrap();
        assert_eq!(job.id, "bybit:ETH/USDT:5m");
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.last_candle_time.is_none());

        // le triple (exchange, symbol, timeframe) est unique
        assert!(JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::M5)).is_err());
        // un connecteur inconnu est refusé
        let orphan = NewJob {
            exchange_id: "ghost".to_string(),
            ..new_job("BTC/USDT", Timeframe::M5)
        };
        assert!(matches!(
            JobRegistry::create(conn, &orphan),
            Err(CollectError::ExchangeUnknown(_))
        ));
    }

    #[test]
    fn test_claim_ordering_and_lock() {
        let db = setup();
        let conn = db.connection();
        let early = JobRegistry::create(conn, &new_job("AAA/USDT", Timeframe::M5)).unwrap();
        let late = JobRegistry::create(conn, &new_job("BBB/USDT", Timeframe::M5)).unwrap();

        let now = utils::now_ms();
        conn.execute(
            "UPDATE jobs SET next_run_time = ?2 WHERE id = ?1",
            params![early.id, now - 10_000],
        )
        .unwrap();
        conn.execute(
            "UPDATE jobs SET next_run_time = ?2 WHERE id = ?1",
            params![late.id, now - 5_000],
        )
        .unwrap();

        // la plus ancienne échéance d'abord
        let first = JobRegistry::claim_next_due(conn, now, "w1", 300_000)
            .unwrap()
            .unwrap();
        assert_eq!(first.id, early.id);
        assert_eq!(first.locked_by.as_deref(), Some("w1"));

        // le job verrouillé n'est pas revendicable
        let second = JobRegistry::claim_next_due(conn, now, "w2", 300_000)
            .unwrap()
            .unwrap();
        assert_eq!(second.id, late.id);
        assert!(JobRegistry::claim_next_due(conn, now, "w3", 300_000)
            .unwrap()
            .is_none());

        // après libération, le job redevient revendicable
        JobRegistry::release_lock(conn, &first.id, "w1").unwrap();
        let reclaimed = JobRegistry::claim_next_due(conn, now, "w3", 300_000)
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, early.id);
    }

    #[test]
    fn test_stale_lock_reclaim() {
        let db = setup();
        let conn = db.connection();
        let job = JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::M5)).unwrap();

        let now = utils::now_ms();
        conn.execute(
            "UPDATE jobs SET next_run_time = ?2 WHERE id = ?1",
            params![job.id, now - 700_000],
        )
        .unwrap();

        // un worker planté laisse un verrou périmé
        let stale = JobRegistry::claim_next_due(conn, now - 600_000, "dead", 300_000).unwrap();
        assert!(stale.is_some());
        let reclaimed = JobRegistry::claim_next_due(conn, now, "alive", 300_000).unwrap();
        assert_eq!(reclaimed.unwrap().locked_by.as_deref(), Some("alive"));
    }

    #[test]
    fn test_tie_break_on_failures() {
        let db = setup();
        let conn = db.connection();
        let stable = JobRegistry::create(conn, &new_job("AAA/USDT", Timeframe::M5)).unwrap();
        let flaky = JobRegistry::create(conn, &new_job("BBB/USDT", Timeframe::M5)).unwrap();

        let now = utils::now_ms();
        for id in [&stable.id, &flaky.id] {
            conn.execute(
                "UPDATE jobs SET next_run_time = ?2 WHERE id = ?1",
                params![id, now - 1_000],
            )
            .unwrap();
        }
        conn.execute(
            "UPDATE jobs SET consecutive_failures = 4 WHERE id = ?1",
            params![flaky.id],
        )
        .unwrap();

        // à échéance égale, le moins fautif passe d'abord
        let first = JobRegistry::claim_next_due(conn, now, "w1", 300_000)
            .unwrap()
            .unwrap();
        assert_eq!(first.id, stable.id);
    }

    #[test]
    fn test_cycle_detection() {
        let mut db = setup();
        let conn = db.connection();
        let a = JobRegistry::create(conn, &new_job("AAA/USDT", Timeframe::M5)).unwrap();
        let b = JobRegistry::create(conn, &new_job("BBB/USDT", Timeframe::M5)).unwrap();
        let c = JobRegistry::create(conn, &new_job("CCC/USDT", Timeframe::M5)).unwrap();

        let conn = db.connection_mut();
        // a → b → c: accepté
        JobRegistry::set_dependencies(conn, &a.id, &[b.id.clone()]).unwrap();
        JobRegistry::set_dependencies(conn, &b.id, &[c.id.clone()]).unwrap();

        // c → a fermerait le cycle
        assert!(matches!(
            JobRegistry::set_dependencies(conn, &c.id, &[a.id.clone()]),
            Err(CollectError::DependencyCycle(_))
        ));
        // l'auto-dépendance est un cycle trivial
        assert!(matches!(
            JobRegistry::set_dependencies(conn, &a.id, &[a.id.clone()]),
            Err(CollectError::DependencyCycle(_))
        ));

        // le remplacement d'un ensemble reste contrôlé sur l'état final
        JobRegistry::set_dependencies(conn, &c.id, &[]).unwrap();
        assert_eq!(
            JobRegistry::find_depending_on(conn, &c.id).unwrap(),
            vec![b.id.clone()]
        );
    }

    #[test]
    fn test_dependency_freshness() {
        let mut db = setup();
        let (a, b) = {
            let conn = db.connection();
            let a = JobRegistry::create(conn, &new_job("AAA/USDT", Timeframe::H1)).unwrap();
            let b = JobRegistry::create(conn, &new_job("BBB/USDT", Timeframe::H1)).unwrap();
            (a, b)
        };
        let now = utils::now_ms();

        // sans dépendance: prêt
        assert_eq!(
            JobRegistry::dependency_status(db.connection(), &a.id, 3_600_000, now).unwrap(),
            DependencyStatus::Ready
        );

        JobRegistry::set_dependencies(db.connection_mut(), &a.id, &[b.id.clone()]).unwrap();
        let conn = db.connection();

        // dépendance jamais exécutée: bloqué
        match JobRegistry::dependency_status(conn, &a.id, 3_600_000, now).unwrap() {
            DependencyStatus::Blocked(reasons) => {
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("jamais exécuté"));
            }
            DependencyStatus::Ready => panic!("dépendance jamais exécutée: devrait bloquer"),
        }

        // succès de B vieux de 2 h, fenêtre 1 h: bloqué
        conn.execute(
            "UPDATE jobs SET last_success_time = ?2 WHERE id = ?1",
            params![b.id, now - 7_200_000],
        )
        .unwrap();
        assert!(matches!(
            JobRegistry::dependency_status(conn, &a.id, 3_600_000, now).unwrap(),
            DependencyStatus::Blocked(_)
        ));

        // succès récent: prêt
        conn.execute(
            "UPDATE jobs SET last_success_time = ?2 WHERE id = ?1",
            params![b.id, now - 60_000],
        )
        .unwrap();
        assert_eq!(
            JobRegistry::dependency_status(conn, &a.id, 3_600_000, now).unwrap(),
            DependencyStatus::Ready
        );

        // dépendance en erreur: bloqué quelle que soit la fraîcheur
        JobRegistry::set_status(conn, &b.id, JobStatus::Error).unwrap();
        assert!(matches!(
            JobRegistry::dependency_status(conn, &a.id, 3_600_000, now).unwrap(),
            DependencyStatus::Blocked(_)
        ));
    }

    #[test]
    fn test_cursor_monotonic() {
        let db = setup();
        let conn = db.connection();
        let job = JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::M5)).unwrap();

        JobRegistry::advance_cursor(conn, &job.id, 1_000_000).unwrap();
        assert_eq!(
            JobRegistry::get(conn, &job.id).unwrap().last_candle_time,
            Some(1_000_000)
        );

        // une valeur plus ancienne ne fait pas reculer le curseur
        JobRegistry::advance_cursor(conn, &job.id, 500_000).unwrap();
        assert_eq!(
            JobRegistry::get(conn, &job.id).unwrap().last_candle_time,
            Some(1_000_000)
        );

        JobRegistry::advance_cursor(conn, &job.id, 2_000_000).unwrap();
        assert_eq!(
            JobRegistry::get(conn, &job.id).unwrap().last_candle_time,
            Some(2_000_000)
        );
    }

    #[test]
    fn test_failure_bookkeeping() {
        let db = setup();
        let conn = db.connection();
        let job = JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::M5)).unwrap();
        let now = utils::now_ms();

        let failures = JobRegistry::record_failure(
            conn,
            &job.id,
            now,
            now + 30_000,
            ErrorKind::Transient,
            "timeout",
            true,
            false,
        )
        .unwrap();
        assert_eq!(failures, 1);

        let loaded = JobRegistry::get(conn, &job.id).unwrap();
        assert_eq!(loaded.last_error_kind.as_deref(), Some("transient"));
        assert_eq!(loaded.status, JobStatus::Active);

        // erreur permanente: bascule en error sans compter
        JobRegistry::record_failure(
            conn,
            &job.id,
            now,
            now + 21_600_000,
            ErrorKind::SymbolNotListed,
            "Invalid symbol",
            false,
            true,
        )
        .unwrap();
        let loaded = JobRegistry::get(conn, &job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Error);
        assert_eq!(loaded.consecutive_failures, 1);

        // un succès remet tout à zéro
        JobRegistry::set_status(conn, &job.id, JobStatus::Active).unwrap();
        JobRegistry::record_success(conn, &job.id, now, now + 300_000).unwrap();
        let loaded = JobRegistry::get(conn, &job.id).unwrap();
        assert_eq!(loaded.consecutive_failures, 0);
        assert!(loaded.last_error_kind.is_none());
        assert_eq!(loaded.last_success_time, Some(now));
    }

    #[test]
    fn test_delete_guard() {
        let mut db = setup();
        let conn = db.connection();
        let a = JobRegistry::create(conn, &new_job("AAA/USDT", Timeframe::M5)).unwrap();
        let b = JobRegistry::create(conn, &new_job("BBB/USDT", Timeframe::M5)).unwrap();

        let conn = db.connection_mut();
        JobRegistry::set_dependencies(conn, &a.id, &[b.id.clone()]).unwrap();

        // b est référencé par a: suppression refusée
        assert!(matches!(
            JobRegistry::delete(conn, &b.id),
            Err(CollectError::JobStillReferenced(_))
        ));

        JobRegistry::delete(conn, &a.id).unwrap();
        JobRegistry::delete(conn, &b.id).unwrap();
        assert!(JobRegistry::list(conn, &JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_execute_now() {
        let db = setup();
        let conn = db.connection();
        let job = JobRegistry::create(conn, &new_job("ETH/USDT", Timeframe::D1)).unwrap();
        let now = utils::now_ms();
        JobRegistry::defer(conn, &job.id, now, now + 86_400_000).unwrap();
        assert!(JobRegistry::claim_next_due(conn, now, "w1", 1_000).unwrap().is_none());

        JobRegistry::execute_now(conn, &job.id, now).unwrap();
        let claimed = JobRegistry::claim_next_due(conn, now, "w1", 1_000).unwrap();
        assert_eq!(claimed.unwrap().id, job.id);
    }
}
