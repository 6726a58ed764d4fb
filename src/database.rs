/// Module de gestion de la base de données SQLite
///
/// Ce module fournit une structure DatabaseManager pour encapsuler
/// l'ouverture de la connexion et l'initialisation du schéma. Chaque worker
/// ouvre sa propre connexion; l'état partagé (budget de rate limit, verrou
/// de job) vit uniquement dans ces tables et n'est jamais mis en cache en
/// mémoire entre deux opérations.
use anyhow::Result;
use rusqlite::{Connection, Result as SqlResult};
use std::path::Path;

/// Gestionnaire de la base de données SQLite
pub struct DatabaseManager {
    conn: Connection,
}

impl DatabaseManager {
    /// Ouvre (ou crée) la base et initialise le schéma
    pub fn open(db_file: &str) -> Result<Self> {
        let path = Path::new(db_file);
        let conn = Connection::open(path)?;

        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;

        Ok(DatabaseManager { conn })
    }

    /// Base en mémoire, pour les tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(DatabaseManager { conn })
    }

    /// Pragmas pour l'accès concurrent multi-workers
    fn apply_pragmas(conn: &Connection) -> SqlResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(())
    }

    /// Initialise le schéma de la base de données
    fn init_schema(conn: &Connection) -> SqlResult<()> {
        // Connecteurs: un enregistrement par exchange, budget de rate limit
        // inclus. Le tuple (window_start, usage, last_api_call_at) n'est
        // modifié que par UPDATE conditionnel (compare-and-set).
        conn.execute(
            "CREATE TABLE IF NOT EXISTS connectors (
                exchange_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                rate_limit_max INTEGER NOT NULL,
                rate_limit_period_ms INTEGER NOT NULL,
                rate_limit_min_delay_ms INTEGER NOT NULL,
                rate_limit_usage INTEGER NOT NULL DEFAULT 0,
                rate_limit_window_start INTEGER NOT NULL,
                last_api_call_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Jobs de collecte: un par (exchange, symbol, timeframe).
        // Le verrou (locked_until, locked_by) est acquis par UPDATE
        // conditionnel; le curseur ne recule jamais.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                schedule_mode TEXT NOT NULL DEFAULT 'timeframe',
                collect_historical INTEGER NOT NULL DEFAULT 0,
                last_candle_time INTEGER,
                historical_complete INTEGER NOT NULL DEFAULT 0,
                next_run_time INTEGER NOT NULL,
                last_run_time INTEGER,
                last_success_time INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_failure_time INTEGER,
                last_error_kind TEXT,
                last_error_message TEXT,
                locked_until INTEGER,
                locked_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(exchange_id, symbol, timeframe)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_next_run
             ON jobs(status, next_run_time)",
            [],
        )?;

        // Arêtes de dépendance entre jobs (DAG, contrôle de cycle avant
        // toute insertion)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_dependencies (
                job_id TEXT NOT NULL,
                depends_on TEXT NOT NULL,
                PRIMARY KEY (job_id, depends_on)
            )",
            [],
        )?;

        // Chunks de bougies: un document par (exchange, symbol, timeframe,
        // bucket), payload JSON trié par open_time strictement croissant.
        // bucket = "YYYY-MM", ou "YYYY-MM.1"/"YYYY-MM.2" après débordement.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candle_chunks (
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                bucket TEXT NOT NULL,
                candle_count INTEGER NOT NULL,
                first_open_time INTEGER NOT NULL,
                last_open_time INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (exchange_id, symbol, timeframe, bucket)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunks_series
             ON candle_chunks(exchange_id, symbol, timeframe, last_open_time)",
            [],
        )?;

        Ok(())
    }

    /// Retourne une référence à la connexion SQLite
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Retourne une référence mutable à la connexion SQLite
    /// (nécessaire pour les transactions)
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
