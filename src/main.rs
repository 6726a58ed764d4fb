/// Point d'entrée du collecteur de chandeliers multi-exchange
///
/// Sous-commandes:
/// - daemon: lance le pool de workers sur le registre persistant
/// - register-exchange: enregistre un connecteur (descripteur intégré)
/// - add-job: crée un ou plusieurs jobs (exchange, symbole, timeframes)
/// - list-jobs: affiche l'état des jobs
/// - stats: statistiques du store pour un exchange
/// - verify: rapport d'espacement d'une série
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rust_candles_collector::adapter::{HttpExchangeAdapter, MarketDataSource};
use rust_candles_collector::alerts::AlertBus;
use rust_candles_collector::config::CollectorConfig;
use rust_candles_collector::connectors::ConnectorRegistry;
use rust_candles_collector::database::DatabaseManager;
use rust_candles_collector::jobs::{JobFilter, JobRegistry, NewJob};
use rust_candles_collector::rate_limiter::RateLimiter;
use rust_candles_collector::timeframe::Timeframe;
use rust_candles_collector::utils;
use rust_candles_collector::{chunk_store::ChunkStore, verify, worker};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fichier de configuration JSON (défauts raisonnables sinon)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lance le démon de collecte
    Daemon {
        /// Surcharge le nombre de workers de la config
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Enregistre (ou met à jour) un connecteur d'exchange
    RegisterExchange {
        /// Identifiant de l'exchange (ex: binance, bybit, kraken)
        #[arg(short, long)]
        exchange: String,
    },
    /// Crée un job de collecte par timeframe demandé
    AddJob {
        #[arg(short, long)]
        exchange: String,
        /// Symbole unifié (ex: ETH/USDT)
        #[arg(short, long)]
        symbol: String,
        /// Timeframes, séparés par des virgules (ex: 5m,1h,1d)
        #[arg(short, long, default_value = "5m,15m,1h,1d")]
        timeframes: String,
        /// Récupère aussi l'historique profond
        #[arg(long)]
        historical: bool,
    },
    /// Liste les jobs et leur état
    ListJobs {
        /// Filtre par exchange
        #[arg(short, long)]
        exchange: Option<String>,
    },
    /// Statistiques du store
    Stats {
        #[arg(short, long)]
        exchange: String,
        #[arg(short, long)]
        symbol: Option<String>,
        #[arg(short, long)]
        timeframe: Option<String>,
    },
    /// Vérifie l'espacement d'une série stockée
    Verify {
        #[arg(short, long)]
        exchange: String,
        #[arg(short, long)]
        symbol: String,
        #[arg(short, long)]
        timeframe: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = CollectorConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Daemon { workers } => run_daemon(config, workers).await,
        Command::RegisterExchange { exchange } => register_exchange(&config, &exchange),
        Command::AddJob {
            exchange,
            symbol,
            timeframes,
            historical,
        } => add_jobs(&config, &exchange, &symbol, &timeframes, historical),
        Command::ListJobs { exchange } => list_jobs(&config, exchange),
        Command::Stats {
            exchange,
            symbol,
            timeframe,
        } => print_stats(&config, &exchange, symbol.as_deref(), timeframe.as_deref()),
        Command::Verify {
            exchange,
            symbol,
            timeframe,
        } => run_verify(&config, &exchange, &symbol, &timeframe),
    }
}

/// Construit l'adaptateur avec le dictionnaire d'erreurs externe éventuel
fn build_adapter(config: &CollectorConfig) -> Result<HttpExchangeAdapter> {
    let mut adapter = HttpExchangeAdapter::new();
    if let Some(path) = &config.error_dictionary_path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("lecture du dictionnaire d'erreurs {}", path))?;
        let rules = serde_json::from_str(&raw)
            .with_context(|| format!("parsing du dictionnaire d'erreurs {}", path))?;
        adapter.merge_error_rules(rules);
    }
    Ok(adapter)
}

async fn run_daemon(mut config: CollectorConfig, workers_override: Option<usize>) -> Result<()> {
    if let Some(workers) = workers_override {
        config.workers = workers;
    }

    // initialise la base (schéma) avant le démarrage des workers
    let db = DatabaseManager::open(&config.db_path)?;
    let connectors = ConnectorRegistry::list(db.connection(), None)?;
    info!(
        workers = config.workers,
        connecteurs = connectors.len(),
        db = %config.db_path,
        "démarrage du collecteur"
    );
    drop(db);

    let adapter = Arc::new(build_adapter(&config)?);
    let alerts = AlertBus::default();
    let _log_subscriber = alerts.spawn_log_subscriber();
    let limiter = Arc::new(RateLimiter::new(
        alerts.clone(),
        config.saturation_threshold,
        config.saturation_window_ms,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = tokio::spawn(worker::run_pool(
        Arc::new(config),
        adapter,
        limiter,
        alerts,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Arrêt demandé, les workers terminent leur run en cours...");
    shutdown_tx.send(true)?;
    pool.await??;
    println!("✅ Collecteur arrêté proprement.");
    Ok(())
}

fn register_exchange(config: &CollectorConfig, exchange: &str) -> Result<()> {
    let adapter = build_adapter(config)?;
    let info = match adapter.describe(exchange) {
        Some(info) => info,
        None => bail!(
            "exchange inconnu: {} (connus: {})",
            exchange,
            adapter.list_supported().join(", ")
        ),
    };

    let db = DatabaseManager::open(&config.db_path)?;
    let connector = ConnectorRegistry::register_or_update(
        db.connection(),
        &info.exchange_id,
        &info.display_name,
        info.default_rate_limit,
    )?;

    println!("✅ Connecteur enregistré: {}", connector.exchange_id);
    println!(
        "   Budget: {} requêtes / {} ms, espacement {} ms",
        connector.rate_limit.limit,
        connector.rate_limit.period_ms,
        connector.rate_limit.min_delay_ms
    );
    println!(
        "   Timeframes supportés: {}",
        info.supported_timeframes
            .iter()
            .map(|tf| tf.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn add_jobs(
    config: &CollectorConfig,
    exchange: &str,
    symbol: &str,
    timeframes: &str,
    historical: bool,
) -> Result<()> {
    let db = DatabaseManager::open(&config.db_path)?;
    let symbol = symbol.to_uppercase();

    for label in timeframes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let timeframe = Timeframe::from_str(label)
            .map_err(|e| anyhow::anyhow!("timeframe invalide: {}", e))?;
        match JobRegistry::create(
            db.connection(),
            &NewJob {
                exchange_id: exchange.to_string(),
                symbol: symbol.clone(),
                timeframe,
                collect_historical: historical,
            },
        ) {
            Ok(job) => println!("✅ Job créé: {}", job.id),
            Err(e) => eprintln!("⚠ {}/{}: {}", symbol, label, e),
        }
    }
    Ok(())
}

fn list_jobs(config: &CollectorConfig, exchange: Option<String>) -> Result<()> {
    let db = DatabaseManager::open(&config.db_path)?;
    let jobs = JobRegistry::list(
        db.connection(),
        &JobFilter {
            exchange_id: exchange,
            ..JobFilter::default()
        },
    )?;

    if jobs.is_empty() {
        println!("Aucun job enregistré.");
        return Ok(());
    }

    println!("{} jobs:", jobs.len());
    for job in jobs {
        let cursor = job
            .last_candle_time
            .map(utils::format_timestamp_ms)
            .unwrap_or_else(|| "aucun".to_string());
        println!(
            "  {} [{}] curseur={} prochaine={} échecs={}",
            job.id,
            job.status.as_str(),
            cursor,
            utils::format_timestamp_ms(job.next_run_time),
            job.consecutive_failures
        );
    }
    Ok(())
}

fn print_stats(
    config: &CollectorConfig,
    exchange: &str,
    symbol: Option<&str>,
    timeframe: Option<&str>,
) -> Result<()> {
    let timeframe = match timeframe {
        Some(label) => Some(
            Timeframe::from_str(label)
                .map_err(|e| anyhow::anyhow!("timeframe invalide: {}", e))?,
        ),
        None => None,
    };

    let db = DatabaseManager::open(&config.db_path)?;
    let stats = ChunkStore::stats(db.connection(), exchange, symbol, timeframe)?;

    println!("=== Statistiques {} ===", exchange);
    println!("Bougies: {}", stats.candle_count);
    println!("Chunks: {}", stats.chunk_count);
    println!("Taille estimée: {} octets", stats.estimated_size);
    if let (Some(first), Some(last)) = (stats.first_open_time, stats.last_open_time) {
        println!("Première: {}", utils::format_timestamp_ms(first));
        println!("Dernière: {}", utils::format_timestamp_ms(last));
    }
    Ok(())
}

fn run_verify(
    config: &CollectorConfig,
    exchange: &str,
    symbol: &str,
    timeframe: &str,
) -> Result<()> {
    let timeframe = Timeframe::from_str(timeframe)
        .map_err(|e| anyhow::anyhow!("timeframe invalide: {}", e))?;
    let db = DatabaseManager::open(&config.db_path)?;
    let report = verify::verify_series(db.connection(), exchange, &symbol.to_uppercase(), timeframe)?;
    verify::print_report(&report);
    Ok(())
}
