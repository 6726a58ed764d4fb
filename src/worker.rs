/// Module du pool de workers
///
/// ARCHITECTURE:
/// N tâches tokio partagent le registre persistant; la boucle d'un worker
/// est revendiquer-ou-dormir, exécuter, relâcher. Chaque worker ouvre sa
/// propre connexion SQLite: l'exclusion par job passe uniquement par le
/// verrou en base, ce qui rend le redémarrage trivial (au boot, on
/// recommence simplement à revendiquer).
use crate::adapter::MarketDataSource;
use crate::alerts::AlertBus;
use crate::config::CollectorConfig;
use crate::database::DatabaseManager;
use crate::executor::JobExecutor;
use crate::jobs::JobRegistry;
use crate::rate_limiter::RateLimiter;
use crate::utils;
use anyhow::Result;
use futures_util::future;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Lance le pool de workers; rend la main à l'arrêt demandé
pub async fn run_pool<S>(
    config: Arc<CollectorConfig>,
    source: Arc<S>,
    limiter: Arc<RateLimiter>,
    alerts: AlertBus,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()>
where
    S: MarketDataSource + 'static,
{
    let mut handles = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        let worker_id = format!("worker-{}-{}", std::process::id(), index);
        let config = Arc::clone(&config);
        let source = Arc::clone(&source);
        let limiter = Arc::clone(&limiter);
        let alerts = alerts.clone();
        let shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = worker_loop(worker_id.clone(), config, source, limiter, alerts, shutdown).await
            {
                error!(worker_id, erreur = %e, "worker arrêté sur erreur");
            }
        }));
    }

    future::join_all(handles).await;
    Ok(())
}

/// Boucle d'un worker: revendiquer-ou-dormir, exécuter, relâcher
async fn worker_loop<S: MarketDataSource>(
    worker_id: String,
    config: Arc<CollectorConfig>,
    source: Arc<S>,
    limiter: Arc<RateLimiter>,
    alerts: AlertBus,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let mut db = DatabaseManager::open(&config.db_path)?;
    info!(worker_id, "worker démarré");

    loop {
        if *shutdown.borrow() {
            info!(worker_id, "worker arrêté");
            return Ok(());
        }

        let now = utils::now_ms();
        let claimed = JobRegistry::claim_next_due(
            db.connection(),
            now,
            &worker_id,
            config.lock_duration_ms,
        )?;

        match claimed {
            Some(job) => {
                let executor = JobExecutor::new(&*source, &limiter, &alerts, &config);
                let result = executor.execute(db.connection_mut(), &job, now).await;
                // le verrou est relâché quoi qu'il arrive
                JobRegistry::release_lock(db.connection(), &job.id, &worker_id)?;
                if let Err(e) = result {
                    error!(worker_id, job_id = %job.id, erreur = %e, "run en échec interne");
                }
            }
            None => {
                // personne n'est dû: dormir avec un peu de jitter pour
                // désynchroniser les workers
                let jitter = rand::thread_rng().gen_range(0..=config.poll_interval_ms / 4);
                let sleep = Duration::from_millis(config.poll_interval_ms + jitter);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
