/// Serveur web d'administration du collecteur
///
/// ARCHITECTURE:
/// - API REST avec actix-web, services du cœur exposés en JSON
/// - Endpoints:
///   - /api/connectors: enregistrement, listing, suspension, budget
///   - /api/jobs, /api/job: création, état, pause/reprise, exécution
///     immédiate, file d'attente, dépendances
///   - /api/candles: tail et plages paginées (cache moka), /api/stats
/// L'identifiant de job contient le symbole ("bybit:ETH/USDT:5m"), il
/// passe donc en paramètre de requête, jamais dans le chemin.
use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, Responder, delete, get, patch, post, put, web};
use moka::future::Cache;
use rust_candles_collector::alerts::{AlertBus, AlertEvent};
use rust_candles_collector::candle::Candle;
use rust_candles_collector::chunk_store::ChunkStore;
use rust_candles_collector::config::CollectorConfig;
use rust_candles_collector::connectors::{ConnectorRegistry, RateLimitSpec};
use rust_candles_collector::database::DatabaseManager;
use rust_candles_collector::errors::CollectError;
use rust_candles_collector::jobs::{DependencyStatus, JobFilter, JobRegistry, JobStatus, NewJob};
use rust_candles_collector::timeframe::Timeframe;
use rust_candles_collector::utils;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Clé de cache pour les requêtes de plages de bougies
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    exchange: String,
    symbol: String,
    timeframe: String,
    start: Option<i64>,
    end: Option<i64>,
    limit: usize,
    offset: usize,
}

/// État partagé de l'application
struct AppState {
    db_path: String,
    alerts: AlertBus,
    candles_cache: Cache<CacheKey, Arc<Vec<Candle>>>,
}

impl AppState {
    fn open_db(&self) -> Result<DatabaseManager, CollectError> {
        DatabaseManager::open(&self.db_path)
            .map_err(|e| CollectError::StoreWriteFailed(e.to_string()))
    }
}

fn error_response(error: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": error.to_string() }))
}

fn parse_timeframe(label: &str) -> Result<Timeframe, HttpResponse> {
    Timeframe::from_str(label).map_err(|e| error_response(e))
}

// ---------------------------------------------------------------------------
// Connecteurs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterConnectorBody {
    exchange_id: String,
    display_name: String,
    limit: i64,
    period_ms: i64,
    min_delay_ms: i64,
}

/// GET /api/connectors - liste des connecteurs
#[get("/api/connectors")]
async fn list_connectors(data: web::Data<AppState>) -> impl Responder {
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ConnectorRegistry::list(db.connection(), None)
    })
    .await;

    match result {
        Ok(Ok(connectors)) => HttpResponse::Ok().json(connectors),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// POST /api/connectors - enregistre ou met à jour un connecteur
#[post("/api/connectors")]
async fn register_connector(
    data: web::Data<AppState>,
    body: web::Json<RegisterConnectorBody>,
) -> impl Responder {
    let body = body.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ConnectorRegistry::register_or_update(
            db.connection(),
            &body.exchange_id,
            &body.display_name,
            RateLimitSpec {
                limit: body.limit,
                period_ms: body.period_ms,
                min_delay_ms: body.min_delay_ms,
            },
        )
    })
    .await;

    match result {
        Ok(Ok(connector)) => HttpResponse::Ok().json(connector),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// GET /api/connectors/{id} - détail d'un connecteur
#[get("/api/connectors/{exchange_id}")]
async fn get_connector(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let exchange_id = path.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ConnectorRegistry::get(db.connection(), &exchange_id)
    })
    .await;

    match result {
        Ok(Ok(connector)) => HttpResponse::Ok().json(connector),
        Ok(Err(e @ CollectError::ExchangeUnknown(_))) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": e.to_string() }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// GET /api/connectors/{id}/rate-limit - budget en cours
#[get("/api/connectors/{exchange_id}/rate-limit")]
async fn connector_rate_limit(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let exchange_id = path.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ConnectorRegistry::get(db.connection(), &exchange_id)
    })
    .await;

    match result {
        Ok(Ok(connector)) => {
            let now = utils::now_ms();
            let window_remaining_ms =
                (connector.window_start + connector.rate_limit.period_ms - now).max(0);
            HttpResponse::Ok().json(serde_json::json!({
                "exchange_id": connector.exchange_id,
                "limit": connector.rate_limit.limit,
                "period_ms": connector.rate_limit.period_ms,
                "min_delay_ms": connector.rate_limit.min_delay_ms,
                "usage": connector.usage,
                "window_start": connector.window_start,
                "window_remaining_ms": window_remaining_ms,
                "last_api_call_at": connector.last_api_call_at,
            }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// POST /api/connectors/{id}/suspend
#[post("/api/connectors/{exchange_id}/suspend")]
async fn suspend_connector(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let exchange_id = path.into_inner();
    let state = data.clone();
    let id_for_alert = exchange_id.clone();
    let result = web::block(move || {
        let db = state.open_db()?;
        ConnectorRegistry::suspend(db.connection(), &exchange_id)
    })
    .await;

    match result {
        Ok(Ok(())) => {
            data.alerts.emit(AlertEvent::ConnectorSuspended {
                exchange_id: id_for_alert,
            });
            HttpResponse::Ok().json(serde_json::json!({ "status": "suspended" }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// POST /api/connectors/{id}/resume
#[post("/api/connectors/{exchange_id}/resume")]
async fn resume_connector(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let exchange_id = path.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ConnectorRegistry::resume(db.connection(), &exchange_id)
    })
    .await;

    match result {
        Ok(Ok(())) => HttpResponse::Ok().json(serde_json::json!({ "status": "active" })),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    exchange: Option<String>,
    symbol: Option<String>,
    timeframe: Option<String>,
}

/// GET /api/jobs - listing filtrable
#[get("/api/jobs")]
async fn list_jobs(data: web::Data<AppState>, query: web::Query<JobsQuery>) -> impl Responder {
    let status = match query.status.as_deref() {
        Some("active") => Some(JobStatus::Active),
        Some("paused") => Some(JobStatus::Paused),
        Some("error") => Some(JobStatus::Error),
        Some(other) => return error_response(format!("statut inconnu: {}", other)),
        None => None,
    };
    let timeframe = match &query.timeframe {
        Some(label) => match parse_timeframe(label) {
            Ok(tf) => Some(tf),
            Err(response) => return response,
        },
        None => None,
    };

    let filter = JobFilter {
        status,
        exchange_id: query.exchange.clone(),
        symbol: query.symbol.clone(),
        timeframe,
    };
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        JobRegistry::list(db.connection(), &filter)
    })
    .await;

    match result {
        Ok(Ok(jobs)) => HttpResponse::Ok().json(jobs),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateJobsBody {
    exchange_id: String,
    symbol: String,
    timeframes: Vec<String>,
    #[serde(default)]
    collect_historical: bool,
}

#[derive(Debug, Serialize)]
struct CreateJobsResponse {
    created: Vec<String>,
    errors: Vec<String>,
}

/// POST /api/jobs - création en lot (un job par timeframe)
#[post("/api/jobs")]
async fn create_jobs(
    data: web::Data<AppState>,
    body: web::Json<CreateJobsBody>,
) -> impl Responder {
    let body = body.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        let mut response = CreateJobsResponse {
            created: Vec::new(),
            errors: Vec::new(),
        };
        for label in &body.timeframes {
            let timeframe = match Timeframe::from_str(label) {
                Ok(tf) => tf,
                Err(e) => {
                    response.errors.push(e);
                    continue;
                }
            };
            match JobRegistry::create(
                db.connection(),
                &NewJob {
                    exchange_id: body.exchange_id.clone(),
                    symbol: body.symbol.to_uppercase(),
                    timeframe,
                    collect_historical: body.collect_historical,
                },
            ) {
                Ok(job) => response.created.push(job.id),
                Err(e) => response.errors.push(e.to_string()),
            }
        }
        Ok::<_, CollectError>(response)
    })
    .await;

    match result {
        Ok(Ok(response)) => HttpResponse::Ok().json(response),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct JobIdQuery {
    id: String,
}

/// GET /api/job?id= - détail d'un job
#[get("/api/job")]
async fn get_job(data: web::Data<AppState>, query: web::Query<JobIdQuery>) -> impl Responder {
    let id = query.into_inner().id;
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        JobRegistry::get(db.connection(), &id)
    })
    .await;

    match result {
        Ok(Ok(job)) => HttpResponse::Ok().json(job),
        Ok(Err(e @ CollectError::JobUnknown(_))) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": e.to_string() }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/job?id= - suppression (refusée si le job est référencé)
#[delete("/api/job")]
async fn delete_job(data: web::Data<AppState>, query: web::Query<JobIdQuery>) -> impl Responder {
    let id = query.into_inner().id;
    let data = data.clone();
    let result = web::block(move || {
        let mut db = data.open_db()?;
        JobRegistry::delete(db.connection_mut(), &id)
    })
    .await;

    match result {
        Ok(Ok(())) => HttpResponse::Ok().json(serde_json::json!({ "deleted": true })),
        Ok(Err(e @ CollectError::JobStillReferenced(_))) => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": e.to_string() }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

async fn set_job_status(
    data: web::Data<AppState>,
    id: String,
    status: JobStatus,
) -> HttpResponse {
    let result = web::block(move || {
        let db = data.open_db()?;
        JobRegistry::set_status(db.connection(), &id, status)
    })
    .await;

    match result {
        Ok(Ok(())) => HttpResponse::Ok().json(serde_json::json!({ "status": status.as_str() })),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateJobBody {
    collect_historical: Option<bool>,
}

/// PATCH /api/job?id= - mise à jour des attributs modifiables
#[patch("/api/job")]
async fn update_job(
    data: web::Data<AppState>,
    query: web::Query<JobIdQuery>,
    body: web::Json<UpdateJobBody>,
) -> impl Responder {
    let id = query.into_inner().id;
    let body = body.into_inner();
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        if let Some(collect_historical) = body.collect_historical {
            JobRegistry::set_collect_historical(db.connection(), &id, collect_historical)?;
        }
        JobRegistry::get(db.connection(), &id)
    })
    .await;

    match result {
        Ok(Ok(job)) => HttpResponse::Ok().json(job),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// POST /api/job/pause?id=
#[post("/api/job/pause")]
async fn pause_job(data: web::Data<AppState>, query: web::Query<JobIdQuery>) -> impl Responder {
    set_job_status(data, query.into_inner().id, JobStatus::Paused).await
}

/// POST /api/job/resume?id=
#[post("/api/job/resume")]
async fn resume_job(data: web::Data<AppState>, query: web::Query<JobIdQuery>) -> impl Responder {
    set_job_status(data, query.into_inner().id, JobStatus::Active).await
}

/// POST /api/job/execute-now?id= - contourne la planification, pas le
/// verrou ni le limiter
#[post("/api/job/execute-now")]
async fn execute_job_now(
    data: web::Data<AppState>,
    query: web::Query<JobIdQuery>,
) -> impl Responder {
    let id = query.into_inner().id;
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        JobRegistry::execute_now(db.connection(), &id, utils::now_ms())
    })
    .await;

    match result {
        Ok(Ok(())) => HttpResponse::Ok().json(serde_json::json!({ "scheduled": true })),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    limit: Option<usize>,
}

/// GET /api/queue - jobs triés par prochaine échéance
#[get("/api/queue")]
async fn read_queue(data: web::Data<AppState>, query: web::Query<QueueQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(50);
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        JobRegistry::queue(db.connection(), limit)
    })
    .await;

    match result {
        Ok(Ok(jobs)) => HttpResponse::Ok().json(jobs),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

/// GET /api/job/dependencies?id= - dépendances, dépendants et fraîcheur
#[get("/api/job/dependencies")]
async fn job_dependencies(
    data: web::Data<AppState>,
    query: web::Query<JobIdQuery>,
) -> impl Responder {
    let id = query.into_inner().id;
    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        let job = JobRegistry::get(db.connection(), &id)?;
        let depends_on = JobRegistry::list_dependencies(db.connection(), &id)?;
        let dependents = JobRegistry::find_depending_on(db.connection(), &id)?;
        let status = JobRegistry::dependency_status(
            db.connection(),
            &id,
            job.timeframe.interval_ms(),
            utils::now_ms(),
        )?;
        Ok::<_, CollectError>((depends_on, dependents, status))
    })
    .await;

    match result {
        Ok(Ok((depends_on, dependents, status))) => {
            let (ready, reasons) = match status {
                DependencyStatus::Ready => (true, Vec::new()),
                DependencyStatus::Blocked(reasons) => (false, reasons),
            };
            HttpResponse::Ok().json(serde_json::json!({
                "depends_on": depends_on,
                "dependents": dependents,
                "ready": ready,
                "blocked_reasons": reasons,
            }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SetDependenciesBody {
    depends_on: Vec<String>,
}

/// PUT /api/job/dependencies?id= - remplace l'ensemble (contrôle de cycle)
#[put("/api/job/dependencies")]
async fn set_job_dependencies(
    data: web::Data<AppState>,
    query: web::Query<JobIdQuery>,
    body: web::Json<SetDependenciesBody>,
) -> impl Responder {
    let id = query.into_inner().id;
    let depends_on = body.into_inner().depends_on;
    let data = data.clone();
    let result = web::block(move || {
        let mut db = data.open_db()?;
        JobRegistry::set_dependencies(db.connection_mut(), &id, &depends_on)
    })
    .await;

    match result {
        Ok(Ok(())) => HttpResponse::Ok().json(serde_json::json!({ "updated": true })),
        Ok(Err(e @ CollectError::DependencyCycle(_))) => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": e.to_string() }))
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Données
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CandlesQuery {
    exchange: String,
    symbol: String,
    timeframe: String,
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/candles - plage paginée, avec cache
#[get("/api/candles")]
async fn get_candles(data: web::Data<AppState>, query: web::Query<CandlesQuery>) -> impl Responder {
    let query = query.into_inner();
    let timeframe = match parse_timeframe(&query.timeframe) {
        Ok(tf) => tf,
        Err(response) => return response,
    };
    let limit = query.limit.unwrap_or(2_000);
    let offset = query.offset.unwrap_or(0);
    // symbole normalisé une fois: la clé de cache et la requête doivent
    // désigner la même série quelle que soit la casse de l'appelant
    let symbol = query.symbol.to_uppercase();

    let cache_key = CacheKey {
        exchange: query.exchange.clone(),
        symbol: symbol.clone(),
        timeframe: query.timeframe.clone(),
        start: query.start,
        end: query.end,
        limit,
        offset,
    };

    if let Some(cached) = data.candles_cache.get(&cache_key).await {
        return HttpResponse::Ok()
            .insert_header(("X-Cache", "HIT"))
            .json(cached.as_ref());
    }

    let state = data.clone();
    let result = web::block(move || {
        let db = state.open_db()?;
        ChunkStore::range(
            db.connection(),
            &query.exchange,
            &symbol,
            timeframe,
            query.start.unwrap_or(0),
            query.end.unwrap_or(i64::MAX),
            limit,
            offset,
        )
    })
    .await;

    match result {
        Ok(Ok(candles)) => {
            let candles = Arc::new(candles);
            data.candles_cache
                .insert(cache_key, Arc::clone(&candles))
                .await;
            HttpResponse::Ok()
                .insert_header(("X-Cache", "MISS"))
                .json(candles.as_ref())
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    exchange: String,
    symbol: String,
    timeframe: String,
    n: Option<usize>,
}

/// GET /api/candles/tail - les n dernières bougies
#[get("/api/candles/tail")]
async fn get_tail(data: web::Data<AppState>, query: web::Query<TailQuery>) -> impl Responder {
    let query = query.into_inner();
    let timeframe = match parse_timeframe(&query.timeframe) {
        Ok(tf) => tf,
        Err(response) => return response,
    };
    let n = query.n.unwrap_or(100);

    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ChunkStore::tail(
            db.connection(),
            &query.exchange,
            &query.symbol.to_uppercase(),
            timeframe,
            n,
        )
    })
    .await;

    match result {
        Ok(Ok(candles)) => HttpResponse::Ok().json(candles),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    exchange: String,
    symbol: Option<String>,
    timeframe: Option<String>,
}

/// GET /api/stats - statistiques du store
#[get("/api/stats")]
async fn get_stats(data: web::Data<AppState>, query: web::Query<StatsQuery>) -> impl Responder {
    let query = query.into_inner();
    let timeframe = match &query.timeframe {
        Some(label) => match parse_timeframe(label) {
            Ok(tf) => Some(tf),
            Err(response) => return response,
        },
        None => None,
    };

    let data = data.clone();
    let result = web::block(move || {
        let db = data.open_db()?;
        ChunkStore::stats(
            db.connection(),
            &query.exchange,
            query.symbol.as_deref(),
            timeframe,
        )
    })
    .await;

    match result {
        Ok(Ok(stats)) => HttpResponse::Ok().json(stats),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(e),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = CollectorConfig::load(config_path.as_deref()).unwrap_or_default();

    let alerts = AlertBus::default();
    let _log_subscriber = alerts.spawn_log_subscriber();

    let state = web::Data::new(AppState {
        db_path: config.db_path.clone(),
        alerts,
        candles_cache: Cache::builder()
            .time_to_live(Duration::from_secs(30))
            .max_capacity(1_000)
            .build(),
    });

    println!("🚀 Serveur d'administration sur http://127.0.0.1:8080");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .service(list_connectors)
            .service(register_connector)
            .service(connector_rate_limit)
            .service(suspend_connector)
            .service(resume_connector)
            .service(get_connector)
            .service(list_jobs)
            .service(create_jobs)
            .service(read_queue)
            .service(job_dependencies)
            .service(set_job_dependencies)
            .service(pause_job)
            .service(resume_job)
            .service(execute_job_now)
            .service(get_job)
            .service(update_job)
            .service(delete_job)
            .service(get_candles)
            .service(get_tail)
            .service(get_stats)
    })
    .bind(("127.0.0.1", 8080))?
    .run()
    .await
}
