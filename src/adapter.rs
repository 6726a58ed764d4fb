/// Module de l'adaptateur d'exchange
///
/// ARCHITECTURE:
/// Le comportement propre à chaque exchange est de la donnée, pas du code:
/// un `ExchangeDescriptor` porte l'URL, les gabarits de requête, le
/// pointeur JSON vers le tableau de klines, les indices de colonnes, les
/// libellés d'intervalle et le dictionnaire de classification d'erreurs.
/// Ajouter un exchange = ajouter un descripteur.
///
/// CONTRAT fetch_ohlcv: au plus `limit` bougies d'open_time ≥ since, les
/// plus anciennes d'abord, jamais désalignées ni désordonnées; moins de
/// `limit` seulement quand il n'existe plus rien jusqu'à maintenant.
use crate::candle::Candle;
use crate::connectors::RateLimitSpec;
use crate::errors::{ErrorKind, FetchError};
use crate::timeframe::Timeframe;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Durée de vie du cache des symboles listés
const SYMBOLS_CACHE_TTL_SECS: u64 = 3_600;
/// Plafond du timeout HTTP par appel (borné aussi par l'échéance du run)
const HTTP_TIMEOUT_CAP_MS: u64 = 30_000;
/// Retry-after par défaut quand l'exchange n'en fournit pas
const DEFAULT_RETRY_AFTER_MS: i64 = 1_000;

/// Unité des timestamps côté exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Milliseconds,
    Seconds,
}

impl TimestampUnit {
    fn to_exchange(&self, ms: i64) -> i64 {
        match self {
            TimestampUnit::Milliseconds => ms,
            TimestampUnit::Seconds => ms / 1_000,
        }
    }

    fn to_ms(&self, raw: i64) -> i64 {
        match self {
            TimestampUnit::Milliseconds => raw,
            TimestampUnit::Seconds => raw * 1_000,
        }
    }
}

/// Indices des champs t/o/h/l/c/v dans une ligne de kline
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KlineColumns {
    pub time: usize,
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub close: usize,
    pub volume: usize,
}

/// Règle de classification d'une erreur par sous-chaîne du message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRule {
    pub contains: String,
    pub kind: ErrorKind,
}

/// Descripteur d'un exchange: tout le comportement spécifique en données
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDescriptor {
    pub exchange_id: String,
    pub display_name: String,
    pub base_url: String,
    /// Chemin de l'endpoint klines
    pub klines_path: String,
    /// Paramètres de requête; valeurs gabarits {symbol} {interval} {since} {limit}
    pub klines_query: Vec<(String, String)>,
    /// Pointeur JSON vers le tableau de klines ("" = racine)
    pub data_pointer: String,
    pub columns: KlineColumns,
    pub timestamp_unit: TimestampUnit,
    /// Chemin de l'endpoint de listing des marchés
    pub symbols_path: String,
    pub symbols_pointer: String,
    /// Champ portant le nom du marché dans chaque entrée
    pub symbol_field: String,
    /// Séparateur inséré entre base et quote pour le symbole natif
    /// (symbole unifié "ETH/USDT" → natif via remplacement du "/")
    pub symbol_join: String,
    /// Libellés d'intervalle par timeframe unifié; définit aussi les
    /// timeframes supportés
    pub interval_labels: HashMap<Timeframe, String>,
    pub max_candles_per_call: usize,
    pub default_rate_limit: RateLimitSpec,
    pub ohlcv_supported: bool,
    /// Plus ancienne donnée disponible, si connue
    pub earliest_hint_ms: Option<i64>,
    /// Dictionnaire d'erreurs propre à l'exchange, prioritaire sur le
    /// dictionnaire global
    pub error_rules: Vec<ErrorRule>,
}

/// Vue des capacités d'un exchange (opération `describe`)
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeInfo {
    pub exchange_id: String,
    pub display_name: String,
    pub supported_timeframes: Vec<Timeframe>,
    pub ohlcv_supported: bool,
    pub max_candles_per_call: usize,
    pub default_rate_limit: RateLimitSpec,
    pub earliest_hint_ms: Option<i64>,
}

/// Surface de marché vue par l'exécuteur
///
/// Le trait isole l'exécuteur du transport HTTP; les tests fournissent une
/// source scriptée.
pub trait MarketDataSource: Send + Sync {
    fn describe(&self, exchange_id: &str) -> Option<ExchangeInfo>;

    fn fetch_ohlcv(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since: i64,
        limit: usize,
        deadline: Instant,
    ) -> impl Future<Output = Result<Vec<Candle>, FetchError>> + Send;
}

/// Adaptateur HTTP piloté par descripteurs
pub struct HttpExchangeAdapter {
    client: reqwest::Client,
    descriptors: HashMap<String, ExchangeDescriptor>,
    global_rules: Vec<ErrorRule>,
    symbols_cache: Cache<String, Arc<HashSet<String>>>,
}

impl HttpExchangeAdapter {
    /// Adaptateur avec les descripteurs intégrés
    pub fn new() -> Self {
        Self::with_descriptors(builtin_descriptors())
    }

    pub fn with_descriptors(descriptors: Vec<ExchangeDescriptor>) -> Self {
        let descriptors = descriptors
            .into_iter()
            .map(|d| (d.exchange_id.clone(), d))
            .collect();
        HttpExchangeAdapter {
            client: reqwest::Client::new(),
            descriptors,
            global_rules: default_error_rules(),
            symbols_cache: Cache::builder()
                .time_to_live(Duration::from_secs(SYMBOLS_CACHE_TTL_SECS))
                .max_capacity(64)
                .build(),
        }
    }

    /// Fusionne des règles d'erreur externes (prioritaires sur les défauts)
    pub fn merge_error_rules(&mut self, rules: Vec<ErrorRule>) {
        let mut merged = rules;
        merged.extend(self.global_rules.drain(..));
        self.global_rules = merged;
    }

    /// Exchanges connus du binding
    pub fn list_supported(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.descriptors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn descriptor(&self, exchange_id: &str) -> Option<&ExchangeDescriptor> {
        self.descriptors.get(exchange_id)
    }

    /// Marchés listés par l'exchange (symboles natifs), avec cache
    pub async fn list_symbols(&self, exchange_id: &str) -> Result<Arc<HashSet<String>>, FetchError> {
        if let Some(cached) = self.symbols_cache.get(exchange_id).await {
            return Ok(cached);
        }

        let descriptor = self
            .descriptors
            .get(exchange_id)
            .ok_or_else(|| FetchError::Permanent(format!("exchange inconnu: {}", exchange_id)))?;

        let url = format!("{}{}", descriptor.base_url, descriptor.symbols_path);
        let body = self
            .get_json(&url, &[], Instant::now() + Duration::from_millis(HTTP_TIMEOUT_CAP_MS))
            .await?;

        let node = resolve_pointer(&body, &descriptor.symbols_pointer)
            .ok_or_else(|| FetchError::Unknown("listing des marchés illisible".to_string()))?;

        let mut symbols = HashSet::new();
        let entries: Vec<&Value> = match node {
            Value::Array(items) => items.iter().collect(),
            // certains exchanges renvoient un objet indexé par paire
            Value::Object(map) => map.values().collect(),
            _ => Vec::new(),
        };
        for entry in entries {
            if let Some(symbol) = entry.get(&descriptor.symbol_field).and_then(Value::as_str) {
                symbols.insert(symbol.to_string());
            }
        }

        let symbols = Arc::new(symbols);
        self.symbols_cache
            .insert(exchange_id.to_string(), Arc::clone(&symbols))
            .await;
        Ok(symbols)
    }

    /// Invalide le cache des marchés d'un exchange
    pub async fn refresh_symbols(&self, exchange_id: &str) {
        self.symbols_cache.invalidate(exchange_id).await;
    }

    /// GET + classification des échecs HTTP
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        deadline: Instant,
    ) -> Result<Value, FetchError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FetchError::Transient("échéance du run dépassée".to_string()));
        }
        let timeout = remaining.min(Duration::from_millis(HTTP_TIMEOUT_CAP_MS));

        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Transient(e.to_string())
                } else {
                    FetchError::Unknown(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok())
                .map(|secs| secs * 1_000)
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(FetchError::RateLimitExceeded { retry_after_ms });
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify(&body, None));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Transient(format!("corps illisible: {}", e)))
    }

    /// Classe un message d'erreur via les dictionnaires (exchange puis global)
    fn classify(&self, message: &str, descriptor: Option<&ExchangeDescriptor>) -> FetchError {
        let haystack = message.to_lowercase();
        let exchange_rules = descriptor.map(|d| d.error_rules.as_slice()).unwrap_or(&[]);
        for rule in exchange_rules.iter().chain(self.global_rules.iter()) {
            if haystack.contains(&rule.contains.to_lowercase()) {
                return rule_to_error(rule.kind, message);
            }
        }
        FetchError::Unknown(truncate(message, 200))
    }

    async fn fetch_ohlcv_inner(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since: i64,
        limit: usize,
        deadline: Instant,
    ) -> Result<Vec<Candle>, FetchError> {
        let descriptor = self
            .descriptors
            .get(exchange_id)
            .ok_or_else(|| FetchError::Permanent(format!("exchange inconnu: {}", exchange_id)))?;

        if !descriptor.ohlcv_supported {
            return Err(FetchError::Permanent(format!(
                "OHLCV non supporté par {}",
                exchange_id
            )));
        }

        let interval = descriptor
            .interval_labels
            .get(&timeframe)
            .ok_or_else(|| FetchError::TimeframeUnsupported(timeframe.to_string()))?;

        let native_symbol = symbol.replace('/', &descriptor.symbol_join);
        let effective_limit = limit.min(descriptor.max_candles_per_call).max(1);
        let since_native = descriptor.timestamp_unit.to_exchange(since);

        let query: Vec<(String, String)> = descriptor
            .klines_query
            .iter()
            .map(|(key, template)| {
                let value = template
                    .replace("{symbol}", &native_symbol)
                    .replace("{interval}", interval)
                    .replace("{since}", &since_native.to_string())
                    .replace("{limit}", &effective_limit.to_string());
                (key.clone(), value)
            })
            .collect();

        let url = format!("{}{}", descriptor.base_url, descriptor.klines_path);
        debug!(exchange_id, symbol, %timeframe, since, "appel klines");
        let body = self.get_json(&url, &query, deadline).await?;

        let node = resolve_pointer(&body, &descriptor.data_pointer);
        let rows = match node {
            Some(Value::Array(items)) => items.as_slice(),
            // objet conteneur (paire → tableau): prendre le premier tableau
            Some(Value::Object(map)) => match map.values().find_map(|v| v.as_array()) {
                Some(items) => items.as_slice(),
                None => return Err(self.classify(&body.to_string(), Some(descriptor))),
            },
            _ => return Err(self.classify(&body.to_string(), Some(descriptor))),
        };

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(cells) = row.as_array() else {
                continue;
            };
            let Some(candle) = extract_candle(cells, &descriptor.columns, descriptor.timestamp_unit)
            else {
                continue;
            };
            if !candle.is_valid(timeframe) {
                warn!(
                    exchange_id,
                    symbol,
                    open_time = candle.open_time,
                    "bougie désalignée ou incohérente ignorée"
                );
                continue;
            }
            if candle.open_time < since {
                continue;
            }
            candles.push(candle);
        }

        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        candles.truncate(effective_limit);
        Ok(candles)
    }
}

impl Default for HttpExchangeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataSource for HttpExchangeAdapter {
    fn describe(&self, exchange_id: &str) -> Option<ExchangeInfo> {
        self.descriptors.get(exchange_id).map(|d| {
            let mut supported: Vec<Timeframe> = d.interval_labels.keys().copied().collect();
            supported.sort();
            ExchangeInfo {
                exchange_id: d.exchange_id.clone(),
                display_name: d.display_name.clone(),
                supported_timeframes: supported,
                ohlcv_supported: d.ohlcv_supported,
                max_candles_per_call: d.max_candles_per_call,
                default_rate_limit: d.default_rate_limit,
                earliest_hint_ms: d.earliest_hint_ms,
            }
        })
    }

    fn fetch_ohlcv(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        since: i64,
        limit: usize,
        deadline: Instant,
    ) -> impl Future<Output = Result<Vec<Candle>, FetchError>> + Send {
        self.fetch_ohlcv_inner(exchange_id, symbol, timeframe, since, limit, deadline)
    }
}

/// Résout un pointeur JSON, "" désignant la racine
fn resolve_pointer<'a>(body: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        Some(body)
    } else {
        body.pointer(pointer)
    }
}

/// Extrait une bougie d'une ligne de kline (cellules nombre ou chaîne)
fn extract_candle(cells: &[Value], columns: &KlineColumns, unit: TimestampUnit) -> Option<Candle> {
    let time_raw = value_to_i64(cells.get(columns.time)?)?;
    Some(Candle::new(
        unit.to_ms(time_raw),
        value_to_f64(cells.get(columns.open)?)?,
        value_to_f64(cells.get(columns.high)?)?,
        value_to_f64(cells.get(columns.low)?)?,
        value_to_f64(cells.get(columns.close)?)?,
        value_to_f64(cells.get(columns.volume)?)?,
    ))
}

/// Nombre JSON ou nombre-en-chaîne → f64
fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

fn rule_to_error(kind: ErrorKind, message: &str) -> FetchError {
    let short = truncate(message, 200);
    match kind {
        ErrorKind::RateLimitExceeded => FetchError::RateLimitExceeded {
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        },
        ErrorKind::DateRangeTooWide => FetchError::DateRangeTooWide,
        ErrorKind::SymbolNotListed => FetchError::SymbolNotListed(short),
        ErrorKind::TimeframeUnsupported => FetchError::TimeframeUnsupported(short),
        ErrorKind::Permanent => FetchError::Permanent(short),
        ErrorKind::Transient => FetchError::Transient(short),
        _ => FetchError::Unknown(short),
    }
}

fn truncate(message: &str, max: usize) -> String {
    if message.len() <= max {
        message.to_string()
    } else {
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

/// Dictionnaire global de classification, complété par les descripteurs
/// et surchargé par le fichier opérateur éventuel
fn default_error_rules() -> Vec<ErrorRule> {
    let rules = [
        ("too many requests", ErrorKind::RateLimitExceeded),
        ("rate limit", ErrorKind::RateLimitExceeded),
        ("too much request weight", ErrorKind::RateLimitExceeded),
        ("time range", ErrorKind::DateRangeTooWide),
        ("range is too", ErrorKind::DateRangeTooWide),
        ("too wide", ErrorKind::DateRangeTooWide),
        ("invalid symbol", ErrorKind::SymbolNotListed),
        ("unknown asset pair", ErrorKind::SymbolNotListed),
        ("instrument not found", ErrorKind::SymbolNotListed),
        ("symbol not found", ErrorKind::SymbolNotListed),
        ("invalid interval", ErrorKind::TimeframeUnsupported),
        ("invalid period", ErrorKind::TimeframeUnsupported),
        ("unknown interval", ErrorKind::TimeframeUnsupported),
        ("timeout", ErrorKind::Transient),
        ("temporarily unavailable", ErrorKind::Transient),
        ("service unavailable", ErrorKind::Transient),
        ("internal error", ErrorKind::Transient),
        ("invalid api key", ErrorKind::Permanent),
        ("permission denied", ErrorKind::Permanent),
        ("delisted", ErrorKind::Permanent),
    ];
    rules
        .into_iter()
        .map(|(contains, kind)| ErrorRule {
            contains: contains.to_string(),
            kind,
        })
        .collect()
}

/// Descripteurs intégrés
pub fn builtin_descriptors() -> Vec<ExchangeDescriptor> {
    vec![binance_descriptor(), bybit_descriptor(), kraken_descriptor()]
}

fn binance_descriptor() -> ExchangeDescriptor {
    let interval_labels = Timeframe::all()
        .iter()
        .map(|tf| (*tf, tf.as_str().to_string()))
        .collect();
    ExchangeDescriptor {
        exchange_id: "binance".to_string(),
        display_name: "Binance".to_string(),
        base_url: "https://api.binance.com".to_string(),
        klines_path: "/api/v3/klines".to_string(),
        klines_query: vec![
            ("symbol".to_string(), "{symbol}".to_string()),
            ("interval".to_string(), "{interval}".to_string()),
            ("startTime".to_string(), "{since}".to_string()),
            ("limit".to_string(), "{limit}".to_string()),
        ],
        data_pointer: String::new(),
        columns: KlineColumns {
            time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 5,
        },
        timestamp_unit: TimestampUnit::Milliseconds,
        symbols_path: "/api/v3/exchangeInfo".to_string(),
        symbols_pointer: "/symbols".to_string(),
        symbol_field: "symbol".to_string(),
        symbol_join: String::new(),
        interval_labels,
        max_candles_per_call: 1_000,
        default_rate_limit: RateLimitSpec {
            limit: 1_200,
            period_ms: 60_000,
            min_delay_ms: 50,
        },
        ohlcv_supported: true,
        earliest_hint_ms: Some(1_500_000_000_000), // mi-2017
        error_rules: vec![ErrorRule {
            contains: "Too much request weight used".to_string(),
            kind: ErrorKind::RateLimitExceeded,
        }],
    }
}

fn bybit_descriptor() -> ExchangeDescriptor {
    let pairs = [
        (Timeframe::M1, "1"),
        (Timeframe::M3, "3"),
        (Timeframe::M5, "5"),
        (Timeframe::M15, "15"),
        (Timeframe::M30, "30"),
        (Timeframe::H1, "60"),
        (Timeframe::H2, "120"),
        (Timeframe::H4, "240"),
        (Timeframe::H6, "360"),
        (Timeframe::H12, "720"),
        (Timeframe::D1, "D"),
        (Timeframe::W1, "W"),
        (Timeframe::Mo1, "M"),
    ];
    ExchangeDescriptor {
        exchange_id: "bybit".to_string(),
        display_name: "Bybit".to_string(),
        base_url: "https://api.bybit.com".to_string(),
        klines_path: "/v5/market/kline".to_string(),
        klines_query: vec![
            ("category".to_string(), "spot".to_string()),
            ("symbol".to_string(), "{symbol}".to_string()),
            ("interval".to_string(), "{interval}".to_string()),
            ("start".to_string(), "{since}".to_string()),
            ("limit".to_string(), "{limit}".to_string()),
        ],
        data_pointer: "/result/list".to_string(),
        columns: KlineColumns {
            time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 5,
        },
        timestamp_unit: TimestampUnit::Milliseconds,
        symbols_path: "/v5/market/instruments-info?category=spot".to_string(),
        symbols_pointer: "/result/list".to_string(),
        symbol_field: "symbol".to_string(),
        symbol_join: String::new(),
        interval_labels: pairs
            .into_iter()
            .map(|(tf, label)| (tf, label.to_string()))
            .collect(),
        max_candles_per_call: 1_000,
        default_rate_limit: RateLimitSpec {
            limit: 120,
            period_ms: 5_000,
            min_delay_ms: 50,
        },
        ohlcv_supported: true,
        earliest_hint_ms: Some(1_538_352_000_000), // octobre 2018
        error_rules: vec![ErrorRule {
            contains: "Invalid symbol".to_string(),
            kind: ErrorKind::SymbolNotListed,
        }],
    }
}

fn kraken_descriptor() -> ExchangeDescriptor {
    let pairs = [
        (Timeframe::M1, "1"),
        (Timeframe::M5, "5"),
        (Timeframe::M15, "15"),
        (Timeframe::M30, "30"),
        (Timeframe::H1, "60"),
        (Timeframe::H4, "240"),
        (Timeframe::D1, "1440"),
        (Timeframe::W1, "10080"),
    ];
    ExchangeDescriptor {
        exchange_id: "kraken".to_string(),
        display_name: "Kraken".to_string(),
        base_url: "https://api.kraken.com".to_string(),
        klines_path: "/0/public/OHLC".to_string(),
        // Kraken n'a pas de paramètre limit: la page est bornée côté serveur
        klines_query: vec![
            ("pair".to_string(), "{symbol}".to_string()),
            ("interval".to_string(), "{interval}".to_string()),
            ("since".to_string(), "{since}".to_string()),
        ],
        data_pointer: "/result".to_string(),
        // [time, open, high, low, close, vwap, volume, count]
        columns: KlineColumns {
            time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 6,
        },
        timestamp_unit: TimestampUnit::Seconds,
        symbols_path: "/0/public/AssetPairs".to_string(),
        symbols_pointer: "/result".to_string(),
        symbol_field: "wsname".to_string(),
        symbol_join: String::new(),
        interval_labels: pairs
            .into_iter()
            .map(|(tf, label)| (tf, label.to_string()))
            .collect(),
        max_candles_per_call: 720,
        default_rate_limit: RateLimitSpec {
            limit: 15,
            period_ms: 45_000,
            min_delay_ms: 1_000,
        },
        ohlcv_supported: true,
        earliest_hint_ms: Some(1_378_339_200_000), // septembre 2013
        error_rules: vec![ErrorRule {
            contains: "Unknown asset pair".to_string(),
            kind: ErrorKind::SymbolNotListed,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HttpExchangeAdapter {
        HttpExchangeAdapter::new()
    }

    #[test]
    fn test_builtin_descriptors() {
        let adapter = adapter();
        assert_eq!(adapter.list_supported(), vec!["binance", "bybit", "kraken"]);

        let info = adapter.describe("bybit").unwrap();
        assert!(info.ohlcv_supported);
        assert_eq!(info.max_candles_per_call, 1_000);
        assert!(info.supported_timeframes.contains(&Timeframe::M5));

        assert!(adapter.describe("ghost").is_none());
    }

    #[test]
    fn test_classification_dictionary() {
        let adapter = adapter();
        let descriptor = adapter.descriptor("binance").cloned();

        assert!(matches!(
            adapter.classify("HTTP 429: Too Many Requests", descriptor.as_ref()),
            FetchError::RateLimitExceeded { .. }
        ));
        assert!(matches!(
            adapter.classify("Invalid symbol.", descriptor.as_ref()),
            FetchError::SymbolNotListed(_)
        ));
        assert!(matches!(
            adapter.classify("the requested time range is too wide", descriptor.as_ref()),
            FetchError::DateRangeTooWide
        ));
        assert!(matches!(
            adapter.classify("read timeout on upstream", descriptor.as_ref()),
            FetchError::Transient(_)
        ));
        // non classée → Unknown (traitée comme transitoire par l'exécuteur)
        assert!(matches!(
            adapter.classify("quelque chose d'imprévu", descriptor.as_ref()),
            FetchError::Unknown(_)
        ));
    }

    #[test]
    fn test_external_rules_take_precedence() {
        let mut adapter = adapter();
        adapter.merge_error_rules(vec![ErrorRule {
            contains: "quota".to_string(),
            kind: ErrorKind::RateLimitExceeded,
        }]);
        assert!(matches!(
            adapter.classify("daily quota exhausted", None),
            FetchError::RateLimitExceeded { .. }
        ));
    }

    #[test]
    fn test_extract_candle_from_string_cells() {
        // lignes bybit: timestamps et prix en chaînes
        let row: Vec<Value> = vec![
            Value::String("1768893600000".to_string()),
            Value::String("100.5".to_string()),
            Value::String("101.0".to_string()),
            Value::String("99.9".to_string()),
            Value::String("100.7".to_string()),
            Value::String("12.25".to_string()),
        ];
        let columns = KlineColumns {
            time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 5,
        };
        let candle = extract_candle(&row, &columns, TimestampUnit::Milliseconds).unwrap();
        assert_eq!(candle.open_time, 1_768_893_600_000);
        assert_eq!(candle.volume, 12.25);
    }

    #[test]
    fn test_extract_candle_seconds_unit() {
        let row: Vec<Value> = vec![
            serde_json::json!(1_768_893_600),
            serde_json::json!(100.0),
            serde_json::json!(101.0),
            serde_json::json!(99.0),
            serde_json::json!(100.5),
            serde_json::json!("55.1"), // vwap sauté: volume en colonne 6
            serde_json::json!(7.5),
        ];
        let columns = KlineColumns {
            time: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: 6,
        };
        let candle = extract_candle(&row, &columns, TimestampUnit::Seconds).unwrap();
        assert_eq!(candle.open_time, 1_768_893_600_000);
        assert_eq!(candle.volume, 7.5);
    }

    #[test]
    fn test_pointer_resolution() {
        let body = serde_json::json!({ "result": { "XETHZUSD": [[1, 2]], "last": 99 } });
        let node = resolve_pointer(&body, "/result").unwrap();
        // objet conteneur: le premier tableau est la donnée
        let rows = node
            .as_object()
            .unwrap()
            .values()
            .find_map(|v| v.as_array())
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_descriptor_roundtrip_json() {
        // les descripteurs sont des données: sérialisables pour l'opérateur
        let descriptor = kraken_descriptor();
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: ExchangeDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.exchange_id, "kraken");
        assert_eq!(back.columns.volume, 6);
        assert_eq!(back.interval_labels.get(&Timeframe::D1).unwrap(), "1440");
    }
}
