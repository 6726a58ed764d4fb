/// Bibliothèque principale du collecteur de chandeliers multi-exchange
///
/// Cette bibliothèque expose tous les modules nécessaires pour planifier,
/// récupérer et stocker des séries OHLCV continues depuis les API
/// publiques des exchanges.
// Déclaration des modules publics
pub mod adapter;
pub mod alerts;
pub mod candle;
pub mod chunk_store;
pub mod config;
pub mod connectors;
pub mod database;
pub mod errors;
pub mod executor;
pub mod jobs;
pub mod rate_limiter;
pub mod timeframe;
pub mod utils;
pub mod verify;
pub mod worker;
