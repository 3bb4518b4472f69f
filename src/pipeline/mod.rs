//! # Odds Movement Detection Pipeline
//!
//! Polls a prediction-market catalog, scores each market's probability move
//! against its own history, and notifies about the most notable movements.
//!
//! ## Cycle
//!
//! ```text
//! CatalogSource::fetch_markets()
//!     ↓ validate + upsert (catalog cap)
//! DetectionEngine::process_poll()
//!     ↓ Vec<CandidateAlert>
//! post_process(): group by event → top-K ↔ cooldown filter
//!     ↓ Vec<EventGroup>
//! NotificationSink::send() → CooldownDeduplicator::record_notified()
//! ```
//!
//! ## Module Organization
//!
//! - `types` - `MarketSnapshot` and direction helpers
//! - `welford` / `windows` / `scorer` - streaming statistics and the composite score
//! - `state` - per-series baseline and trajectory
//! - `engine` - detection engine with periodic checkpoints
//! - `signals` / `ranking` / `cooldown` - alert grouping, top-K and dedup
//! - `db` - SQLite persistence (schema in `/sql/`)
//! - `gamma` / `notifier` - catalog API and Telegram collaborators
//! - `ingestion` - cycle runner and monitor loop

pub mod backoff;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod engine;
pub mod error;
pub mod gamma;
pub mod ingestion;
pub mod notifier;
pub mod ranking;
pub mod scorer;
pub mod signals;
pub mod state;
pub mod types;
pub mod welford;
pub mod windows;

// Re-export commonly used types
pub use config::{MonitorConfig, OddsflowConfig, RankingOrder};
pub use cooldown::CooldownDeduplicator;
pub use db::{CatalogStore, SqliteStore, StateStore};
pub use engine::DetectionEngine;
pub use error::PipelineError;
pub use gamma::{CatalogSource, GammaCatalog};
pub use ingestion::{run_cycle, run_monitor_loop, wait_for_shutdown, MonitorRuntime};
pub use notifier::{LogSink, NotificationSink, TelegramSink};
pub use ranking::post_process;
pub use signals::{CandidateAlert, EventGroup};
pub use types::{Direction, MarketSnapshot};
