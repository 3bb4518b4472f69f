//! Oddsflow monitor
//!
//! Polls the Polymarket gamma API on a fixed interval, scores every open
//! market against its own history and posts notable movements to Telegram.
//!
//! Usage:
//!   cargo run --release --bin oddsflow
//!
//! See `OddsflowConfig::from_env` for the environment variables.

use dotenv::dotenv;
use log::info;
use oddsflow::pipeline::{
    cooldown::CooldownDeduplicator,
    db::{CatalogStore, SqliteStore, StateStore},
    engine::DetectionEngine,
    gamma::{CatalogSource, GammaCatalog},
    ingestion::{run_monitor_loop, wait_for_shutdown, MonitorRuntime},
    notifier::{LogSink, NotificationSink, TelegramSink},
    OddsflowConfig,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Oddsflow monitor");

    let config = OddsflowConfig::from_env()?;
    config.validate()?;

    let db_path = config.storage.resolved_db_path();
    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", db_path.display());
    info!("   ├─ Poll interval: {}s", config.poll_interval_secs);
    info!("   ├─ Categories: {}", config.catalog.categories.join(", "));
    info!(
        "   ├─ Threshold: {:.1} (ceiling {:.1}, window {})",
        config.monitor.threshold, config.monitor.ceiling, config.monitor.window_size
    );
    info!("   ├─ Top-K: {} ({:?})", config.monitor.top_k, config.monitor.ranking_order);
    info!(
        "   └─ Telegram: {}",
        if config.telegram.enabled { "enabled" } else { "disabled (log only)" }
    );

    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteStore::open(
        &db_path,
        &config.storage.schema_dir,
        config.storage.max_markets,
    )?);
    info!("✅ Database initialized");

    let state_store: Arc<dyn StateStore> = store.clone();
    let catalog_store: Arc<dyn CatalogStore> = store;
    let engine = DetectionEngine::new(config.monitor.clone(), Some(state_store));
    info!("✅ DetectionEngine created ({} series restored)", engine.state_count());

    let source: Arc<dyn CatalogSource> = Arc::new(GammaCatalog::new(config.catalog.clone())?);
    let sink: Arc<dyn NotificationSink> = if config.telegram.enabled {
        Arc::new(TelegramSink::new(&config.telegram)?)
    } else {
        Arc::new(LogSink)
    };

    let runtime = MonitorRuntime {
        engine,
        dedup: CooldownDeduplicator::new(),
        source,
        store: catalog_store,
        sink,
        poll_interval_secs: config.poll_interval_secs,
    };

    info!("🔄 Press CTRL+C to shutdown gracefully");
    let runtime = run_monitor_loop(runtime, wait_for_shutdown(tokio::signal::ctrl_c())).await;
    info!("👋 Oddsflow stopped after {} cycles", runtime.engine.cycle_count());

    Ok(())
}
