//! Poll cycle runner and monitor loop
//!
//! One cycle:
//! 1. Fetch the catalog from the `CatalogSource`
//! 2. Validate snapshots, dropping malformed rows
//! 3. Upsert the catalog (cap evictions drop engine state too)
//! 4. `DetectionEngine::process_poll` → candidate alerts
//! 5. `post_process` → ranked, cooldown-filtered groups
//! 6. Send; on success record cooldown state
//! 7. Append every candidate to the alert log, also when the send failed
//!
//! Cycles never overlap: the loop awaits each cycle before the next tick.

use super::cooldown::CooldownDeduplicator;
use super::db::CatalogStore;
use super::engine::DetectionEngine;
use super::error::PipelineError;
use super::gamma::CatalogSource;
use super::notifier::NotificationSink;
use super::ranking::post_process;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub rejected: usize,
    pub evicted: usize,
    pub alerts: usize,
    pub groups_sent: usize,
    pub markets_notified: usize,
}

/// Run one poll cycle end to end
///
/// Fetch and notification failures are returned to the caller. Catalog
/// and alert-log write failures are logged and do not fail the cycle.
pub async fn run_cycle(
    engine: &mut DetectionEngine,
    dedup: &mut CooldownDeduplicator,
    source: &dyn CatalogSource,
    store: &dyn CatalogStore,
    sink: &dyn NotificationSink,
    poll_interval_secs: u64,
) -> Result<CycleReport, PipelineError> {
    let started = Instant::now();
    log::info!("🔄 Starting monitoring cycle");

    let fetched = source.fetch_markets().await?;
    let mut report = CycleReport {
        fetched: fetched.len(),
        ..Default::default()
    };

    let mut snapshots = Vec::with_capacity(fetched.len());
    for snapshot in fetched {
        match snapshot.validate() {
            Ok(()) => snapshots.push(snapshot),
            Err(e) => {
                report.rejected += 1;
                log::warn!("⚠️  Dropping snapshot: {}", e);
            }
        }
    }

    let mut evicted: HashSet<String> = HashSet::new();
    for snapshot in &snapshots {
        match store.upsert_market(snapshot) {
            Ok(ids) => evicted.extend(ids),
            Err(e) => log::warn!("⚠️  Failed to upsert market {}: {}", snapshot.id, e),
        }
    }
    if !evicted.is_empty() {
        let ids: Vec<String> = evicted.iter().cloned().collect();
        report.evicted = engine.evict(&ids);
        snapshots.retain(|s| !evicted.contains(&s.id));
    }

    let alerts = engine.process_poll(&snapshots);
    report.alerts = alerts.len();
    log::info!("📊 Detected {} alerts above threshold", alerts.len());

    let groups = post_process(alerts.clone(), dedup, engine.config(), poll_interval_secs);

    let mut notified: HashSet<&str> = HashSet::new();
    let mut send_result = Ok(());
    if groups.is_empty() {
        log::info!("No alerts above quality bar this cycle");
    } else {
        let member_count: usize = groups.iter().map(|g| g.members.len()).sum();
        log::info!("📬 Post-processed alerts: {} groups ({} markets)", groups.len(), member_count);

        send_result = sink.send(&groups).await;
        if send_result.is_ok() {
            dedup.record_notified(&groups);

            report.groups_sent = groups.len();
            report.markets_notified = member_count;
            notified.extend(groups.iter().flat_map(|g| g.members.iter()).map(|a| a.series_id.as_str()));
        }
    }

    // Logged even when the send failed, with notified = false
    for alert in &alerts {
        if let Err(e) = store.record_alert(alert, notified.contains(alert.series_id.as_str())) {
            log::warn!("⚠️  Failed to log alert for {}: {}", alert.series_id, e);
        }
    }
    send_result?;

    log::info!(
        "✅ Monitoring cycle completed in {:?} ({} fetched, {} rejected, {} alerts)",
        started.elapsed(),
        report.fetched,
        report.rejected,
        report.alerts
    );
    Ok(report)
}

/// Edge of a run of failing cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    FirstFailure,
    Recovered { failures: u32 },
}

/// Counts consecutive failing cycles
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self) -> Option<FailureTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        (self.consecutive_failures == 1).then_some(FailureTransition::FirstFailure)
    }

    pub fn record_success(&mut self) -> Option<FailureTransition> {
        let failures = std::mem::take(&mut self.consecutive_failures);
        (failures > 0).then_some(FailureTransition::Recovered { failures })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Everything the monitor loop owns
pub struct MonitorRuntime {
    pub engine: DetectionEngine,
    pub dedup: CooldownDeduplicator,
    pub source: Arc<dyn CatalogSource>,
    pub store: Arc<dyn CatalogStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub poll_interval_secs: u64,
}

impl MonitorRuntime {
    /// Run a cycle and forward failure transitions to the sink
    ///
    /// A failed cycle is logged and reported to the sink here; callers only
    /// see that no report was produced.
    pub async fn tick(&mut self, tracker: &mut FailureTracker) -> Option<CycleReport> {
        let result = run_cycle(
            &mut self.engine,
            &mut self.dedup,
            self.source.as_ref(),
            self.store.as_ref(),
            self.sink.as_ref(),
            self.poll_interval_secs,
        )
        .await;

        match result {
            Ok(report) => {
                if let Some(FailureTransition::Recovered { failures }) = tracker.record_success() {
                    log::info!("✅ Monitoring recovered after {} failed cycles", failures);
                    if let Err(e) = self.sink.send_recovery(failures).await {
                        log::warn!("⚠️  Failed to send recovery notification: {}", e);
                    }
                }
                Some(report)
            }
            Err(e) => {
                log::error!("❌ Monitoring cycle failed: {}", e);
                if let Some(FailureTransition::FirstFailure) = tracker.record_failure() {
                    if let Err(send_err) = self.sink.send_error(&e.to_string()).await {
                        log::warn!("⚠️  Failed to send error notification: {}", send_err);
                    }
                }
                None
            }
        }
    }

    /// Enforce the catalog cap and drop engine state for evicted markets
    pub fn rotate(&mut self) {
        match self.store.rotate_markets() {
            Ok(evicted) if !evicted.is_empty() => {
                self.engine.evict(&evicted);
            }
            Ok(_) => {}
            Err(e) => log::warn!("⚠️  Failed to rotate markets: {}", e),
        }
    }
}

/// Resolve when `signal` fires
///
/// If the signal listener itself fails, the error is logged and the future
/// never resolves, so the monitor keeps running instead of exiting at once.
pub async fn wait_for_shutdown<F, E>(signal: F)
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match signal.await {
        Ok(()) => log::info!("🛑 Received shutdown signal"),
        Err(e) => {
            log::error!("❌ Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Poll until `shutdown` resolves, then checkpoint
///
/// The first cycle runs immediately; later cycles follow the poll interval
/// and are each followed by a catalog rotation. Returns the runtime after
/// the final checkpoint.
pub async fn run_monitor_loop<F>(mut runtime: MonitorRuntime, shutdown: F) -> MonitorRuntime
where
    F: Future<Output = ()>,
{
    let period = Duration::from_secs(runtime.poll_interval_secs.max(1));
    log::info!("🚀 Starting monitor loop");
    log::info!("   ├─ Poll interval: {}s", period.as_secs());
    log::info!("   ├─ Window size: {}", runtime.engine.config().window_size);
    log::info!("   ├─ Threshold: {:.1}", runtime.engine.config().threshold);
    log::info!("   └─ Top K: {}", runtime.engine.config().top_k);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker = FailureTracker::new();
    let mut first_cycle = true;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("🛑 Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Some(report) = runtime.tick(&mut tracker).await {
                    log::debug!("📋 Cycle report: {:?}", report);
                }
                if !first_cycle {
                    runtime.rotate();
                }
                first_cycle = false;
            }
        }
    }

    runtime.engine.shutdown();
    log::info!("👋 Monitor stopped");
    runtime
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::MonitorConfig;
    use crate::pipeline::db::{SqliteStore, StateStore};
    use crate::pipeline::signals::EventGroup;
    use crate::pipeline::types::fixtures::snapshot;
    use crate::pipeline::types::MarketSnapshot;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    /// Replays scripted polls; an exhausted script returns an empty catalog
    struct ScriptedSource {
        polls: Mutex<VecDeque<Result<Vec<MarketSnapshot>, PipelineError>>>,
        fetched: Notify,
    }

    impl ScriptedSource {
        fn new(polls: Vec<Result<Vec<MarketSnapshot>, PipelineError>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                fetched: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl CatalogSource for ScriptedSource {
        async fn fetch_markets(&self) -> Result<Vec<MarketSnapshot>, PipelineError> {
            let next = self.polls.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()));
            self.fetched.notify_one();
            next
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<EventGroup>>>,
        errors: Mutex<Vec<String>>,
        recoveries: Mutex<Vec<u32>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, groups: &[EventGroup]) -> Result<(), PipelineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::Notification("chat unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(groups.to_vec());
            Ok(())
        }

        async fn send_error(&self, message: &str) -> Result<(), PipelineError> {
            self.errors.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn send_recovery(&self, failure_count: u32) -> Result<(), PipelineError> {
            self.recoveries.lock().unwrap().push(failure_count);
            Ok(())
        }
    }

    fn open_store(dir: &TempDir, max_markets: usize) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open(&dir.path().join("cycle.db"), SCHEMA_DIR, max_markets).unwrap())
    }

    fn engine_with(store: Arc<SqliteStore>) -> DetectionEngine {
        let store: Arc<dyn StateStore> = store;
        DetectionEngine::new_with_timestamp_fn(MonitorConfig::default(), Some(store), Box::new(|| 1_700_000_000))
    }

    fn dedup() -> CooldownDeduplicator {
        CooldownDeduplicator::new_with_timestamp_fn(Box::new(|| 1_700_000_000))
    }

    #[test]
    fn test_failure_tracker_transitions() {
        let mut tracker = FailureTracker::new();
        assert_eq!(tracker.record_success(), None);
        assert_eq!(tracker.record_failure(), Some(FailureTransition::FirstFailure));
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.consecutive_failures(), 3);
        assert_eq!(tracker.record_success(), Some(FailureTransition::Recovered { failures: 3 }));
        assert_eq!(tracker.record_success(), None);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_ignores_broken_listener() {
        let fired = tokio::time::timeout(
            Duration::from_millis(20),
            wait_for_shutdown(async { Ok::<(), std::io::Error>(()) }),
        )
        .await;
        assert!(fired.is_ok());

        let broken = tokio::time::timeout(
            Duration::from_millis(20),
            wait_for_shutdown(async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "no handler")) }),
        )
        .await;
        assert!(broken.is_err(), "a failed listener must not stop the monitor");
    }

    #[tokio::test]
    async fn test_cycle_sends_and_records_cooldown() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let mut engine = engine_with(store.clone());
        let mut dedup = dedup();
        let sink = RecordingSink::default();

        let source = ScriptedSource::new(vec![
            Ok(vec![snapshot("e:m", 0.5, 100_000.0, 50_000.0)]),
            Ok(vec![snapshot("e:m", 0.7, 150_000.0, 50_000.0)]),
            Ok(vec![snapshot("e:m", 0.8, 160_000.0, 50_000.0)]),
        ]);

        let first = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert_eq!(first.alerts, 0);
        assert!(sink.sent.lock().unwrap().is_empty());

        let second = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert_eq!(second.alerts, 1);
        assert_eq!(second.groups_sent, 1);
        assert!(dedup.record("e:m").is_some());

        // Same direction inside the cooldown: detected but not sent again
        let third = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert_eq!(third.alerts, 1);
        assert_eq!(third.groups_sent, 0);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        assert_eq!(store.top_alerts(10).unwrap().len(), 2);
        assert_eq!(store.notified_alert_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_snapshots_are_dropped() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let mut engine = engine_with(store.clone());
        let mut dedup = dedup();
        let sink = RecordingSink::default();

        let mut bad = snapshot("e:bad", 0.5, 100_000.0, 50_000.0);
        bad.yes_probability = 1.4;
        let source = ScriptedSource::new(vec![Ok(vec![bad, snapshot("e:ok", 0.5, 100_000.0, 50_000.0)])]);

        let report = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.rejected, 1);
        assert!(engine.state("e:bad").is_none());
        assert!(engine.state("e:ok").is_some());
        assert_eq!(store.market_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_fails_cycle_without_recording() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let mut engine = engine_with(store.clone());
        let mut dedup = dedup();
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::SeqCst);

        let source = ScriptedSource::new(vec![
            Ok(vec![snapshot("e:m", 0.5, 100_000.0, 50_000.0)]),
            Ok(vec![snapshot("e:m", 0.7, 150_000.0, 50_000.0)]),
        ]);
        run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        let result = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await;

        assert!(matches!(result, Err(PipelineError::Notification(_))));
        assert!(dedup.is_empty());

        // The alert is still in the log, marked as not notified
        let logged = store.top_alerts(10).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].series_id, "e:m");
        assert_eq!(store.notified_alert_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let mut engine = engine_with(store.clone());
        let mut dedup = dedup();
        let sink = RecordingSink::default();

        let source = ScriptedSource::new(vec![
            Ok(vec![snapshot("e:m", 0.5, 100_000.0, 50_000.0)]),
            Err(PipelineError::Api("server error (status 503)".to_string())),
        ]);
        run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        let before = engine.state("e:m").cloned();
        let cycles = engine.cycle_count();

        assert!(run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.is_err());
        assert_eq!(engine.state("e:m").cloned(), before);
        assert_eq!(engine.cycle_count(), cycles);
    }

    #[tokio::test]
    async fn test_catalog_eviction_drops_engine_state() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);
        let mut engine = engine_with(store.clone());
        let mut dedup = dedup();
        let sink = RecordingSink::default();

        let mut oldest = snapshot("e:a", 0.5, 100_000.0, 50_000.0);
        oldest.last_updated -= 100;
        let source = ScriptedSource::new(vec![
            Ok(vec![oldest.clone(), snapshot("e:b", 0.5, 100_000.0, 50_000.0)]),
            Ok(vec![oldest, snapshot("e:b", 0.5, 100_000.0, 50_000.0), snapshot("e:c", 0.5, 100_000.0, 50_000.0)]),
        ]);

        run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert!(engine.state("e:a").is_some());

        let report = run_cycle(&mut engine, &mut dedup, &source, store.as_ref(), &sink, 3600).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(engine.state("e:a").is_none());
        assert!(engine.state("e:c").is_some());
        assert_eq!(store.market_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_monitor_loop_reports_transitions_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 100);
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![snapshot("e:m", 0.5, 100_000.0, 50_000.0)])]));

        let mut runtime = MonitorRuntime {
            engine: engine_with(store.clone()),
            dedup: dedup(),
            source: source.clone(),
            store: store.clone(),
            sink: sink.clone(),
            poll_interval_secs: 3600,
        };

        let mut tracker = FailureTracker::new();
        source.polls.lock().unwrap().push_front(Err(PipelineError::Api("timeout".to_string())));
        assert!(runtime.tick(&mut tracker).await.is_none());
        assert_eq!(sink.errors.lock().unwrap().len(), 1);
        assert!(runtime.tick(&mut tracker).await.is_some());
        assert_eq!(*sink.recoveries.lock().unwrap(), vec![1]);

        // Drain the permit left by the manual ticks
        source.fetched.notified().await;

        // One immediate cycle, then shut down once it has fetched
        let waiter = source.clone();
        let runtime = run_monitor_loop(runtime, async move { waiter.fetched.notified().await }).await;

        assert_eq!(runtime.engine.cycle_count(), 2);
        let persisted = store.load_all().unwrap();
        assert!(persisted.contains_key("e:m"));
    }
}
