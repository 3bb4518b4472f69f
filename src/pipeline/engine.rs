//! Detection engine: per-series state, scoring and alert emission
//!
//! ## Flow
//!
//! ```text
//! Vec<MarketSnapshot>  (validated)
//!     ↓
//! DetectionEngine::process_poll()
//!     ├─ gate: open + any volume minimum met
//!     ├─ first sighting → initialize, no alert
//!     └─ otherwise → CompositeScorer::score()
//!            ├─ score <= ceiling → update baseline
//!            └─ score > threshold → CandidateAlert
//!     ↓
//! Vec<CandidateAlert>
//! ```
//!
//! Every `checkpoint_interval` polls the full state table is written through
//! the `StateStore`. Store failures are logged and never abort a poll.

use super::config::MonitorConfig;
use super::db::StateStore;
use super::scorer::{CompositeScorer, ScoreInputs};
use super::signals::CandidateAlert;
use super::state::SeriesState;
use super::types::MarketSnapshot;
use super::welford::SIGMA_FLOOR;
use std::collections::HashMap;
use std::sync::Arc;

pub struct DetectionEngine {
    /// Per-series state keyed by `<event_id>:<market_id>`
    states: HashMap<String, SeriesState>,

    config: MonitorConfig,

    scorer: CompositeScorer,

    /// Checkpoint target; `None` keeps everything in memory
    store: Option<Arc<dyn StateStore>>,

    /// Polls processed since startup
    cycle_count: u64,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl DetectionEngine {
    /// Create an engine using system time
    ///
    /// When a store is given its persisted states are loaded; a failed load
    /// is logged and the engine starts cold.
    pub fn new(config: MonitorConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        Self::new_with_timestamp_fn(config, store, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Create an engine with a custom timestamp function
    pub fn new_with_timestamp_fn(
        config: MonitorConfig,
        store: Option<Arc<dyn StateStore>>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        let mut states = HashMap::new();

        if let Some(store) = &store {
            match store.load_all() {
                Ok(loaded) => {
                    log::info!("📂 Loaded {} persisted series states", loaded.len());
                    for (series_id, mut state) in loaded {
                        if state.trajectory.capacity() != config.window_size {
                            state.trajectory = state.trajectory.resized(config.window_size);
                        }
                        states.insert(series_id, state);
                    }
                }
                Err(e) => {
                    log::warn!("⚠️  Failed to load persisted states, starting cold: {}", e);
                }
            }
        }

        Self {
            states,
            config,
            scorer: CompositeScorer::new(),
            store,
            cycle_count: 0,
            now_fn,
        }
    }

    /// Open, and at least one volume minimum met
    pub fn should_process(&self, snapshot: &MarketSnapshot) -> bool {
        if !snapshot.is_open() {
            return false;
        }
        snapshot.volume_24h >= self.config.volume_24h_min
            || snapshot.volume_1wk >= self.config.volume_1wk_min
            || snapshot.volume_1mo >= self.config.volume_1mo_min
    }

    /// Score one poll's snapshots and return the alerts that fired
    ///
    /// Each series touches only its own state, so the result for a series
    /// does not depend on where it sits in `snapshots`.
    pub fn process_poll(&mut self, snapshots: &[MarketSnapshot]) -> Vec<CandidateAlert> {
        let now = (self.now_fn)();
        let near_threshold_cutoff = self.config.threshold * 0.5;

        let mut alerts = Vec::new();
        let mut processed = 0usize;
        let mut initialized = 0usize;
        let mut near_threshold = 0usize;
        let mut max_score = 0.0f64;

        // A series listed more than once is scored once, from its last listing
        let mut last_index: HashMap<&str, usize> = HashMap::with_capacity(snapshots.len());
        for (i, snapshot) in snapshots.iter().enumerate() {
            last_index.insert(snapshot.id.as_str(), i);
        }
        if last_index.len() < snapshots.len() {
            log::warn!(
                "⚠️  Poll contains {} duplicate series listings, keeping the last of each",
                snapshots.len() - last_index.len()
            );
        }

        for (i, snapshot) in snapshots.iter().enumerate() {
            if last_index.get(snapshot.id.as_str()) != Some(&i) {
                continue;
            }
            if !self.should_process(snapshot) {
                continue;
            }

            let window_size = self.config.window_size;
            let state = self
                .states
                .entry(snapshot.id.clone())
                .or_insert_with(|| SeriesState::new(snapshot.id.clone(), window_size));

            if !state.is_initialized() {
                state.initialize(snapshot, now);
                initialized += 1;
                continue;
            }

            let volume_delta = (snapshot.volume_24h - state.last_volume).max(0.0);
            let old_probability = state.last_probability;
            let new_probability = snapshot.yes_probability;

            let inputs = ScoreInputs {
                old_probability,
                new_probability,
                volume_24h: snapshot.volume_24h,
                avg_depth: state.avg_depth,
                sigma: state.last_sigma.max(SIGMA_FLOOR),
            };
            let score = self.scorer.score(&inputs, &mut state.trajectory);
            processed += 1;

            if score.final_score <= self.config.ceiling {
                state.update_baseline(new_probability, snapshot.liquidity, self.config.alpha);
            } else {
                log::debug!(
                    "🧱 {} above ceiling ({:.3} > {:.1}), baseline unchanged",
                    snapshot.id,
                    score.final_score,
                    self.config.ceiling
                );
            }

            max_score = max_score.max(score.final_score);
            if score.final_score >= near_threshold_cutoff {
                near_threshold += 1;
                log::debug!(
                    "📈 {}: score={:.3} hellinger={:.4} liq={:.3} energy={:.3} tc={:.3} {:.3}→{:.3} vol24h={:.0} depth={:.0}",
                    snapshot.id,
                    score.final_score,
                    score.hellinger,
                    score.liquidity_pressure,
                    score.instant_energy,
                    score.trajectory_consistency,
                    old_probability,
                    new_probability,
                    snapshot.volume_24h,
                    snapshot.liquidity
                );
            }

            state.refresh_observation(snapshot, now);

            if score.final_score > self.config.threshold {
                alerts.push(CandidateAlert {
                    series_id: snapshot.id.clone(),
                    event_title: snapshot.title.clone(),
                    event_url: snapshot.event_url.clone(),
                    market_question: snapshot.market_question.clone(),
                    score,
                    old_probability,
                    new_probability,
                    probability_delta: (new_probability - old_probability).abs(),
                    volume_delta,
                    liquidity: snapshot.liquidity,
                    detected_at: now,
                });
            }
        }

        log::debug!(
            "🔍 Poll {}: {} scored, {} initialized, max_score={:.3}, {} near threshold (≥{:.1}), {} alerts",
            self.cycle_count + 1,
            processed,
            initialized,
            max_score,
            near_threshold,
            near_threshold_cutoff,
            alerts.len()
        );

        self.cycle_count += 1;
        if self.cycle_count % self.config.checkpoint_interval.max(1) == 0 {
            self.checkpoint();
        }

        alerts
    }

    /// Write every series state to the store
    ///
    /// Returns the number of states saved. Failures are per series and
    /// logged.
    pub fn checkpoint(&self) -> usize {
        let store = match &self.store {
            Some(store) => store,
            None => return 0,
        };

        let mut saved = 0usize;
        let mut failed = 0usize;
        for (series_id, state) in &self.states {
            match store.save(series_id, state) {
                Ok(()) => saved += 1,
                Err(e) => {
                    failed += 1;
                    log::warn!("⚠️  Failed to checkpoint state for {}: {}", series_id, e);
                }
            }
        }

        if failed > 0 {
            log::warn!("💾 Checkpoint: {} saved, {} failed", saved, failed);
        } else {
            log::info!("💾 Checkpoint: {} series states saved", saved);
        }
        saved
    }

    /// Final checkpoint before exit
    pub fn shutdown(&self) -> usize {
        log::info!("🛑 Checkpointing {} series states before shutdown", self.states.len());
        self.checkpoint()
    }

    /// Drop in-memory state for series the catalog no longer holds
    pub fn evict(&mut self, series_ids: &[String]) -> usize {
        let removed = series_ids
            .iter()
            .filter(|id| self.states.remove(id.as_str()).is_some())
            .count();
        if removed > 0 {
            log::debug!("🧹 Evicted {} series states", removed);
        }
        removed
    }

    pub fn state(&self, series_id: &str) -> Option<&SeriesState> {
        self.states.get(series_id)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }
}
