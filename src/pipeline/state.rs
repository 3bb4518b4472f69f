//! Per-series detection state
//!
//! One `SeriesState` per tracked market, keyed by `<event_id>:<market_id>`.
//! Created on first sighting, mutated once per poll, checkpointed as a whole
//! record and dropped when the catalog evicts the market.

use super::types::MarketSnapshot;
use super::welford::{OnlineEstimator, SIGMA_FALLBACK, SIGMA_FLOOR};
use super::windows::TrajectoryBuffer;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesState {
    /// Composite series key
    pub series_id: String,

    /// Running mean/variance of the yes probability
    pub estimator: OnlineEstimator,

    /// Exponentially smoothed liquidity
    pub avg_depth: f64,

    /// Signed per-poll energy, capacity = window size
    pub trajectory: TrajectoryBuffer,

    pub last_probability: f64,
    pub last_sigma: f64,
    pub last_volume: f64,

    /// Unix timestamp of the last mutation
    pub updated_at: i64,
}

impl SeriesState {
    pub fn new(series_id: String, window_size: usize) -> Self {
        Self {
            series_id,
            estimator: OnlineEstimator::new(),
            avg_depth: 0.0,
            trajectory: TrajectoryBuffer::new(window_size),
            last_probability: 0.0,
            last_sigma: SIGMA_FALLBACK,
            last_volume: 0.0,
            updated_at: 0,
        }
    }

    /// At least one sample has been accepted
    pub fn is_initialized(&self) -> bool {
        self.estimator.count() > 0
    }

    /// Cold start: seed the baseline from the first observation
    ///
    /// The first sample goes through the estimator so the running mean
    /// starts at the observed probability rather than at zero.
    pub fn initialize(&mut self, snapshot: &MarketSnapshot, now: i64) {
        self.estimator = OnlineEstimator::new();
        self.estimator.update(snapshot.yes_probability);
        self.avg_depth = snapshot.liquidity;
        self.last_probability = snapshot.yes_probability;
        self.last_sigma = self.estimator.sigma();
        self.last_volume = snapshot.volume_24h;
        self.updated_at = now;
    }

    /// Feed an accepted sample into the estimator and smoothed depth
    pub fn update_baseline(&mut self, probability: f64, liquidity: f64, alpha: f64) {
        self.estimator.update(probability);
        self.avg_depth = alpha * liquidity + (1.0 - alpha) * self.avg_depth;
    }

    /// Record the latest observation regardless of baseline acceptance
    pub fn refresh_observation(&mut self, snapshot: &MarketSnapshot, now: i64) {
        self.last_probability = snapshot.yes_probability;
        self.last_volume = snapshot.volume_24h;
        self.last_sigma = self.estimator.sigma().max(SIGMA_FLOOR);
        self.updated_at = now;
    }
}
