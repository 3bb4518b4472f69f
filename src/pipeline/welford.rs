//! Online mean/variance estimator (Welford)
//!
//! Tracks the noise level of a probability series without keeping any
//! sample history:
//!   M_n = M_{n-1} + (x_n - M_{n-1}) / n
//!   S_n = S_{n-1} + (x_n - M_{n-1}) (x_n - M_n)
//!   Var = S_n / (n - 1)

use serde::{Deserialize, Serialize};

/// Additive guard used by every division in the scoring path
pub const EPSILON: f64 = 1e-9;

/// Minimum noise estimate. Stops a collapsed variance from turning tiny
/// fluctuations into extreme energy readings.
pub const SIGMA_FLOOR: f64 = 0.005;

/// Noise estimate reported before two samples exist
pub const SIGMA_FALLBACK: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineEstimator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl OnlineEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted internals
    pub fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self {
            count,
            mean,
            m2: m2.max(0.0),
        }
    }

    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Sample variance (n - 1 denominator), `None` below two samples
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        Some(self.m2 / (self.count - 1) as f64)
    }

    /// Current noise estimate, never below `SIGMA_FLOOR`
    pub fn sigma(&self) -> f64 {
        match self.variance() {
            Some(variance) => variance.max(0.0).sqrt().max(SIGMA_FLOOR),
            None => SIGMA_FALLBACK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_below_two_samples() {
        let mut est = OnlineEstimator::new();
        assert_eq!(est.sigma(), SIGMA_FALLBACK);

        est.update(0.42);
        assert_eq!(est.count(), 1);
        assert_eq!(est.sigma(), SIGMA_FALLBACK);
        assert!(est.variance().is_none());
    }

    #[test]
    fn test_constant_series_hits_floor() {
        let mut est = OnlineEstimator::new();
        for _ in 0..25 {
            est.update(0.37);
        }
        assert_eq!(est.variance(), Some(0.0));
        assert_eq!(est.sigma(), SIGMA_FLOOR);
    }

    #[test]
    fn test_small_deviation_is_floored() {
        // True sample std is 0.001, below the floor
        let mut est = OnlineEstimator::new();
        for p in [0.500, 0.501, 0.502] {
            est.update(p);
        }
        assert_eq!(est.sigma(), SIGMA_FLOOR);
    }

    #[test]
    fn test_matches_closed_form() {
        let samples = [0.2, 0.4, 0.6];
        let mut est = OnlineEstimator::new();
        for s in samples {
            est.update(s);
        }

        assert!((est.mean() - 0.4).abs() < 1e-12);
        assert!((est.variance().unwrap() - 0.04).abs() < 1e-12);
        assert!((est.sigma() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_from_parts_round_trips_internals() {
        let mut est = OnlineEstimator::new();
        for s in [0.1, 0.3, 0.2, 0.5] {
            est.update(s);
        }
        let restored = OnlineEstimator::from_parts(est.count(), est.mean(), est.m2());
        assert_eq!(restored, est);
        assert_eq!(restored.sigma(), est.sigma());
    }
}
