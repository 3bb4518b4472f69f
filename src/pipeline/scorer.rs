//! Composite anomaly scoring for probability moves
//!
//! # Factors
//! - Divergence: Hellinger distance between the Bernoulli distributions at
//!   the previous and current poll
//! - Liquidity pressure: erf-saturated turnover (24h volume / smoothed depth)
//! - Noise: the series' own running sigma, dividing the two above into the
//!   instantaneous energy
//! - Trajectory consistency: |sum| of recent signed energies
//!
//! final = energy * sqrt(consistency + EPSILON)

use super::types::Direction;
use super::welford::EPSILON;
use super::windows::TrajectoryBuffer;
use serde::{Deserialize, Serialize};

/// Per-poll inputs for one series
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub old_probability: f64,
    pub new_probability: f64,
    pub volume_24h: f64,
    pub avg_depth: f64,
    pub sigma: f64,
}

/// Final score plus the components that produced it
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub hellinger: f64,
    pub liquidity_pressure: f64,
    pub instant_energy: f64,
    pub trajectory_consistency: f64,
    pub final_score: f64,
}

#[derive(Debug, Default)]
pub struct CompositeScorer;

impl CompositeScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score one poll and push its signed energy into `trajectory`
    ///
    /// The trajectory is the only state touched here; baseline updates are
    /// the caller's decision because they depend on the ceiling.
    pub fn score(&self, inputs: &ScoreInputs, trajectory: &mut TrajectoryBuffer) -> ScoreBreakdown {
        let p0 = inputs.old_probability;
        let p1 = inputs.new_probability;

        let hellinger = hellinger_distance(p0, p1);
        let liquidity_pressure = liquidity_pressure(inputs.volume_24h, inputs.avg_depth);
        let instant_energy = hellinger * liquidity_pressure / (inputs.sigma.max(0.0) + EPSILON);

        let direction = Direction::between(p0, p1);
        trajectory.push(instant_energy * direction.sign());
        let trajectory_consistency = trajectory.consistency();

        let final_score = instant_energy * (trajectory_consistency + EPSILON).sqrt();

        ScoreBreakdown {
            hellinger,
            liquidity_pressure,
            instant_energy,
            trajectory_consistency,
            final_score,
        }
    }
}

/// Hellinger distance between Bernoulli(p0) and Bernoulli(p1)
///
/// Bounded in [0, 1], exactly zero when p0 == p1, finite at 0 and 1.
pub fn hellinger_distance(p0: f64, p1: f64) -> f64 {
    let p0 = p0.clamp(0.0, 1.0);
    let p1 = p1.clamp(0.0, 1.0);
    if p0 == p1 {
        return 0.0;
    }
    let bhattacharyya = (p1 * p0).sqrt() + ((1.0 - p1) * (1.0 - p0)).sqrt();
    // Rounding can push the coefficient a hair above 1.0
    (1.0 - bhattacharyya).max(0.0).sqrt()
}

/// Turnover ratio mapped into [0, 1)
pub fn liquidity_pressure(volume_24h: f64, avg_depth: f64) -> f64 {
    let turnover = volume_24h.max(0.0) / (avg_depth.max(0.0) + EPSILON);
    erf(turnover)
}

/// Abramowitz & Stegun 7.1.26, max absolute error ~1.5e-7
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}
