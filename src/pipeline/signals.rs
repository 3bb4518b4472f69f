//! Alert types emitted by the detection engine
//!
//! `CandidateAlert` is immutable once produced. `EventGroup` is rebuilt
//! every poll and never persisted.

use super::scorer::ScoreBreakdown;
use super::types::{extract_event_id, Direction};
use serde::{Deserialize, Serialize};

/// A series whose composite score crossed the alert threshold this poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAlert {
    pub series_id: String,
    pub event_title: String,
    pub event_url: String,
    pub market_question: String,

    /// Final score and its components
    pub score: ScoreBreakdown,

    pub old_probability: f64,
    pub new_probability: f64,

    /// |new - old|
    pub probability_delta: f64,

    /// 24h volume change since the previous poll, floored at zero
    pub volume_delta: f64,

    pub liquidity: f64,

    /// Unix timestamp (seconds)
    pub detected_at: i64,
}

impl CandidateAlert {
    pub fn direction(&self) -> Direction {
        Direction::between(self.old_probability, self.new_probability)
    }

    pub fn final_score(&self) -> f64 {
        self.score.final_score
    }

    pub fn event_id(&self) -> &str {
        extract_event_id(&self.series_id)
    }
}

/// All alerts sharing a parent event in one poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    pub event_id: String,
    pub event_title: String,
    pub event_url: String,

    /// Maximum member score
    pub best_score: f64,

    /// Sorted by score, highest first
    pub members: Vec<CandidateAlert>,
}

impl EventGroup {
    /// Recompute `best_score` after the member list changed
    pub fn refresh_best_score(&mut self) {
        self.best_score = self
            .members
            .iter()
            .map(|m| m.final_score())
            .fold(f64::NEG_INFINITY, f64::max);
        if self.members.is_empty() {
            self.best_score = 0.0;
        }
    }
}
