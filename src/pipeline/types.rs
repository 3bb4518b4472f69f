//! Catalog input types
//!
//! A `MarketSnapshot` is one binary market as seen by a single poll. The
//! catalog source builds them, `validate()` rejects malformed rows at the
//! boundary, and only validated snapshots ever reach the detection engine.

use super::error::PipelineError;
use serde::{Deserialize, Serialize};

/// One tracked binary-outcome market at poll time
///
/// `id` is the composite series key `<event_id>:<market_id>`. Volumes and
/// liquidity are USD amounts reported by the upstream catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub id: String,
    pub event_id: String,
    pub market_id: String,
    pub market_question: String,
    pub title: String,
    pub event_url: String,
    pub category: String,
    pub yes_probability: f64,
    pub no_probability: f64,
    pub volume_24h: f64,
    pub volume_1wk: f64,
    pub volume_1mo: f64,
    pub liquidity: f64,
    pub active: bool,
    pub closed: bool,
    /// Unix timestamp (seconds) of this observation
    pub last_updated: i64,
    /// Unix timestamp (seconds) of the first time the market was catalogued
    pub created_at: i64,
}

impl MarketSnapshot {
    /// Build the composite series key for a market inside an event
    pub fn composite_id(event_id: &str, market_id: &str) -> String {
        format!("{}:{}", event_id, market_id)
    }

    /// Active and not yet resolved
    pub fn is_open(&self) -> bool {
        self.active && !self.closed
    }

    /// Reject snapshots that must never be scored
    ///
    /// Probabilities must lie in [0, 1] and yes + no must be within 0.01 of
    /// 1.0. Volumes and liquidity must not be negative.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidSnapshot(format!("{}: {}", self.id, msg)));

        if self.id.is_empty() {
            return Err(PipelineError::InvalidSnapshot("series id must not be empty".to_string()));
        }
        if self.event_id.is_empty() {
            return invalid("event id must not be empty");
        }
        if self.title.is_empty() {
            return invalid("title must not be empty");
        }
        if self.category.is_empty() {
            return invalid("category must not be empty");
        }
        if !(0.0..=1.0).contains(&self.yes_probability) {
            return invalid("yes probability must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.no_probability) {
            return invalid("no probability must be between 0.0 and 1.0");
        }
        let sum = self.yes_probability + self.no_probability;
        if !(0.99..=1.01).contains(&sum) {
            return invalid("yes + no probability should approximately equal 1.0");
        }
        // NaN fails every range check above except these, so test them as negations
        if !(self.volume_24h >= 0.0) || !(self.volume_1wk >= 0.0) || !(self.volume_1mo >= 0.0) {
            return invalid("volume must not be negative");
        }
        if !(self.liquidity >= 0.0) {
            return invalid("liquidity must not be negative");
        }
        if self.created_at > self.last_updated {
            return invalid("created at must be <= last updated");
        }
        Ok(())
    }
}

/// Direction of a probability move between two polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Increase,
    Decrease,
    NoChange,
}

impl Direction {
    pub fn between(old_probability: f64, new_probability: f64) -> Self {
        if new_probability > old_probability {
            Direction::Increase
        } else if new_probability < old_probability {
            Direction::Decrease
        } else {
            Direction::NoChange
        }
    }

    /// +1 rising, -1 falling, 0 unchanged
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Increase => 1.0,
            Direction::Decrease => -1.0,
            Direction::NoChange => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Decrease => "decrease",
            Direction::NoChange => "no_change",
        }
    }
}

/// Strip the trailing `:<market_id>` from a composite series key
///
/// Keys without a separator are their own event.
pub fn extract_event_id(series_id: &str) -> &str {
    match series_id.rsplit_once(':') {
        Some((event_id, _)) => event_id,
        None => series_id,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::MarketSnapshot;

    /// Snapshot builder used across the pipeline tests
    pub fn snapshot(id: &str, yes: f64, volume_24h: f64, liquidity: f64) -> MarketSnapshot {
        let (event_id, market_id) = id.rsplit_once(':').unwrap_or((id, id));
        MarketSnapshot {
            id: id.to_string(),
            event_id: event_id.to_string(),
            market_id: market_id.to_string(),
            market_question: format!("Question for {}", market_id),
            title: format!("Event {}", event_id),
            event_url: format!("https://polymarket.com/event/{}", event_id),
            category: "politics".to_string(),
            yes_probability: yes,
            no_probability: 1.0 - yes,
            volume_24h,
            volume_1wk: 0.0,
            volume_1mo: 0.0,
            liquidity,
            active: true,
            closed: false,
            last_updated: 1_700_000_000,
            created_at: 1_699_990_000,
        }
    }
}
