//! Notification cooldown with direction-aware override
//!
//! After an alert is sent for a series, repeats in the same direction are
//! suppressed for `cooldown_secs`. A reversal, or a move into the
//! deterministic zone (p > 0.90 or p < 0.10) from outside it, always
//! goes through.
//!
//! The override is a two-input decision table:
//!
//! | same direction | entering zone | decision         |
//! |----------------|---------------|------------------|
//! | yes            | no            | Suppress         |
//! | yes            | yes           | AllowZoneEntry   |
//! | no             | no            | AllowReversal    |
//! | no             | yes           | AllowReversal    |

use super::signals::{CandidateAlert, EventGroup};
use super::types::Direction;
use std::collections::HashMap;

/// Upper bound of the low-conviction side of the deterministic zone
pub const ZONE_LOW: f64 = 0.10;

/// Lower bound of the high-conviction side of the deterministic zone
pub const ZONE_HIGH: f64 = 0.90;

/// Last successfully sent alert for one series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotificationRecord {
    pub direction: Direction,
    pub new_probability: f64,
    /// Unix timestamp (seconds)
    pub sent_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// No record, or the record is older than the cooldown window
    Allow,
    Suppress,
    AllowReversal,
    AllowZoneEntry,
}

impl CooldownDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, CooldownDecision::Suppress)
    }
}

pub fn is_deterministic_zone(probability: f64) -> bool {
    probability > ZONE_HIGH || probability < ZONE_LOW
}

/// Outcome for an alert that falls inside an active cooldown window
pub fn decision_table(same_direction: bool, entering_zone: bool) -> CooldownDecision {
    match (same_direction, entering_zone) {
        (true, false) => CooldownDecision::Suppress,
        (true, true) => CooldownDecision::AllowZoneEntry,
        (false, _) => CooldownDecision::AllowReversal,
    }
}

/// Decide whether `alert` may be sent given the series' last record
pub fn decide(
    alert: &CandidateAlert,
    record: Option<&NotificationRecord>,
    now: i64,
    cooldown_secs: i64,
) -> CooldownDecision {
    let record = match record {
        Some(record) if now - record.sent_at < cooldown_secs => record,
        _ => return CooldownDecision::Allow,
    };

    let same_direction = record.direction == alert.direction();
    let entering_zone =
        is_deterministic_zone(alert.new_probability) && !is_deterministic_zone(record.new_probability);

    decision_table(same_direction, entering_zone)
}

/// Per-series notification records plus the filtering that reads them
///
/// Records are only written by `record_notified`, which the caller invokes
/// after a successful send.
pub struct CooldownDeduplicator {
    records: HashMap<String, NotificationRecord>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl CooldownDeduplicator {
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Used by tests to pin the clock
    pub fn new_with_timestamp_fn(now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self {
            records: HashMap::new(),
            now_fn,
        }
    }

    /// Drop suppressed members; drop groups left empty
    ///
    /// Surviving groups keep their order and get their best score
    /// recomputed from the remaining members.
    pub fn filter_recently_sent(&self, groups: Vec<EventGroup>, cooldown_secs: i64) -> Vec<EventGroup> {
        let now = (self.now_fn)();
        let mut result = Vec::with_capacity(groups.len());

        for mut group in groups {
            let before = group.members.len();
            group.members.retain(|alert| {
                let decision = decide(alert, self.records.get(&alert.series_id), now, cooldown_secs);
                if !decision.is_allowed() {
                    log::debug!("🔇 Cooldown suppressed {} ({})", alert.series_id, alert.direction().as_str());
                } else if decision != CooldownDecision::Allow {
                    log::debug!("🔔 Cooldown override for {}: {:?}", alert.series_id, decision);
                }
                decision.is_allowed()
            });

            if group.members.is_empty() {
                log::debug!("🔇 Dropped event group {} ({} members suppressed)", group.event_id, before);
                continue;
            }
            group.refresh_best_score();
            result.push(group);
        }

        result
    }

    /// Overwrite the record of every alert in `groups` with the current send
    pub fn record_notified(&mut self, groups: &[EventGroup]) {
        let now = (self.now_fn)();
        for alert in groups.iter().flat_map(|g| g.members.iter()) {
            self.records.insert(
                alert.series_id.clone(),
                NotificationRecord {
                    direction: alert.direction(),
                    new_probability: alert.new_probability,
                    sent_at: now,
                },
            );
        }
    }

    pub fn record(&self, series_id: &str) -> Option<&NotificationRecord> {
        self.records.get(series_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for CooldownDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scorer::ScoreBreakdown;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn alert(series_id: &str, old: f64, new: f64, score: f64) -> CandidateAlert {
        CandidateAlert {
            series_id: series_id.to_string(),
            event_title: "Event".to_string(),
            event_url: String::new(),
            market_question: "Question".to_string(),
            score: ScoreBreakdown {
                final_score: score,
                ..Default::default()
            },
            old_probability: old,
            new_probability: new,
            probability_delta: (new - old).abs(),
            volume_delta: 0.0,
            liquidity: 10_000.0,
            detected_at: 0,
        }
    }

    fn group(event_id: &str, members: Vec<CandidateAlert>) -> EventGroup {
        let mut g = EventGroup {
            event_id: event_id.to_string(),
            event_title: "Event".to_string(),
            event_url: String::new(),
            best_score: 0.0,
            members,
        };
        g.refresh_best_score();
        g
    }

    fn dedup_at(clock: Arc<AtomicI64>) -> CooldownDeduplicator {
        CooldownDeduplicator::new_with_timestamp_fn(Box::new(move || clock.load(Ordering::SeqCst)))
    }

    #[test]
    fn test_decision_table_covers_all_cases() {
        assert_eq!(decision_table(true, false), CooldownDecision::Suppress);
        assert_eq!(decision_table(true, true), CooldownDecision::AllowZoneEntry);
        assert_eq!(decision_table(false, false), CooldownDecision::AllowReversal);
        assert_eq!(decision_table(false, true), CooldownDecision::AllowReversal);
    }

    #[test]
    fn test_zone_bounds_are_exclusive() {
        assert!(is_deterministic_zone(0.95));
        assert!(is_deterministic_zone(0.05));
        assert!(!is_deterministic_zone(0.90));
        assert!(!is_deterministic_zone(0.10));
        assert!(!is_deterministic_zone(0.5));
    }

    #[test]
    fn test_decide_without_record_or_after_expiry() {
        let a = alert("e:m", 0.4, 0.6, 5.0);
        assert_eq!(decide(&a, None, 100, 300), CooldownDecision::Allow);

        let record = NotificationRecord {
            direction: Direction::Increase,
            new_probability: 0.55,
            sent_at: 0,
        };
        assert_eq!(decide(&a, Some(&record), 299, 300), CooldownDecision::Suppress);
        assert_eq!(decide(&a, Some(&record), 300, 300), CooldownDecision::Allow);
    }

    #[test]
    fn test_same_direction_suppressed_within_window() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let mut dedup = dedup_at(clock.clone());

        let sent = vec![group("e", vec![alert("e:m", 0.40, 0.50, 5.0)])];
        dedup.record_notified(&sent);

        clock.store(1_100, Ordering::SeqCst);
        let repeat = vec![group("e", vec![alert("e:m", 0.50, 0.60, 6.0)])];
        assert!(dedup.filter_recently_sent(repeat, 300).is_empty());
    }

    #[test]
    fn test_reversal_passes_within_window() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let mut dedup = dedup_at(clock.clone());
        dedup.record_notified(&[group("e", vec![alert("e:m", 0.40, 0.50, 5.0)])]);

        clock.store(1_100, Ordering::SeqCst);
        let reversed = vec![group("e", vec![alert("e:m", 0.50, 0.42, 4.0)])];
        let out = dedup.filter_recently_sent(reversed, 300);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].members[0].series_id, "e:m");
    }

    #[test]
    fn test_zone_entry_passes_within_window() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let mut dedup = dedup_at(clock.clone());
        dedup.record_notified(&[group("e", vec![alert("e:m", 0.70, 0.85, 5.0)])]);

        clock.store(1_100, Ordering::SeqCst);
        let into_zone = vec![group("e", vec![alert("e:m", 0.85, 0.93, 4.0)])];
        assert_eq!(dedup.filter_recently_sent(into_zone, 300).len(), 1);

        // Already in the zone at last send: no override
        dedup.record_notified(&[group("e", vec![alert("e:m", 0.85, 0.93, 4.0)])]);
        let deeper = vec![group("e", vec![alert("e:m", 0.93, 0.97, 4.0)])];
        assert!(dedup.filter_recently_sent(deeper, 300).is_empty());
    }

    #[test]
    fn test_partial_suppression_recomputes_best_score() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let mut dedup = dedup_at(clock.clone());
        dedup.record_notified(&[group("e", vec![alert("e:top", 0.40, 0.50, 9.0)])]);

        clock.store(1_060, Ordering::SeqCst);
        let g = group(
            "e",
            vec![alert("e:top", 0.50, 0.60, 9.0), alert("e:other", 0.30, 0.45, 4.0)],
        );
        assert_eq!(g.best_score, 9.0);

        let out = dedup.filter_recently_sent(vec![g], 300);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].members.len(), 1);
        assert_eq!(out[0].members[0].series_id, "e:other");
        assert_eq!(out[0].best_score, 4.0);
    }

    #[test]
    fn test_filter_does_not_mutate_records() {
        let dedup = dedup_at(Arc::new(AtomicI64::new(0)));
        let out = dedup.filter_recently_sent(vec![group("e", vec![alert("e:m", 0.4, 0.6, 5.0)])], 300);
        assert_eq!(out.len(), 1);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_record_notified_overwrites() {
        let clock = Arc::new(AtomicI64::new(10));
        let mut dedup = dedup_at(clock.clone());
        dedup.record_notified(&[group("e", vec![alert("e:m", 0.4, 0.6, 5.0)])]);

        clock.store(20, Ordering::SeqCst);
        dedup.record_notified(&[group("e", vec![alert("e:m", 0.6, 0.3, 5.0)])]);

        let record = dedup.record("e:m").unwrap();
        assert_eq!(record.direction, Direction::Decrease);
        assert_eq!(record.new_probability, 0.3);
        assert_eq!(record.sent_at, 20);
        assert_eq!(dedup.len(), 1);
    }
}
