//! Event grouping, top-K ranking and post-processing
//!
//! ```text
//! Vec<CandidateAlert>
//!     ↓ group_by_event()      (strip ":<market_id>", members by score desc)
//! Vec<EventGroup>
//!     ↓ rank_top_k()          (best_score desc, truncate to top_k)
//!     ↓ filter_recently_sent  (cooldown)
//! Vec<EventGroup> ready for the notification sink
//! ```
//!
//! `RankingOrder` selects whether truncation happens before or after the
//! cooldown filter.

use super::config::{MonitorConfig, RankingOrder};
use super::cooldown::CooldownDeduplicator;
use super::signals::{CandidateAlert, EventGroup};
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

/// Cluster alerts by parent event
///
/// Groups come back sorted by best score (ties broken by event id) so the
/// output does not depend on input order.
pub fn group_by_event(alerts: Vec<CandidateAlert>) -> Vec<EventGroup> {
    let mut groups: BTreeMap<String, EventGroup> = BTreeMap::new();

    for alert in alerts {
        let event_id = alert.event_id().to_string();
        let group = groups.entry(event_id.clone()).or_insert_with(|| EventGroup {
            event_id,
            event_title: alert.event_title.clone(),
            event_url: alert.event_url.clone(),
            best_score: 0.0,
            members: Vec::new(),
        });
        group.members.push(alert);
    }

    let mut result: Vec<EventGroup> = groups
        .into_values()
        .map(|mut group| {
            group.members.sort_by(|a, b| {
                by_score_desc(a.final_score(), b.final_score()).then_with(|| a.series_id.cmp(&b.series_id))
            });
            group.refresh_best_score();
            group
        })
        .collect();

    sort_groups(&mut result);
    result
}

fn sort_groups(groups: &mut [EventGroup]) {
    groups.sort_by(|a, b| by_score_desc(a.best_score, b.best_score).then_with(|| a.event_id.cmp(&b.event_id)));
}

/// Sort by best score and keep the first `top_k`
pub fn rank_top_k(mut groups: Vec<EventGroup>, top_k: usize) -> Vec<EventGroup> {
    sort_groups(&mut groups);
    groups.truncate(top_k);
    groups
}

/// Group, rank and cooldown-filter one poll's alerts
///
/// The cooldown window is `cooldown_multiplier * poll_interval_secs`.
pub fn post_process(
    alerts: Vec<CandidateAlert>,
    dedup: &CooldownDeduplicator,
    config: &MonitorConfig,
    poll_interval_secs: u64,
) -> Vec<EventGroup> {
    let cooldown_secs = (config.cooldown_multiplier as i64).saturating_mul(poll_interval_secs as i64);
    let groups = group_by_event(alerts);

    match config.ranking_order {
        RankingOrder::TruncateThenFilter => {
            let ranked = rank_top_k(groups, config.top_k);
            dedup.filter_recently_sent(ranked, cooldown_secs)
        }
        RankingOrder::FilterThenTruncate => {
            let filtered = dedup.filter_recently_sent(groups, cooldown_secs);
            rank_top_k(filtered, config.top_k)
        }
    }
}
