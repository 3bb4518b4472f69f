//! Polymarket Gamma API catalog source
//!
//! ## API Reference
//!
//! Endpoint: `{gamma_api_url}/events?active=true&closed=false&order=volume24hr&ascending=false&limit=500&offset=N`
//! Returns: array of events, each with nested markets and tags
//!
//! Market prices come as JSON-encoded string arrays inside the event JSON
//! (`outcomes: "[\"Yes\",\"No\"]"`, `outcomePrices: "[\"0.62\",\"0.38\"]"`).

use super::backoff::ExponentialBackoff;
use super::config::CatalogConfig;
use super::error::PipelineError;
use super::types::MarketSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Events requested per page
pub const PAGE_SIZE: usize = 500;

/// Supplies the current catalog once per poll
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_markets(&self) -> Result<Vec<MarketSnapshot>, PipelineError>;
}

/// Event as returned by `/events`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(rename = "volume24hr", default, deserialize_with = "lenient_f64")]
    pub volume_24h: f64,
    #[serde(rename = "volume1wk", default, deserialize_with = "lenient_f64")]
    pub volume_1wk: f64,
    #[serde(rename = "volume1mo", default, deserialize_with = "lenient_f64")]
    pub volume_1mo: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub liquidity: f64,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
    #[serde(default)]
    pub tags: Vec<GammaTag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaTag {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub question: String,
    /// JSON-encoded string array
    #[serde(default)]
    pub outcomes: String,
    /// JSON-encoded string array
    #[serde(rename = "outcomePrices", default)]
    pub outcome_prices: String,
    #[serde(rename = "volume1wk", default, deserialize_with = "lenient_f64")]
    pub volume_1wk: f64,
    #[serde(rename = "volume1mo", default, deserialize_with = "lenient_f64")]
    pub volume_1mo: f64,
}

/// Accept a number, a numeric string or null
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Yes/No prices from a market's encoded outcome arrays
pub fn parse_market_probabilities(market: &GammaMarket) -> Result<(f64, f64), PipelineError> {
    let outcomes: Vec<String> = serde_json::from_str(&market.outcomes)?;
    let prices: Vec<String> = serde_json::from_str(&market.outcome_prices)?;

    let mut yes = 0.0;
    let mut no = 0.0;
    for (outcome, price) in outcomes.iter().zip(prices.iter()) {
        let price: f64 = price
            .trim()
            .parse()
            .map_err(|_| PipelineError::Api(format!("bad outcome price '{}' for market {}", price, market.id)))?;
        match outcome.as_str() {
            "Yes" => yes = price,
            "No" => no = price,
            _ => {}
        }
    }
    Ok((yes, no))
}

/// Convert a page of events into snapshots
///
/// Events whose tags match none of `categories` are skipped. Markets that
/// fail to parse or carry no prices are skipped.
pub fn events_to_snapshots(events: &[GammaEvent], categories: &[String], now: i64) -> Vec<MarketSnapshot> {
    let wanted: HashSet<&str> = categories.iter().map(|c| c.as_str()).collect();
    let mut snapshots = Vec::new();

    for event in events {
        if !wanted.is_empty() && !event.tags.iter().any(|t| wanted.contains(t.slug.as_str())) {
            continue;
        }

        let category = event
            .tags
            .iter()
            .find(|t| wanted.contains(t.slug.as_str()))
            .or_else(|| event.tags.first())
            .map(|t| t.slug.clone())
            .unwrap_or_default();

        for market in &event.markets {
            let (yes, no) = match parse_market_probabilities(market) {
                Ok(prices) => prices,
                Err(e) => {
                    log::debug!("Skipping market {}:{}: {}", event.id, market.id, e);
                    continue;
                }
            };
            if yes == 0.0 && no == 0.0 {
                continue;
            }

            // Market 24h volume is not reported; estimate it from the weekly share
            let volume_24h = if event.volume_1wk > 0.0 && market.volume_1wk > 0.0 {
                event.volume_24h * (market.volume_1wk / event.volume_1wk)
            } else {
                event.volume_24h
            };

            snapshots.push(MarketSnapshot {
                id: MarketSnapshot::composite_id(&event.id, &market.id),
                event_id: event.id.clone(),
                market_id: market.id.clone(),
                market_question: market.question.clone(),
                title: event.title.clone(),
                event_url: format!("https://polymarket.com/event/{}", event.slug),
                category: category.clone(),
                yes_probability: yes,
                no_probability: no,
                volume_24h,
                volume_1wk: market.volume_1wk,
                volume_1mo: market.volume_1mo,
                liquidity: event.liquidity,
                active: event.active && !event.closed,
                closed: event.closed,
                last_updated: now,
                created_at: now,
            });
        }
    }

    snapshots
}

/// Gamma API client
pub struct GammaCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
}

impl GammaCatalog {
    pub fn new(config: CatalogConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.config.gamma_api_url.trim_end_matches('/'))
    }

    /// GET one page, retrying transport errors and 5xx responses
    async fn fetch_page(&self, offset: usize) -> Result<Vec<GammaEvent>, PipelineError> {
        let url = self.events_url();
        let query = [
            ("active", "true".to_string()),
            ("closed", "false".to_string()),
            ("limit", PAGE_SIZE.to_string()),
            ("offset", offset.to_string()),
            ("order", "volume24hr".to_string()),
            ("ascending", "false".to_string()),
        ];

        let mut backoff = ExponentialBackoff::new(
            self.config.retry_delay_ms,
            self.config.retry_delay_ms.saturating_mul(8),
            self.config.max_retries,
        );

        loop {
            let result = self
                .client
                .get(&url)
                .query(&query)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("⚠️  Gamma request failed (offset {}): {}", offset, e);
                    if backoff.sleep().await.is_err() {
                        return Err(PipelineError::Http(e));
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                log::warn!("⚠️  Gamma server error {} (offset {})", status, offset);
                if backoff.sleep().await.is_err() {
                    return Err(PipelineError::Api(format!("server error (status {})", status)));
                }
                continue;
            }
            if !status.is_success() {
                return Err(PipelineError::Api(format!("client error (status {})", status)));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.is_empty() && !content_type.starts_with("application/json") {
                return Err(PipelineError::Api(format!(
                    "unexpected content type: {} (expected application/json)",
                    content_type
                )));
            }

            let body = response.text().await?;
            return Ok(serde_json::from_str(&body)?);
        }
    }
}

#[async_trait]
impl CatalogSource for GammaCatalog {
    async fn fetch_markets(&self) -> Result<Vec<MarketSnapshot>, PipelineError> {
        let now = chrono::Utc::now().timestamp();
        let limit = self.config.fetch_limit;
        let max_fetch = limit.saturating_mul(3);

        let mut snapshots = Vec::new();
        let mut offset = 0usize;

        while offset < max_fetch {
            let events = self.fetch_page(offset).await?;
            let page_len = events.len();
            if page_len == 0 {
                break;
            }

            snapshots.extend(events_to_snapshots(&events, &self.config.categories, now));

            if page_len < PAGE_SIZE || snapshots.len() >= max_fetch {
                break;
            }
            offset += PAGE_SIZE;
        }

        snapshots.truncate(limit);
        log::info!("🌐 Fetched {} markets from Gamma API", snapshots.len());
        Ok(snapshots)
    }
}
