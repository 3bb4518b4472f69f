//! Notification sinks
//!
//! - `TelegramSink` - Bot API `sendMessage` with MarkdownV2 formatting
//! - `LogSink` - writes the groups to the log (Telegram disabled)
//!
//! A sink reports success or failure for the whole batch; the cycle
//! runner only records cooldown state after a successful send.

use super::backoff::ExponentialBackoff;
use super::config::TelegramConfig;
use super::error::PipelineError;
use super::signals::EventGroup;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one poll's ranked, deduplicated groups
    async fn send(&self, groups: &[EventGroup]) -> Result<(), PipelineError>;

    /// First failure of a run of failing cycles
    async fn send_error(&self, message: &str) -> Result<(), PipelineError>;

    /// First success after `failure_count` consecutive failures
    async fn send_recovery(&self, failure_count: u32) -> Result<(), PipelineError>;
}

/// Escape every MarkdownV2 special character
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if matches!(
            c,
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|' | '{' | '}' | '.' | '!' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inside `(...)` of an inline link only `)` and `\` need escaping
fn escape_link_url(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

fn percent(value: f64) -> String {
    escape_markdown_v2(&format!("{:.1}%", value * 100.0))
}

/// Render groups as a MarkdownV2 message
///
/// ```text
/// 🚨 *Notable Odds Movements*
///
/// 📅 Detected: 2024\-03\-01 12:00:00 UTC
///
/// 1\. [Event title](https://polymarket.com/event/slug)
///    🎯 Market question
///    📈 *20\.0%* \(50\.0% → 70\.0%\)
/// ```
pub fn format_message(groups: &[EventGroup]) -> String {
    let mut message = String::from("🚨 *Notable Odds Movements*\n\n");

    if let Some(first) = groups.first().and_then(|g| g.members.first()) {
        if let Some(detected) = chrono::DateTime::<chrono::Utc>::from_timestamp(first.detected_at, 0) {
            let date = escape_markdown_v2(&detected.format("%Y-%m-%d %H:%M:%S UTC").to_string());
            message.push_str(&format!("📅 Detected: {}\n\n", date));
        }
    }

    for (i, group) in groups.iter().enumerate() {
        let title = escape_markdown_v2(&group.event_title);
        let title_line = if group.event_url.is_empty() {
            title
        } else {
            format!("[{}]({})", title, escape_link_url(&group.event_url))
        };
        message.push_str(&format!("{}\\. {}\n", i + 1, title_line));

        for alert in &group.members {
            if !alert.market_question.is_empty() && alert.market_question != group.event_title {
                message.push_str(&format!("   🎯 {}\n", escape_markdown_v2(&alert.market_question)));
            }

            let marker = if alert.new_probability < alert.old_probability { "📉" } else { "📈" };
            message.push_str(&format!(
                "   {} *{}* \\({} → {}\\)\n",
                marker,
                percent(alert.probability_delta),
                percent(alert.old_probability),
                percent(alert.new_probability)
            ));
        }

        message.push('\n');
    }

    message
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API sink
pub struct TelegramSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    max_retries: u32,
    retry_delay_ms: u64,
    api_url: String,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            max_retries: config.max_retries.max(1),
            retry_delay_ms: config.retry_delay_ms,
            api_url: TELEGRAM_API_URL.to_string(),
        })
    }

    async fn send_markdown_v2(&self, text: &str) -> Result<(), PipelineError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let body = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "MarkdownV2",
            disable_web_page_preview: true,
        };

        let mut backoff = ExponentialBackoff::new(
            self.retry_delay_ms,
            self.retry_delay_ms.saturating_mul(8),
            self.max_retries.saturating_sub(1),
        );

        loop {
            let last_error = match self.client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    let detail = response.text().await.unwrap_or_default();
                    format!("status {}: {}", status, detail)
                }
                // Never log the request URL; it carries the bot token
                Err(e) => e.without_url().to_string(),
            };

            log::warn!("⚠️  Telegram send failed: {}", last_error);
            if backoff.sleep().await.is_err() {
                return Err(PipelineError::Notification(format!(
                    "failed after {} attempts: {}",
                    self.max_retries, last_error
                )));
            }
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, groups: &[EventGroup]) -> Result<(), PipelineError> {
        self.send_markdown_v2(&format_message(groups)).await?;
        log::info!("📨 Sent Telegram notification with {} event groups", groups.len());
        Ok(())
    }

    async fn send_error(&self, message: &str) -> Result<(), PipelineError> {
        let text = format!("⚠️ *Monitoring error*\n`{}`", escape_markdown_v2(message));
        self.send_markdown_v2(&text).await
    }

    async fn send_recovery(&self, failure_count: u32) -> Result<(), PipelineError> {
        let text = format!(
            "✅ *Monitoring recovered* after {} consecutive failure\\(s\\)",
            failure_count
        );
        self.send_markdown_v2(&text).await
    }
}

/// Sink used when Telegram is disabled
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, groups: &[EventGroup]) -> Result<(), PipelineError> {
        for (i, group) in groups.iter().enumerate() {
            log::info!("🚨 #{} {} (best score {:.3})", i + 1, group.event_title, group.best_score);
            for alert in &group.members {
                log::info!(
                    "   ├─ {} {:.1}% → {:.1}% score={:.3}",
                    alert.series_id,
                    alert.old_probability * 100.0,
                    alert.new_probability * 100.0,
                    alert.final_score()
                );
            }
        }
        Ok(())
    }

    async fn send_error(&self, message: &str) -> Result<(), PipelineError> {
        log::error!("⚠️  Monitoring error: {}", message);
        Ok(())
    }

    async fn send_recovery(&self, failure_count: u32) -> Result<(), PipelineError> {
        log::info!("✅ Monitoring recovered after {} consecutive failure(s)", failure_count);
        Ok(())
    }
}
