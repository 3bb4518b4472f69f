//! Runtime configuration from environment variables
//!
//! Every value has a default; `validate()` runs after loading so a bad
//! override fails at startup instead of mid-cycle.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Whether top-K truncation runs before or after the cooldown filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankingOrder {
    /// Truncate to top-K, then drop suppressed alerts. Suppressed slots
    /// are not backfilled.
    #[default]
    TruncateThenFilter,
    /// Drop suppressed alerts first so lower-ranked groups can backfill
    FilterThenTruncate,
}

impl FromStr for RankingOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "truncate_then_filter" | "truncate-then-filter" => Ok(RankingOrder::TruncateThenFilter),
            "filter_then_truncate" | "filter-then-truncate" => Ok(RankingOrder::FilterThenTruncate),
            other => Err(ConfigError::InvalidValue(format!(
                "ranking order must be truncate_then_filter or filter_then_truncate, got {}",
                other
            ))),
        }
    }
}

/// Detection engine parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Trajectory buffer capacity
    pub window_size: usize,
    /// Smoothing factor for average depth
    pub alpha: f64,
    /// Scores above this are kept out of the baseline
    pub ceiling: f64,
    /// Scores above this become alerts
    pub threshold: f64,
    pub volume_24h_min: f64,
    pub volume_1wk_min: f64,
    pub volume_1mo_min: f64,
    pub top_k: usize,
    /// Cooldown window = multiplier * poll interval
    pub cooldown_multiplier: u32,
    /// Polls between state checkpoints
    pub checkpoint_interval: u64,
    pub ranking_order: RankingOrder,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            alpha: 0.1,
            ceiling: 10.0,
            threshold: 3.0,
            volume_24h_min: 25_000.0,
            volume_1wk_min: 100_000.0,
            volume_1mo_min: 500_000.0,
            top_k: 5,
            cooldown_multiplier: 5,
            checkpoint_interval: 12,
            ranking_order: RankingOrder::TruncateThenFilter,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 1 {
            return Err(ConfigError::InvalidValue("window_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::InvalidValue("alpha must be between 0.0 and 1.0".to_string()));
        }
        if !(self.ceiling > 0.0) {
            return Err(ConfigError::InvalidValue("ceiling must be positive".to_string()));
        }
        if !(self.threshold > 0.0) {
            return Err(ConfigError::InvalidValue("threshold must be positive".to_string()));
        }
        if !(self.volume_24h_min >= 0.0) || !(self.volume_1wk_min >= 0.0) || !(self.volume_1mo_min >= 0.0) {
            return Err(ConfigError::InvalidValue("minimum volumes must not be negative".to_string()));
        }
        if self.cooldown_multiplier < 1 {
            return Err(ConfigError::InvalidValue("cooldown_multiplier must be at least 1".to_string()));
        }
        if self.checkpoint_interval < 1 {
            return Err(ConfigError::InvalidValue("checkpoint_interval must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Gamma API catalog source
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    pub gamma_api_url: String,
    pub categories: Vec<String>,
    pub fetch_limit: usize,
    pub http_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            gamma_api_url: "https://gamma-api.polymarket.com".to_string(),
            categories: ["geopolitics", "tech", "finance", "crypto", "world"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fetch_limit: 500,
            http_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Empty means `$TMPDIR/oddsflow/oddsflow.db`
    pub db_path: String,
    pub schema_dir: String,
    /// Catalog cap enforced by rotation
    pub max_markets: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            schema_dir: "sql".to_string(),
            max_markets: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.trim().is_empty() {
            env::temp_dir().join("oddsflow").join("oddsflow.db")
        } else {
            PathBuf::from(&self.db_path)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Full runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OddsflowConfig {
    pub poll_interval_secs: u64,
    pub monitor: MonitorConfig,
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    pub telegram: TelegramConfig,
}

impl Default for OddsflowConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3_600,
            monitor: MonitorConfig::default(),
            catalog: CatalogConfig::default(),
            storage: StorageConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl OddsflowConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ODDSFLOW_POLL_INTERVAL_SECS` (default: 3600)
    /// - `ODDSFLOW_CATEGORIES` comma separated (default: geopolitics,tech,finance,crypto,world)
    /// - `ODDSFLOW_FETCH_LIMIT` (default: 500)
    /// - `ODDSFLOW_GAMMA_API_URL` (default: https://gamma-api.polymarket.com)
    /// - `ODDSFLOW_HTTP_TIMEOUT_SECS` (default: 30)
    /// - `ODDSFLOW_MAX_RETRIES` / `ODDSFLOW_RETRY_DELAY_MS` (default: 3 / 1000)
    /// - `ODDSFLOW_WINDOW_SIZE`, `ODDSFLOW_ALPHA`, `ODDSFLOW_CEILING`, `ODDSFLOW_THRESHOLD`
    /// - `ODDSFLOW_VOLUME_24H_MIN`, `ODDSFLOW_VOLUME_1WK_MIN`, `ODDSFLOW_VOLUME_1MO_MIN`
    /// - `ODDSFLOW_TOP_K`, `ODDSFLOW_COOLDOWN_MULTIPLIER`, `ODDSFLOW_CHECKPOINT_INTERVAL`
    /// - `ODDSFLOW_RANKING_ORDER` (truncate_then_filter | filter_then_truncate)
    /// - `ODDSFLOW_DB_PATH`, `ODDSFLOW_SCHEMA_DIR` (default: sql), `ODDSFLOW_MAX_MARKETS` (default: 10000)
    /// - `TELEGRAM_ENABLED`, `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let categories = match parse("ODDSFLOW_CATEGORIES") {
            Some(raw) => raw
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            None => defaults.catalog.categories.clone(),
        };

        let ranking_order = match parse("ODDSFLOW_RANKING_ORDER") {
            Some(raw) => raw.parse()?,
            None => RankingOrder::default(),
        };

        let monitor = MonitorConfig {
            window_size: parse("ODDSFLOW_WINDOW_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.window_size),
            alpha: parse("ODDSFLOW_ALPHA")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.alpha),
            ceiling: parse("ODDSFLOW_CEILING")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.ceiling),
            threshold: parse("ODDSFLOW_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.threshold),
            volume_24h_min: parse("ODDSFLOW_VOLUME_24H_MIN")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.volume_24h_min),
            volume_1wk_min: parse("ODDSFLOW_VOLUME_1WK_MIN")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.volume_1wk_min),
            volume_1mo_min: parse("ODDSFLOW_VOLUME_1MO_MIN")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.volume_1mo_min),
            top_k: parse("ODDSFLOW_TOP_K")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.top_k),
            cooldown_multiplier: parse("ODDSFLOW_COOLDOWN_MULTIPLIER")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.cooldown_multiplier),
            checkpoint_interval: parse("ODDSFLOW_CHECKPOINT_INTERVAL")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.monitor.checkpoint_interval),
            ranking_order,
        };

        let catalog = CatalogConfig {
            gamma_api_url: parse("ODDSFLOW_GAMMA_API_URL").unwrap_or(defaults.catalog.gamma_api_url),
            categories,
            fetch_limit: parse("ODDSFLOW_FETCH_LIMIT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.catalog.fetch_limit),
            http_timeout_secs: parse("ODDSFLOW_HTTP_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.catalog.http_timeout_secs),
            max_retries: parse("ODDSFLOW_MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.catalog.max_retries),
            retry_delay_ms: parse("ODDSFLOW_RETRY_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.catalog.retry_delay_ms),
        };

        let storage = StorageConfig {
            db_path: parse("ODDSFLOW_DB_PATH").unwrap_or_default(),
            schema_dir: parse("ODDSFLOW_SCHEMA_DIR").unwrap_or(defaults.storage.schema_dir),
            max_markets: parse("ODDSFLOW_MAX_MARKETS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.storage.max_markets),
        };

        let telegram = TelegramConfig {
            enabled: parse("TELEGRAM_ENABLED")
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            bot_token: parse("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            chat_id: parse("TELEGRAM_CHAT_ID").unwrap_or_default(),
            max_retries: catalog.max_retries,
            retry_delay_ms: catalog.retry_delay_ms,
        };

        Ok(Self {
            poll_interval_secs: parse("ODDSFLOW_POLL_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.poll_interval_secs),
            monitor,
            catalog,
            storage,
            telegram,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog.gamma_api_url.is_empty() {
            return Err(ConfigError::MissingVariable("ODDSFLOW_GAMMA_API_URL".to_string()));
        }
        if !self.catalog.gamma_api_url.starts_with("http://") && !self.catalog.gamma_api_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "ODDSFLOW_GAMMA_API_URL must start with http:// or https://".to_string(),
            ));
        }
        if self.poll_interval_secs < 60 {
            return Err(ConfigError::InvalidValue(
                "poll interval must be at least 60 seconds".to_string(),
            ));
        }
        if self.catalog.categories.is_empty() {
            return Err(ConfigError::InvalidValue(
                "categories must contain at least one category".to_string(),
            ));
        }
        if self.catalog.fetch_limit < 1 || self.catalog.fetch_limit > 10_000 {
            return Err(ConfigError::InvalidValue(
                "fetch limit must be between 1 and 10000".to_string(),
            ));
        }

        self.monitor.validate()?;

        if self.storage.max_markets < 1 {
            return Err(ConfigError::InvalidValue("max markets must be at least 1".to_string()));
        }

        if self.telegram.enabled {
            if self.telegram.bot_token.is_empty() {
                return Err(ConfigError::MissingVariable("TELEGRAM_BOT_TOKEN".to_string()));
            }
            if self.telegram.chat_id.is_empty() {
                return Err(ConfigError::MissingVariable("TELEGRAM_CHAT_ID".to_string()));
            }
        }

        Ok(())
    }
}
