//! Configuration management for resenha
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files. Every section has defaults matching the production deployment, so a
//! partial file only needs to name what it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::storage::RedisConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis connection (key-value store and queues)
    pub redis: RedisConfig,

    /// Queue names, capacities and batch sizes
    pub queue: QueueConfig,

    /// Egress identity scheduling
    pub identity: IdentityConfig,

    /// Review page fetching and stop conditions
    pub pagination: PaginationConfig,

    /// Paid API quota handling
    pub quota: QuotaConfig,

    /// Retention and output locations
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Topic exchange crawl jobs are published to
    pub crawl_exchange: String,

    /// Queue crawl workers consume
    pub crawl_queue: String,

    /// Binding pattern of the crawl queue on the topic exchange
    pub crawl_binding: String,

    /// Maximum ready crawl jobs
    pub crawl_capacity: usize,

    /// Crawl jobs published per producer run
    pub crawl_batch_size: usize,

    /// Direct exchange resolution jobs are published to
    pub resolve_exchange: String,

    /// Queue (and routing key) of resolution jobs
    pub resolve_queue: String,

    /// Maximum ready resolution jobs
    pub resolve_capacity: usize,

    /// Resolution jobs published per producer run
    pub resolve_batch_size: usize,

    /// Consumer poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// In-flight deliveries older than this are returned to the queue
    pub visibility_timeout_secs: u64,

    /// How often a running consumer looks for stale deliveries
    pub reclaim_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            crawl_exchange: "topic_exchange".to_string(),
            crawl_queue: "gmaps_scrape".to_string(),
            crawl_binding: "gmaps_scrape.#".to_string(),
            crawl_capacity: 10,
            crawl_batch_size: 5,
            resolve_exchange: "direct_exchange".to_string(),
            resolve_queue: "serp_queue".to_string(),
            resolve_capacity: 20,
            resolve_batch_size: 2,
            poll_interval_ms: 500,
            visibility_timeout_secs: 6 * 3600,
            reclaim_interval_secs: 60,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    #[must_use]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// Identity scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding egress config files and the `secrets` credentials file
    pub config_dir: PathBuf,

    /// Config file name prefixes eligible for use
    pub countries: Vec<String>,

    /// Registry hash name
    pub registry_key: String,

    /// An identity is not reused within this many seconds of its last use
    pub cooldown_secs: u64,

    /// Lifetime of a worker's identity binding
    pub binding_ttl_secs: u64,

    /// Worker pause after no identity could be activated
    pub nothing_works_sleep_secs: u64,

    /// Width of the time-of-day preference, in hours
    pub affinity_sigma_hours: f64,

    /// Activation attempts per rotation
    pub max_attempts: usize,

    /// Wait between starting the egress process and probing it
    pub settle_secs: u64,

    /// URLs that must answer through the egress
    pub probe_urls: Vec<String>,

    /// Timeout for each probe request
    pub probe_timeout_secs: u64,

    /// Egress client binary
    pub launcher_binary: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("vpn"),
            countries: vec!["es".to_string()],
            registry_key: "vpns".to_string(),
            cooldown_secs: 24 * 3600,
            binding_ttl_secs: 3600,
            nothing_works_sleep_secs: 24 * 3600,
            affinity_sigma_hours: 2.0,
            max_attempts: 5,
            settle_secs: 10,
            probe_urls: vec!["https://www.google.com/generate_204".to_string()],
            probe_timeout_secs: 10,
            launcher_binary: "openvpn".to_string(),
        }
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub fn binding_ttl(&self) -> Duration {
        Duration::from_secs(self.binding_ttl_secs)
    }

    #[must_use]
    pub fn nothing_works_sleep(&self) -> Duration {
        Duration::from_secs(self.nothing_works_sleep_secs)
    }

    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Pagination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Review host, `{domain}` is replaced by the job's domain hint
    pub review_host: String,

    /// Gamma shape of the delay between pages
    pub delay_shape: f64,

    /// Gamma scale of the delay between pages, in seconds
    pub delay_scale: f64,

    /// Minimum delay between pages, in seconds
    pub delay_floor_secs: f64,

    /// Lower bound of the per-crawl page ceiling
    pub page_ceiling_min: u32,

    /// Upper bound (exclusive) of the per-crawl page ceiling
    pub page_ceiling_max: u32,

    /// Stop once a page holds content older than this many days
    pub max_age_days: i64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Request cap per minute, per worker
    pub requests_per_minute: u32,

    /// External parser program; page on stdin, JSON reviews on stdout
    pub parser_command: String,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            review_host: "https://www.google.{domain}".to_string(),
            delay_shape: 6.0,
            delay_scale: 2.0,
            delay_floor_secs: 2.0,
            page_ceiling_min: 70,
            page_ceiling_max: 100,
            max_age_days: 365,
            request_timeout_secs: 30,
            requests_per_minute: 30,
            parser_command: "review-parser".to_string(),
        }
    }
}

impl PaginationConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_age_days)
    }
}

/// Quota configuration for the secondary-id resolution API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Search API endpoint
    pub api_url: String,

    /// API key; usually supplied through `RESENHA_SERP_API_KEY`
    pub api_key: Option<String>,

    /// Search domain passed to the API
    pub google_domain: String,

    /// Day of month the quota resets
    pub reset_day: u32,

    /// Local hour the quota resets
    pub reset_hour: u32,

    /// Producer cadence while suspended, in seconds
    pub reduced_interval_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            api_url: "https://serpapi.com/search.json".to_string(),
            api_key: None,
            google_domain: "google.es".to_string(),
            reset_day: 8,
            reset_hour: 17,
            reduced_interval_secs: 24 * 3600,
            request_timeout_secs: 30,
        }
    }
}

impl QuotaConfig {
    #[must_use]
    pub fn reduced_interval(&self) -> Duration {
        Duration::from_secs(self.reduced_interval_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the JSON-lines document store
    pub output_dir: PathBuf,

    /// Checkpoint expiry in seconds
    pub checkpoint_ttl_secs: u64,

    /// Raw page retention in seconds
    pub archive_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            checkpoint_ttl_secs: 7 * 24 * 3600,
            archive_ttl_secs: 30 * 24 * 3600,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }

    #[must_use]
    pub fn archive_ttl(&self) -> Duration {
        Duration::from_secs(self.archive_ttl_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from an optional file, then let the environment override it
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override values from `RESENHA_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL").or_else(|_| std::env::var("RESENHA_REDIS_URL"))
        {
            self.redis.url = url;
        }
        if let Some(v) = env_parse("RESENHA_REDIS_POOL_SIZE") {
            self.redis.pool_size = v;
        }
        if let Ok(v) = std::env::var("RESENHA_KEY_PREFIX") {
            self.redis.key_prefix = v;
        }

        if let Some(v) = env_parse("RESENHA_CRAWL_CAPACITY") {
            self.queue.crawl_capacity = v;
        }
        if let Some(v) = env_parse("RESENHA_RESOLVE_CAPACITY") {
            self.queue.resolve_capacity = v;
        }

        if let Ok(v) = std::env::var("RESENHA_IDENTITY_DIR") {
            self.identity.config_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RESENHA_IDENTITY_COUNTRIES") {
            self.identity.countries = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_parse("RESENHA_IDENTITY_COOLDOWN_SECS") {
            self.identity.cooldown_secs = v;
        }
        if let Some(v) = env_parse("RESENHA_IDENTITY_MAX_ATTEMPTS") {
            self.identity.max_attempts = v;
        }

        if let Some(v) = env_parse("RESENHA_MAX_AGE_DAYS") {
            self.pagination.max_age_days = v;
        }
        if let Some(v) = env_parse("RESENHA_REQUEST_TIMEOUT") {
            self.pagination.request_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("RESENHA_PARSER_COMMAND") {
            self.pagination.parser_command = v;
        }

        if let Ok(v) = std::env::var("RESENHA_SERP_API_KEY") {
            self.quota.api_key = Some(v);
        }

        if let Ok(v) = std::env::var("RESENHA_OUTPUT_DIR") {
            self.storage.output_dir = PathBuf::from(v);
        }

        if let Ok(v) = std::env::var("RESENHA_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("RESENHA_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.redis.pool_size == 0 {
            anyhow::bail!("redis.pool_size must be greater than 0");
        }

        if self.queue.crawl_capacity == 0 || self.queue.resolve_capacity == 0 {
            anyhow::bail!("queue capacities must be greater than 0");
        }
        if self.queue.reclaim_interval_secs == 0 {
            anyhow::bail!("queue.reclaim_interval_secs must be greater than 0");
        }

        if self.identity.affinity_sigma_hours <= 0.0 {
            anyhow::bail!("identity.affinity_sigma_hours must be positive");
        }

        if self.identity.max_attempts == 0 {
            anyhow::bail!("identity.max_attempts must be greater than 0");
        }

        if self.identity.countries.is_empty() {
            anyhow::bail!("identity.countries must name at least one prefix");
        }

        if self.pagination.delay_shape <= 0.0 || self.pagination.delay_scale <= 0.0 {
            anyhow::bail!("pagination delay shape and scale must be positive");
        }

        if self.pagination.delay_floor_secs < 0.0 {
            anyhow::bail!("pagination.delay_floor_secs must not be negative");
        }

        if self.pagination.page_ceiling_min == 0
            || self.pagination.page_ceiling_min > self.pagination.page_ceiling_max
        {
            anyhow::bail!("pagination page ceiling range is empty");
        }

        if self.pagination.requests_per_minute == 0 {
            anyhow::bail!("pagination.requests_per_minute must be greater than 0");
        }

        if self.pagination.parser_command.trim().is_empty() {
            anyhow::bail!("pagination.parser_command must not be empty");
        }

        if !(1..=31).contains(&self.quota.reset_day) || self.quota.reset_hour > 23 {
            anyhow::bail!("quota reset must be a valid day of month and hour");
        }

        Ok(())
    }
}
