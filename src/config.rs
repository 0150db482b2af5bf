//! Configuration parsing and validation.
//!
//! Town Hub reads a single TOML file (default `./config/hub.toml`). Every
//! section except `[db]` may be omitted and falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/hub.sqlite"
//!
//! [ingest]
//! max_concurrency = 4
//!
//! [[sources]]
//! town = "springfield"
//! url = "https://springfield.gov/meetings"
//! type = "page"
//! schedule = "daily"
//! priority = 1
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use town_hub_core::canonicalize;
use town_hub_core::models::{RelevanceTier, Schedule, Source};

/// Execution ceiling imposed by the hosting environment on a trigger.
pub const HOSTING_CEILING_SECS: u64 = 300;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between consecutive fetches within one connector.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

fn default_user_agent() -> String {
    format!("town-hub/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_retries() -> u32 {
    2
}
fn default_request_delay_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_ingest_deadline_secs")]
    pub deadline_secs: u64,
    /// Subtracted from a schedule's cadence when deciding whether a source is due.
    #[serde(default)]
    pub schedule_grace_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            deadline_secs: default_ingest_deadline_secs(),
            schedule_grace_secs: 0,
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_ingest_deadline_secs() -> u64 {
    270
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_stop_margin_ms")]
    pub stop_margin_ms: u64,
    #[serde(default = "default_tracked_types")]
    pub tracked_types: Vec<String>,
    #[serde(default = "default_feed_types")]
    pub feed_types: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_monitor_deadline_secs(),
            stop_margin_ms: default_stop_margin_ms(),
            tracked_types: default_tracked_types(),
            feed_types: default_feed_types(),
        }
    }
}

fn default_monitor_deadline_secs() -> u64 {
    270
}
fn default_stop_margin_ms() -> u64 {
    5_000
}
fn default_tracked_types() -> Vec<String> {
    vec!["page".to_string()]
}
fn default_feed_types() -> Vec<String> {
    vec!["rss".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            claim_ttl_secs: default_claim_ttl_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_claim_ttl_secs() -> u64 {
    60
}
fn default_wait_timeout_secs() -> u64 {
    90
}
fn default_poll_interval_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            result_limit: default_result_limit(),
        }
    }
}

fn default_result_limit() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// A `[[sources]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub town: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_tier")]
    pub tier: String,
}

fn default_schedule() -> String {
    "daily".to_string()
}
fn default_priority() -> u8 {
    3
}
fn default_max_depth() -> u32 {
    1
}
fn default_max_pages() -> u32 {
    25
}
fn default_tier() -> String {
    "primary".to_string()
}

impl SourceConfig {
    /// Convert into a [`Source`] record. Assumes the entry was validated.
    pub fn to_source(&self) -> Result<Source> {
        let schedule = Schedule::parse(&self.schedule)
            .with_context(|| format!("invalid schedule '{}'", self.schedule))?;
        let tier = RelevanceTier::parse(&self.tier)
            .with_context(|| format!("invalid tier '{}'", self.tier))?;
        Ok(Source {
            id: Source::derive_id(&self.town, &self.url),
            town_id: self.town.clone(),
            name: self.name.clone(),
            url: self.url.trim().to_string(),
            source_type: self.source_type.clone(),
            schedule,
            priority: self.priority,
            max_depth: self.max_depth,
            max_pages: self.max_pages,
            is_active: self.active,
            tier,
        })
    }
}

impl Config {
    /// All-defaults configuration with a local database path.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/hub.sqlite"),
            },
            http: HttpConfig::default(),
            ingest: IngestConfig::default(),
            monitor: MonitorConfig::default(),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
            telemetry: TelemetryConfig::default(),
            server: ServerConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Declared sources converted to records.
    pub fn declared_sources(&self) -> Result<Vec<Source>> {
        self.sources.iter().map(SourceConfig::to_source).collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.max_concurrency == 0 {
        bail!("ingest.max_concurrency must be >= 1");
    }
    if config.ingest.deadline_secs == 0 || config.ingest.deadline_secs >= HOSTING_CEILING_SECS {
        bail!(
            "ingest.deadline_secs must be in [1, {})",
            HOSTING_CEILING_SECS
        );
    }
    if config.monitor.deadline_secs == 0 || config.monitor.deadline_secs >= HOSTING_CEILING_SECS {
        bail!(
            "monitor.deadline_secs must be in [1, {})",
            HOSTING_CEILING_SECS
        );
    }
    if config.monitor.stop_margin_ms >= config.monitor.deadline_secs * 1000 {
        bail!("monitor.stop_margin_ms must be below monitor.deadline_secs");
    }
    if config.cache.claim_ttl_secs == 0 {
        bail!("cache.claim_ttl_secs must be >= 1");
    }
    if config.cache.poll_interval_ms == 0 {
        bail!("cache.poll_interval_ms must be >= 1");
    }
    if config.search.result_limit == 0 {
        bail!("search.result_limit must be >= 1");
    }

    let mut seen = HashSet::new();
    for (i, s) in config.sources.iter().enumerate() {
        let at = format!("sources[{}]", i);
        if s.town.trim().is_empty() {
            bail!("{}: town must not be empty", at);
        }
        if s.url.trim().is_empty() {
            bail!("{}: url must not be empty", at);
        }
        if s.source_type.trim().is_empty() {
            bail!("{}: type must not be empty", at);
        }
        if !(1..=5).contains(&s.priority) {
            bail!("{}: priority must be in [1, 5], got {}", at, s.priority);
        }
        if s.max_pages == 0 {
            bail!("{}: max_pages must be >= 1", at);
        }
        if Schedule::parse(&s.schedule).is_none() {
            bail!(
                "{}: unknown schedule '{}'. Must be hourly, daily, or weekly.",
                at,
                s.schedule
            );
        }
        if RelevanceTier::parse(&s.tier).is_none() {
            bail!(
                "{}: unknown tier '{}'. Must be primary, regional, or state.",
                at,
                s.tier
            );
        }
        if !seen.insert((s.town.clone(), canonicalize(&s.url))) {
            bail!("{}: duplicate source for town '{}': {}", at, s.town, s.url);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_apply() {
        let config = parse("[db]\npath = \"/tmp/hub.sqlite\"\n").unwrap();
        assert_eq!(config.ingest.deadline_secs, 270);
        assert_eq!(config.ingest.schedule_grace_secs, 0);
        assert_eq!(config.monitor.tracked_types, vec!["page"]);
        assert_eq!(config.monitor.feed_types, vec!["rss"]);
        assert!(config.telemetry.enabled);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_source_entry_converts() {
        let config = parse(
            r#"
[db]
path = "/tmp/hub.sqlite"

[[sources]]
town = "springfield"
url = "http://www.springfield.gov/news/"
type = "rss"
schedule = "hourly"
priority = 2
tier = "regional"
"#,
        )
        .unwrap();
        let sources = config.declared_sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].schedule, Schedule::Hourly);
        assert_eq!(sources[0].tier, RelevanceTier::Regional);
        assert_eq!(
            sources[0].id,
            Source::derive_id("springfield", "https://springfield.gov/news")
        );
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let err = parse(
            r#"
[db]
path = "/tmp/hub.sqlite"

[[sources]]
town = "springfield"
url = "https://springfield.gov"
type = "page"
priority = 9
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("priority"));
    }

    #[test]
    fn test_duplicate_canonical_source_rejected() {
        let err = parse(
            r#"
[db]
path = "/tmp/hub.sqlite"

[[sources]]
town = "springfield"
url = "https://springfield.gov/news"
type = "page"

[[sources]]
town = "springfield"
url = "http://WWW.springfield.gov/news/?utm_source=x"
type = "rss"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_deadline_must_fit_ceiling() {
        let err = parse("[db]\npath = \"/tmp/x\"\n[monitor]\ndeadline_secs = 300\n").unwrap_err();
        assert!(err.to_string().contains("monitor.deadline_secs"));
    }
}
