//! Core data models for the ingestion, freshness, and retrieval pipeline.
//!
//! These types flow between the connector runner, the change-detection
//! monitor, the answer cache, and the storage backends. Types that are part
//! of a trigger response serialize with camelCase keys.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::canonicalize;
use crate::error::ItemError;

/// How often a source should be ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    Hourly,
    Daily,
    Weekly,
}

impl Schedule {
    /// Minimum interval between successful runs.
    pub fn cadence(&self) -> Duration {
        match self {
            Schedule::Hourly => Duration::hours(1),
            Schedule::Daily => Duration::days(1),
            Schedule::Weekly => Duration::weeks(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Hourly => "hourly",
            Schedule::Daily => "daily",
            Schedule::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Schedule::Hourly),
            "daily" => Some(Schedule::Daily),
            "weekly" => Some(Schedule::Weekly),
            _ => None,
        }
    }
}

/// Search scope bucket. Ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceTier {
    Primary,
    Regional,
    State,
}

impl RelevanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceTier::Primary => "primary",
            RelevanceTier::Regional => "regional",
            RelevanceTier::State => "state",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(RelevanceTier::Primary),
            "regional" => Some(RelevanceTier::Regional),
            "state" => Some(RelevanceTier::State),
            _ => None,
        }
    }
}

impl Default for RelevanceTier {
    fn default() -> Self {
        RelevanceTier::Primary
    }
}

/// A configured content origin to ingest.
///
/// Unique per `(town_id, url)`; `priority` is in `[1, 5]` with 1 running first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub town_id: String,
    pub name: Option<String>,
    pub url: String,
    /// Connector type used to look up a factory in the registry.
    #[serde(rename = "type")]
    pub source_type: String,
    pub schedule: Schedule,
    pub priority: u8,
    pub max_depth: u32,
    pub max_pages: u32,
    pub is_active: bool,
    pub tier: RelevanceTier,
}

impl Source {
    /// Stable id for a `(town, url)` pair, independent of URL surface form.
    pub fn derive_id(town_id: &str, url: &str) -> String {
        let key = format!("{}|{}", town_id, canonicalize(url));
        Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
    }

    /// Label used in logs and results, e.g. `"page:springfield-minutes"`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}:{}", self.source_type, name),
            None => format!("{}:{}", self.source_type, self.id),
        }
    }
}

/// Filter applied when listing sources.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub town_id: Option<String>,
    pub schedule: Option<Schedule>,
    pub source_types: Option<Vec<String>>,
    pub active_only: bool,
}

impl SourceFilter {
    pub fn matches(&self, source: &Source) -> bool {
        if self.active_only && !source.is_active {
            return false;
        }
        if let Some(town) = &self.town_id {
            if &source.town_id != town {
                return false;
            }
        }
        if let Some(schedule) = self.schedule {
            if source.schedule != schedule {
                return false;
            }
        }
        if let Some(types) = &self.source_types {
            if !types.iter().any(|t| t == &source.source_type) {
                return false;
            }
        }
        true
    }
}

/// Raw item produced by a connector before canonicalization and hashing.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub url: String,
    pub title: Option<String>,
    pub body: String,
    pub content_type: String,
}

/// An ingested content unit, unique per `(town_id, canonical_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub town_id: String,
    pub source_id: String,
    pub canonical_url: String,
    pub content_hash: String,
    pub title: Option<String>,
    pub body: String,
    pub tier: RelevanceTier,
    pub fetched_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
}

/// Input to a document upsert. Timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub town_id: String,
    pub source_id: String,
    pub canonical_url: String,
    pub content_hash: String,
    pub title: Option<String>,
    pub body: String,
    pub tier: RelevanceTier,
}

/// Result of comparing an incoming document against the stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the write counts toward `itemsUpserted`.
    pub fn is_write(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// A keyword search hit over documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_id: String,
    pub canonical_url: String,
    pub title: Option<String>,
    pub tier: RelevanceTier,
    pub score: f64,
    pub snippet: String,
}

/// Outcome of one connector execution.
///
/// Always present for every connector attempted, whether it fully
/// succeeded, partially failed, or could not be instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRunResult {
    pub connector_id: String,
    pub connector_type: String,
    pub town_id: String,
    pub items_upserted: u64,
    pub items_skipped: u64,
    pub errors: Vec<ItemError>,
    pub duration_ms: u64,
    #[serde(default)]
    pub deadline_reached: bool,
}

impl ConnectorRunResult {
    pub fn empty(source: &Source) -> Self {
        Self {
            connector_id: source.id.clone(),
            connector_type: source.source_type.clone(),
            town_id: source.town_id.clone(),
            items_upserted: 0,
            items_skipped: 0,
            errors: Vec::new(),
            duration_ms: 0,
            deadline_reached: false,
        }
    }

    /// Fully failed: nothing was processed and at least one error occurred.
    pub fn is_total_failure(&self) -> bool {
        self.items_upserted == 0 && self.items_skipped == 0 && !self.errors.is_empty()
    }
}

/// Persisted history row for a connector execution.
#[derive(Debug, Clone)]
pub struct ConnectorRunRecord {
    pub id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: ConnectorRunResult,
}

impl ConnectorRunRecord {
    /// A run counts as successful for scheduling unless it fully failed.
    pub fn successful(&self) -> bool {
        !self.result.is_total_failure()
    }
}

/// Freshness classification for a tracked URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    New,
    Changed,
    Unchanged,
    Error,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::New => "new",
            ChangeStatus::Changed => "changed",
            ChangeStatus::Unchanged => "unchanged",
            ChangeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ChangeStatus::New),
            "changed" => Some(ChangeStatus::Changed),
            "unchanged" => Some(ChangeStatus::Unchanged),
            "error" => Some(ChangeStatus::Error),
            _ => None,
        }
    }
}

/// Freshness record for a tracked URL, owned by the monitor.
///
/// `last_hash` is `None` for URLs discovered from a feed but not fetched yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetectionState {
    pub town_id: String,
    pub url: String,
    pub source_id: Option<String>,
    pub last_hash: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub status: ChangeStatus,
}

/// Result of one change-detection pass over a town.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub checked_urls: u64,
    pub changed_urls: Vec<String>,
    pub new_urls: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub deadline_reached: bool,
}

impl ChangeReport {
    /// Fold another town's report into this one.
    pub fn merge(&mut self, other: ChangeReport) {
        self.checked_urls += other.checked_urls;
        self.changed_urls.extend(other.changed_urls);
        self.new_urls.extend(other.new_urls);
        self.errors.extend(other.errors);
        self.duration_ms += other.duration_ms;
        self.deadline_reached |= other.deadline_reached;
    }
}

/// Persisted history row for a monitor pass.
#[derive(Debug, Clone)]
pub struct MonitorRunRecord {
    pub id: String,
    pub town_id: String,
    pub trigger_source: String,
    pub started_at: DateTime<Utc>,
    pub report: ChangeReport,
}

/// A document cited by a cached answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSource {
    pub title: Option<String>,
    pub url: String,
}

/// A memoized answer for a normalized query within one town.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub normalized_key: String,
    pub town_id: String,
    pub answer_html: String,
    pub sources: Vec<AnswerSource>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Result of attempting to claim a cache key for computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now holds the claim. `took_over_expired` is set when a
    /// previous holder's claim lapsed without being released.
    Acquired { took_over_expired: bool },
    /// Another caller holds a live claim.
    Held,
}

/// One search-quality telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTelemetry {
    pub town_id: String,
    pub query: String,
    pub normalized_key: String,
    pub tiers: Vec<RelevanceTier>,
    pub cache_hit: bool,
    pub result_count: u64,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(town: &str, kind: &str, schedule: Schedule) -> Source {
        Source {
            id: Source::derive_id(town, "https://example.gov/"),
            town_id: town.to_string(),
            name: None,
            url: "https://example.gov/".to_string(),
            source_type: kind.to_string(),
            schedule,
            priority: 3,
            max_depth: 1,
            max_pages: 10,
            is_active: true,
            tier: RelevanceTier::Primary,
        }
    }

    #[test]
    fn test_derive_id_ignores_url_surface_form() {
        let a = Source::derive_id("springfield", "http://www.Springfield.gov/minutes/");
        let b = Source::derive_id("springfield", "https://springfield.gov/minutes");
        assert_eq!(a, b);
        assert_ne!(a, Source::derive_id("shelbyville", "https://springfield.gov/minutes"));
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(RelevanceTier::Primary < RelevanceTier::Regional);
        assert!(RelevanceTier::Regional < RelevanceTier::State);
    }

    #[test]
    fn test_filter_narrows_by_town_schedule_and_type() {
        let s = source("springfield", "page", Schedule::Daily);
        let mut filter = SourceFilter {
            active_only: true,
            ..Default::default()
        };
        assert!(filter.matches(&s));
        filter.town_id = Some("shelbyville".into());
        assert!(!filter.matches(&s));
        filter.town_id = Some("springfield".into());
        filter.schedule = Some(Schedule::Hourly);
        assert!(!filter.matches(&s));
        filter.schedule = Some(Schedule::Daily);
        filter.source_types = Some(vec!["rss".into()]);
        assert!(!filter.matches(&s));
    }

    #[test]
    fn test_total_failure_requires_errors_and_no_items() {
        let s = source("springfield", "page", Schedule::Daily);
        let mut r = ConnectorRunResult::empty(&s);
        assert!(!r.is_total_failure());
        r.errors.push(ItemError::new(crate::ErrorKind::Fetch, None, "down"));
        assert!(r.is_total_failure());
        r.items_skipped = 1;
        assert!(!r.is_total_failure());
    }
}
