//! Storage abstraction for Town Hub.
//!
//! Persistence is split by owner: sources and run history belong to the
//! connector runner, documents to the ingestion pipeline, freshness state
//! to the change-detection monitor, and cache entries and claims to the
//! answer cache. [`Store`] combines them into one backend.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! All timestamps are passed in by the caller so that behaviour is
//! deterministic under test.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CacheEntry, ChangeDetectionState, ClaimOutcome, ConnectorRunRecord, Document, DocumentInput,
    MonitorRunRecord, RelevanceTier, SearchHit, SearchTelemetry, Source, SourceFilter,
    UpsertOutcome,
};

/// Source configuration and connector run history.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Insert or replace a source keyed by `source.id`.
    async fn upsert_source(&self, source: &Source) -> Result<()>;

    /// List sources matching the filter, ordered by `(priority, id)`.
    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>>;

    /// Start time of the most recent successful run of a source.
    async fn last_successful_run(&self, source_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Append a connector execution to the run history.
    async fn record_run(&self, run: &ConnectorRunRecord) -> Result<()>;
}

/// Document persistence keyed by `(town_id, canonical_url)`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert, update, or skip a document by comparing content hashes.
    ///
    /// `last_changed_at` is set to `now` whenever the hash changes.
    async fn upsert_document(&self, doc: &DocumentInput, now: DateTime<Utc>)
        -> Result<UpsertOutcome>;

    async fn get_document(&self, town_id: &str, canonical_url: &str) -> Result<Option<Document>>;

    /// Keyword search within a town, restricted to the given tiers.
    async fn search_documents(
        &self,
        town_id: &str,
        tiers: &[RelevanceTier],
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    async fn count_documents(&self, town_id: Option<&str>) -> Result<u64>;
}

/// Freshness state owned by the change-detection monitor.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// All tracked URLs for a town, ordered by URL.
    async fn tracked_states(&self, town_id: &str) -> Result<Vec<ChangeDetectionState>>;

    async fn get_change_state(&self, town_id: &str, url: &str)
        -> Result<Option<ChangeDetectionState>>;

    /// Replace the state row for `(town_id, url)` in one write.
    async fn put_change_state(&self, state: &ChangeDetectionState) -> Result<()>;

    /// Track a URL found in a discovery feed. Returns `false` if it was
    /// already tracked.
    async fn insert_discovered(
        &self,
        town_id: &str,
        url: &str,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn record_monitor_run(&self, run: &MonitorRunRecord) -> Result<()>;
}

/// Answer cache entries and in-flight computation claims.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_entry(&self, town_id: &str, normalized_key: &str) -> Result<Option<CacheEntry>>;

    async fn put_entry(&self, entry: &CacheEntry) -> Result<()>;

    /// Drop every entry for a town and raise its invalidation watermark to
    /// `at`. Returns the number of entries removed.
    async fn invalidate_town(&self, town_id: &str, at: DateTime<Utc>) -> Result<u64>;

    /// Latest invalidation of a town's entries. Entries computed from reads
    /// made at or before this instant are stale.
    async fn invalidated_at(&self, town_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Drop expired entries and lapsed claims. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically claim a key unless another owner holds a live claim.
    async fn try_claim(
        &self,
        town_id: &str,
        normalized_key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Release a claim if `owner` still holds it.
    async fn release_claim(&self, town_id: &str, normalized_key: &str, owner: &str) -> Result<()>;
}

/// Complete storage backend.
#[async_trait]
pub trait Store: SourceStore + DocumentStore + ChangeStore + CacheStore {
    /// Execute a raw statement, returning rows affected.
    ///
    /// Backends without a statement engine fail with
    /// [`PipelineError::UnsupportedOperation`](crate::error::PipelineError::UnsupportedOperation).
    async fn execute_statement(&self, sql: &str) -> Result<u64>;

    async fn record_telemetry(&self, event: &SearchTelemetry) -> Result<()>;
}
