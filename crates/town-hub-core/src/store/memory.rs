//! In-memory [`Store`] implementation for testing.
//!
//! Uses `HashMap`s behind `std::sync::Mutex`. Keyword search scores a
//! document by how many query terms appear in its title and body. Raw
//! statements are not supported.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    CacheEntry, ChangeDetectionState, ChangeStatus, ClaimOutcome, ConnectorRunRecord, Document,
    DocumentInput, MonitorRunRecord, RelevanceTier, SearchHit, SearchTelemetry, Source,
    SourceFilter, UpsertOutcome,
};
use crate::query::query_terms;

use super::{CacheStore, ChangeStore, DocumentStore, SourceStore, Store};

type TownKey = (String, String);

struct Claim {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory store for tests and single-process experiments.
#[derive(Default)]
pub struct InMemoryStore {
    sources: Mutex<HashMap<String, Source>>,
    runs: Mutex<Vec<ConnectorRunRecord>>,
    documents: Mutex<HashMap<TownKey, Document>>,
    states: Mutex<BTreeMap<TownKey, ChangeDetectionState>>,
    monitor_runs: Mutex<Vec<MonitorRunRecord>>,
    entries: Mutex<HashMap<TownKey, CacheEntry>>,
    claims: Mutex<HashMap<TownKey, Claim>>,
    invalidations: Mutex<HashMap<String, DateTime<Utc>>>,
    telemetry: Mutex<Vec<SearchTelemetry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector runs recorded so far, oldest first.
    pub fn runs(&self) -> Vec<ConnectorRunRecord> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Monitor runs recorded so far, oldest first.
    pub fn monitor_runs(&self) -> Vec<MonitorRunRecord> {
        self.monitor_runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Telemetry events recorded so far.
    pub fn telemetry_events(&self) -> Vec<SearchTelemetry> {
        self.telemetry.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn key(town_id: &str, other: &str) -> TownKey {
    (town_id.to_string(), other.to_string())
}

fn snippet(body: &str) -> String {
    body.chars().take(240).collect()
}

#[async_trait]
impl SourceStore for InMemoryStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        lock(&self.sources)?.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = lock(&self.sources)?
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn last_successful_run(&self, source_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(lock(&self.runs)?
            .iter()
            .filter(|r| r.source_id == source_id && r.successful())
            .map(|r| r.started_at)
            .max())
    }

    async fn record_run(&self, run: &ConnectorRunRecord) -> Result<()> {
        lock(&self.runs)?.push(run.clone());
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert_document(
        &self,
        doc: &DocumentInput,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut docs = lock(&self.documents)?;
        let k = key(&doc.town_id, &doc.canonical_url);
        match docs.get_mut(&k) {
            Some(existing) if existing.content_hash == doc.content_hash => {
                existing.fetched_at = now;
                Ok(UpsertOutcome::Unchanged)
            }
            Some(existing) => {
                existing.source_id = doc.source_id.clone();
                existing.content_hash = doc.content_hash.clone();
                existing.title = doc.title.clone();
                existing.body = doc.body.clone();
                existing.tier = doc.tier;
                existing.fetched_at = now;
                existing.last_changed_at = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                docs.insert(
                    k,
                    Document {
                        id: Uuid::new_v4().to_string(),
                        town_id: doc.town_id.clone(),
                        source_id: doc.source_id.clone(),
                        canonical_url: doc.canonical_url.clone(),
                        content_hash: doc.content_hash.clone(),
                        title: doc.title.clone(),
                        body: doc.body.clone(),
                        tier: doc.tier,
                        fetched_at: now,
                        last_changed_at: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get_document(&self, town_id: &str, canonical_url: &str) -> Result<Option<Document>> {
        Ok(lock(&self.documents)?
            .get(&key(town_id, canonical_url))
            .cloned())
    }

    async fn search_documents(
        &self,
        town_id: &str,
        tiers: &[RelevanceTier],
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = lock(&self.documents)?;
        let mut hits: Vec<SearchHit> = docs
            .values()
            .filter(|d| d.town_id == town_id && tiers.contains(&d.tier))
            .filter_map(|d| {
                let haystack = format!(
                    "{} {}",
                    d.title.as_deref().unwrap_or_default(),
                    d.body
                )
                .to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (matched > 0).then(|| SearchHit {
                    document_id: d.id.clone(),
                    canonical_url: d.canonical_url.clone(),
                    title: d.title.clone(),
                    tier: d.tier,
                    score: matched as f64 / terms.len() as f64,
                    snippet: snippet(&d.body),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.canonical_url.cmp(&b.canonical_url))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_documents(&self, town_id: Option<&str>) -> Result<u64> {
        Ok(lock(&self.documents)?
            .values()
            .filter(|d| town_id.map_or(true, |t| d.town_id == t))
            .count() as u64)
    }
}

#[async_trait]
impl ChangeStore for InMemoryStore {
    async fn tracked_states(&self, town_id: &str) -> Result<Vec<ChangeDetectionState>> {
        Ok(lock(&self.states)?
            .values()
            .filter(|s| s.town_id == town_id)
            .cloned()
            .collect())
    }

    async fn get_change_state(
        &self,
        town_id: &str,
        url: &str,
    ) -> Result<Option<ChangeDetectionState>> {
        Ok(lock(&self.states)?.get(&key(town_id, url)).cloned())
    }

    async fn put_change_state(&self, state: &ChangeDetectionState) -> Result<()> {
        lock(&self.states)?.insert(key(&state.town_id, &state.url), state.clone());
        Ok(())
    }

    async fn insert_discovered(
        &self,
        town_id: &str,
        url: &str,
        source_id: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut states = lock(&self.states)?;
        let k = key(town_id, url);
        if states.contains_key(&k) {
            return Ok(false);
        }
        states.insert(
            k,
            ChangeDetectionState {
                town_id: town_id.to_string(),
                url: url.to_string(),
                source_id: source_id.map(str::to_string),
                last_hash: None,
                last_checked_at: None,
                last_changed_at: None,
                status: ChangeStatus::New,
            },
        );
        Ok(true)
    }

    async fn record_monitor_run(&self, run: &MonitorRunRecord) -> Result<()> {
        lock(&self.monitor_runs)?.push(run.clone());
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get_entry(&self, town_id: &str, normalized_key: &str) -> Result<Option<CacheEntry>> {
        Ok(lock(&self.entries)?
            .get(&key(town_id, normalized_key))
            .cloned())
    }

    async fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        lock(&self.entries)?.insert(
            key(&entry.town_id, &entry.normalized_key),
            entry.clone(),
        );
        Ok(())
    }

    async fn invalidate_town(&self, town_id: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|(town, _), _| town != town_id);
        let removed = (before - entries.len()) as u64;
        drop(entries);

        let mut invalidations = lock(&self.invalidations)?;
        let mark = invalidations.entry(town_id.to_string()).or_insert(at);
        *mark = (*mark).max(at);
        Ok(removed)
    }

    async fn invalidated_at(&self, town_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(lock(&self.invalidations)?.get(town_id).copied())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        let mut removed = before - entries.len();
        drop(entries);

        let mut claims = lock(&self.claims)?;
        let before = claims.len();
        claims.retain(|_, c| c.expires_at > now);
        removed += before - claims.len();
        Ok(removed as u64)
    }

    async fn try_claim(
        &self,
        town_id: &str,
        normalized_key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut claims = lock(&self.claims)?;
        let k = key(town_id, normalized_key);
        let took_over_expired = match claims.get(&k) {
            Some(existing) if existing.expires_at > now && existing.owner != owner => {
                return Ok(ClaimOutcome::Held);
            }
            Some(existing) => existing.owner != owner,
            None => false,
        };
        claims.insert(
            k,
            Claim {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(ClaimOutcome::Acquired { took_over_expired })
    }

    async fn release_claim(&self, town_id: &str, normalized_key: &str, owner: &str) -> Result<()> {
        let mut claims = lock(&self.claims)?;
        let k = key(town_id, normalized_key);
        if claims.get(&k).is_some_and(|c| c.owner == owner) {
            claims.remove(&k);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn execute_statement(&self, _sql: &str) -> Result<u64> {
        Err(PipelineError::UnsupportedOperation(
            "the in-memory store has no statement engine".to_string(),
        )
        .into())
    }

    async fn record_telemetry(&self, event: &SearchTelemetry) -> Result<()> {
        lock(&self.telemetry)?.push(event.clone());
        Ok(())
    }
}
