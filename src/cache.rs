//! Answer cache with at-most-one concurrent computation per key.
//!
//! Entries are keyed by `(town_id, normalize_query(query))`. Mutual
//! exclusion uses persisted claim records with an expiry, so it holds
//! across processes sharing a database and a crashed holder can never
//! starve later callers:
//!
//! 1. A fresh entry is returned as a hit.
//! 2. Otherwise the caller tries to claim the key. The winner computes,
//!    stores the entry, releases the claim, and wakes local waiters.
//! 3. Losers wait (woken early by an in-process [`Notify`], else polling)
//!    and re-check until an entry appears or the claim lapses, at which
//!    point the next caller takes it over and recomputes.
//!
//! A failed computation releases its claim without writing an entry, so
//! the next caller retries. A computation that outlives its claim, or that
//! started before the town's documents last changed, is returned to its
//! caller but not stored: the next caller treats the key as a miss.
//!
//! Each entry's `created_at` is the instant its computation started, and
//! an entry only counts while that instant is later than the town's
//! invalidation watermark. An answer built from documents read before an
//! invalidation can therefore never be served after it, whatever order the
//! write and the invalidation land in.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use town_hub_core::models::{AnswerSource, CacheEntry, ClaimOutcome};
use town_hub_core::store::Store;
use town_hub_core::{normalize_query, PipelineError};

use crate::config::CacheConfig;

/// Output of an answer computation.
#[derive(Debug, Clone)]
pub struct ComputedAnswer {
    pub answer_html: String,
    pub sources: Vec<AnswerSource>,
}

/// How a [`Resolved`] entry was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Served from a fresh entry without waiting.
    Hit,
    /// This caller ran the computation.
    Computed,
    /// Another caller's in-flight computation produced the entry.
    Awaited,
    /// This caller ran the computation but the entry was not stored, because
    /// its claim lapsed or the town was invalidated meanwhile.
    Uncached,
}

impl Origin {
    /// The answer came out of the cache rather than this caller's computation.
    pub fn is_cached(self) -> bool {
        matches!(self, Origin::Hit | Origin::Awaited)
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: CacheEntry,
    pub origin: Origin,
}

pub struct AnswerCache {
    store: Arc<dyn Store>,
    config: CacheConfig,
    notify: Notify,
}

impl AnswerCache {
    pub fn new(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            notify: Notify::new(),
        }
    }

    /// A fresh entry for the query, if one exists.
    pub async fn get(&self, town_id: &str, query: &str) -> Result<Option<CacheEntry>> {
        self.fresh_entry(town_id, &normalize_query(query)).await
    }

    /// Drop every entry for a town, including answers still being computed
    /// from its previous documents.
    pub async fn invalidate_town(&self, town_id: &str) -> Result<u64> {
        self.store.invalidate_town(town_id, Utc::now()).await
    }

    /// Remove expired entries and lapsed claims.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired(Utc::now()).await
    }

    /// Return the cached answer, computing it at most once across
    /// concurrent callers for the same `(town_id, normalized key)`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        town_id: &str,
        query: &str,
        compute: F,
    ) -> Result<Resolved>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ComputedAnswer>> + Send,
    {
        let key = normalize_query(query);
        let owner = Uuid::new_v4().to_string();
        let claim_ttl = Duration::from_secs(self.config.claim_ttl_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let give_up_at = Instant::now() + Duration::from_secs(self.config.wait_timeout_secs);

        let mut compute = Some(compute);
        let mut waited = false;

        loop {
            if let Some(entry) = self.fresh_entry(town_id, &key).await? {
                let origin = if waited { Origin::Awaited } else { Origin::Hit };
                return Ok(Resolved { entry, origin });
            }

            let now = Utc::now();
            let expires_at = now + chrono::Duration::seconds(self.config.claim_ttl_secs as i64);
            match self
                .store
                .try_claim(town_id, &key, &owner, expires_at, now)
                .await?
            {
                ClaimOutcome::Acquired { took_over_expired } => {
                    if took_over_expired {
                        warn!(
                            town = town_id,
                            error = %PipelineError::CacheClaimExpired(key.clone()),
                            "previous computation abandoned its claim; recomputing"
                        );
                    }

                    // An entry may have landed between the lookup and the claim.
                    if let Some(entry) = self.fresh_entry(town_id, &key).await? {
                        self.release(town_id, &key, &owner).await;
                        let origin = if waited { Origin::Awaited } else { Origin::Hit };
                        return Ok(Resolved { entry, origin });
                    }

                    let compute = compute
                        .take()
                        .ok_or_else(|| anyhow!("answer computation already consumed"))?;
                    debug!(town = town_id, key = %key, "computing answer");

                    let started_at = Utc::now();
                    let timer = Instant::now();
                    let outcome = match compute().await {
                        Ok(answer) if timer.elapsed() > claim_ttl => {
                            warn!(
                                town = town_id,
                                error = %PipelineError::CacheClaimExpired(key.clone()),
                                elapsed_ms = timer.elapsed().as_millis() as u64,
                                "answer computed after its claim lapsed; not caching"
                            );
                            Ok(Resolved {
                                entry: self.entry(town_id, &key, answer, started_at),
                                origin: Origin::Uncached,
                            })
                        }
                        Ok(answer) => self.store_answer(town_id, &key, answer, started_at).await,
                        Err(e) => Err(e),
                    };

                    self.release(town_id, &key, &owner).await;
                    self.notify.notify_waiters();
                    return outcome;
                }
                ClaimOutcome::Held => {
                    waited = true;
                    let remaining = give_up_at.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        bail!(
                            "timed out waiting for in-flight answer for '{}' in town '{}'",
                            key,
                            town_id
                        );
                    }
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(poll.min(remaining)) => {}
                    }
                }
            }
        }
    }

    async fn fresh_entry(&self, town_id: &str, key: &str) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.store.get_entry(town_id, key).await? else {
            return Ok(None);
        };
        if !entry.is_fresh(Utc::now()) {
            return Ok(None);
        }
        if self.is_stale(town_id, entry.created_at).await? {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Computed from reads made at `started_at`, which predate the town's
    /// latest invalidation.
    async fn is_stale(&self, town_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .store
            .invalidated_at(town_id)
            .await?
            .is_some_and(|mark| started_at <= mark))
    }

    fn entry(
        &self,
        town_id: &str,
        key: &str,
        answer: ComputedAnswer,
        started_at: DateTime<Utc>,
    ) -> CacheEntry {
        CacheEntry {
            normalized_key: key.to_string(),
            town_id: town_id.to_string(),
            answer_html: answer.answer_html,
            sources: answer.sources,
            created_at: started_at,
            expires_at: started_at + chrono::Duration::seconds(self.config.ttl_secs as i64),
        }
    }

    async fn store_answer(
        &self,
        town_id: &str,
        key: &str,
        answer: ComputedAnswer,
        started_at: DateTime<Utc>,
    ) -> Result<Resolved> {
        let entry = self.entry(town_id, key, answer, started_at);
        if self.is_stale(town_id, started_at).await? {
            debug!(town = town_id, key, "town invalidated during computation; not caching");
            return Ok(Resolved {
                entry,
                origin: Origin::Uncached,
            });
        }
        self.store.put_entry(&entry).await?;
        Ok(Resolved {
            entry,
            origin: Origin::Computed,
        })
    }

    async fn release(&self, town_id: &str, key: &str, owner: &str) {
        if let Err(e) = self.store.release_claim(town_id, key, owner).await {
            // The claim still expires on its own.
            warn!(town = town_id, key, error = %e, "failed to release cache claim");
        }
    }
}
