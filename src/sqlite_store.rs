//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as unix milliseconds. Documents are mirrored into
//! the `documents_fts` FTS5 table inside the same transaction as the
//! document write, so keyword search never sees a half-applied upsert.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use town_hub_core::models::{
    AnswerSource, CacheEntry, ChangeDetectionState, ChangeStatus, ClaimOutcome,
    ConnectorRunRecord, Document, DocumentInput, MonitorRunRecord, RelevanceTier, Schedule,
    SearchHit, SearchTelemetry, Source, SourceFilter, UpsertOutcome,
};
use town_hub_core::query::query_terms;
use town_hub_core::store::{CacheStore, ChangeStore, DocumentStore, SourceStore, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Build an FTS5 MATCH expression from free text: each normalized term is
/// quoted and the terms are OR-ed, so punctuation can never produce FTS
/// syntax errors.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let schedule: String = row.try_get("schedule")?;
    let tier: String = row.try_get("tier")?;
    let priority: i64 = row.try_get("priority")?;
    let max_depth: i64 = row.try_get("max_depth")?;
    let max_pages: i64 = row.try_get("max_pages")?;
    Ok(Source {
        id: row.try_get("id")?,
        town_id: row.try_get("town_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        source_type: row.try_get("type")?,
        schedule: Schedule::parse(&schedule)
            .ok_or_else(|| anyhow::anyhow!("unknown schedule '{}' in sources table", schedule))?,
        priority: priority.clamp(0, u8::MAX as i64) as u8,
        max_depth: max_depth.max(0) as u32,
        max_pages: max_pages.max(0) as u32,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        tier: RelevanceTier::parse(&tier).unwrap_or_default(),
    })
}

fn row_to_state(row: &SqliteRow) -> Result<ChangeDetectionState> {
    let status: String = row.try_get("status")?;
    Ok(ChangeDetectionState {
        town_id: row.try_get("town_id")?,
        url: row.try_get("url")?,
        source_id: row.try_get("source_id")?,
        last_hash: row.try_get("last_hash")?,
        last_checked_at: row.try_get::<Option<i64>, _>("last_checked_at")?.map(from_ms),
        last_changed_at: row.try_get::<Option<i64>, _>("last_changed_at")?.map(from_ms),
        status: ChangeStatus::parse(&status).unwrap_or(ChangeStatus::Error),
    })
}

#[async_trait]
impl SourceStore for SqliteStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, town_id, name, url, type, schedule, priority,
                                 max_depth, max_pages, is_active, tier)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                type = excluded.type,
                schedule = excluded.schedule,
                priority = excluded.priority,
                max_depth = excluded.max_depth,
                max_pages = excluded.max_pages,
                is_active = excluded.is_active,
                tier = excluded.tier
            "#,
        )
        .bind(&source.id)
        .bind(&source.town_id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.source_type)
        .bind(source.schedule.as_str())
        .bind(source.priority as i64)
        .bind(source.max_depth as i64)
        .bind(source.max_pages as i64)
        .bind(source.is_active as i64)
        .bind(source.tier.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY priority ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in &rows {
            let source = row_to_source(row)?;
            if filter.matches(&source) {
                sources.push(source);
            }
        }
        Ok(sources)
    }

    async fn last_successful_run(&self, source_id: &str) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(started_at) FROM connector_runs WHERE source_id = ? AND successful = 1",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest.map(from_ms))
    }

    async fn record_run(&self, run: &ConnectorRunRecord) -> Result<()> {
        let result_json = serde_json::to_string(&run.result)?;
        sqlx::query(
            r#"
            INSERT INTO connector_runs (id, source_id, started_at, finished_at, items_upserted,
                                        items_skipped, error_count, successful, result_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.source_id)
        .bind(to_ms(run.started_at))
        .bind(to_ms(run.finished_at))
        .bind(run.result.items_upserted as i64)
        .bind(run.result.items_skipped as i64)
        .bind(run.result.errors.len() as i64)
        .bind(run.successful() as i64)
        .bind(result_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_document(
        &self,
        doc: &DocumentInput,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        // The transaction opens with a write so it takes the write lock
        // before reading. A read-first transaction cannot upgrade once a
        // concurrent writer has committed (SQLITE_BUSY_SNAPSHOT).
        let existing = sqlx::query(
            r#"
            UPDATE documents SET fetched_at = ?
            WHERE town_id = ? AND canonical_url = ?
            RETURNING id, content_hash
            "#,
        )
        .bind(to_ms(now))
        .bind(&doc.town_id)
        .bind(&doc.canonical_url)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let stored_hash: String = row.try_get("content_hash")?;
                if stored_hash == doc.content_hash {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        r#"
                        UPDATE documents SET
                            source_id = ?, content_hash = ?, title = ?, body = ?, tier = ?,
                            last_changed_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&doc.source_id)
                    .bind(&doc.content_hash)
                    .bind(&doc.title)
                    .bind(&doc.body)
                    .bind(doc.tier.as_str())
                    .bind(to_ms(now))
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("DELETE FROM documents_fts WHERE document_id = ?")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "INSERT INTO documents_fts (document_id, title, body) VALUES (?, ?, ?)",
                    )
                    .bind(&id)
                    .bind(doc.title.as_deref().unwrap_or_default())
                    .bind(&doc.body)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO documents (id, town_id, source_id, canonical_url, content_hash,
                                           title, body, tier, fetched_at, last_changed_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&doc.town_id)
                .bind(&doc.source_id)
                .bind(&doc.canonical_url)
                .bind(&doc.content_hash)
                .bind(&doc.title)
                .bind(&doc.body)
                .bind(doc.tier.as_str())
                .bind(to_ms(now))
                .bind(to_ms(now))
                .execute(&mut *tx)
                .await?;

                sqlx::query("INSERT INTO documents_fts (document_id, title, body) VALUES (?, ?, ?)")
                    .bind(&id)
                    .bind(doc.title.as_deref().unwrap_or_default())
                    .bind(&doc.body)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_document(&self, town_id: &str, canonical_url: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE town_id = ? AND canonical_url = ?")
            .bind(town_id)
            .bind(canonical_url)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tier: String = row.try_get("tier")?;
        Ok(Some(Document {
            id: row.try_get("id")?,
            town_id: row.try_get("town_id")?,
            source_id: row.try_get("source_id")?,
            canonical_url: row.try_get("canonical_url")?,
            content_hash: row.try_get("content_hash")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            tier: RelevanceTier::parse(&tier).unwrap_or_default(),
            fetched_at: from_ms(row.try_get("fetched_at")?),
            last_changed_at: from_ms(row.try_get("last_changed_at")?),
        }))
    }

    async fn search_documents(
        &self,
        town_id: &str,
        tiers: &[RelevanceTier],
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if tiers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; tiers.len()].join(", ");
        let sql = format!(
            r#"
            SELECT d.id, d.canonical_url, d.title, d.tier, documents_fts.rank AS rank,
                   snippet(documents_fts, 2, '', '', '...', 32) AS snippet
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.document_id
            WHERE documents_fts MATCH ?
              AND d.town_id = ?
              AND d.tier IN ({})
            ORDER BY rank
            LIMIT ?
            "#,
            placeholders
        );

        let mut q = sqlx::query(&sql).bind(match_expr).bind(town_id);
        for tier in tiers {
            q = q.bind(tier.as_str());
        }
        let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = row.try_get("rank")?;
            let tier: String = row.try_get("tier")?;
            hits.push(SearchHit {
                document_id: row.try_get("id")?,
                canonical_url: row.try_get("canonical_url")?,
                title: row.try_get("title")?,
                tier: RelevanceTier::parse(&tier).unwrap_or_default(),
                score: -rank,
                snippet: row.try_get("snippet")?,
            });
        }
        Ok(hits)
    }

    async fn count_documents(&self, town_id: Option<&str>) -> Result<u64> {
        let count: i64 = match town_id {
            Some(town) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE town_id = ?")
                    .bind(town)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }
}

#[async_trait]
impl ChangeStore for SqliteStore {
    async fn tracked_states(&self, town_id: &str) -> Result<Vec<ChangeDetectionState>> {
        let rows =
            sqlx::query("SELECT * FROM change_detection_state WHERE town_id = ? ORDER BY url")
                .bind(town_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_state).collect()
    }

    async fn get_change_state(
        &self,
        town_id: &str,
        url: &str,
    ) -> Result<Option<ChangeDetectionState>> {
        let row = sqlx::query("SELECT * FROM change_detection_state WHERE town_id = ? AND url = ?")
            .bind(town_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    async fn put_change_state(&self, state: &ChangeDetectionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_detection_state (town_id, url, source_id, last_hash,
                                                last_checked_at, last_changed_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(town_id, url) DO UPDATE SET
                source_id = excluded.source_id,
                last_hash = excluded.last_hash,
                last_checked_at = excluded.last_checked_at,
                last_changed_at = excluded.last_changed_at,
                status = excluded.status
            "#,
        )
        .bind(&state.town_id)
        .bind(&state.url)
        .bind(&state.source_id)
        .bind(&state.last_hash)
        .bind(state.last_checked_at.map(to_ms))
        .bind(state.last_changed_at.map(to_ms))
        .bind(state.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_discovered(
        &self,
        town_id: &str,
        url: &str,
        source_id: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO change_detection_state (town_id, url, source_id, status)
            VALUES (?, ?, ?, 'new')
            ON CONFLICT(town_id, url) DO NOTHING
            "#,
        )
        .bind(town_id)
        .bind(url)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_monitor_run(&self, run: &MonitorRunRecord) -> Result<()> {
        let report_json = serde_json::to_string(&run.report)?;
        sqlx::query(
            r#"
            INSERT INTO monitor_runs (id, town_id, trigger_source, started_at, checked_urls,
                                      changed_count, new_count, error_count, duration_ms,
                                      deadline_reached, report_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.town_id)
        .bind(&run.trigger_source)
        .bind(to_ms(run.started_at))
        .bind(run.report.checked_urls as i64)
        .bind(run.report.changed_urls.len() as i64)
        .bind(run.report.new_urls.len() as i64)
        .bind(run.report.errors.len() as i64)
        .bind(run.report.duration_ms as i64)
        .bind(run.report.deadline_reached as i64)
        .bind(report_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get_entry(&self, town_id: &str, normalized_key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT * FROM answer_cache WHERE town_id = ? AND normalized_key = ?",
        )
        .bind(town_id)
        .bind(normalized_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sources_json: String = row.try_get("sources_json")?;
        let sources: Vec<AnswerSource> = serde_json::from_str(&sources_json)?;
        Ok(Some(CacheEntry {
            normalized_key: row.try_get("normalized_key")?,
            town_id: row.try_get("town_id")?,
            answer_html: row.try_get("answer_html")?,
            sources,
            created_at: from_ms(row.try_get("created_at")?),
            expires_at: from_ms(row.try_get("expires_at")?),
        }))
    }

    async fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        let sources_json = serde_json::to_string(&entry.sources)?;
        sqlx::query(
            r#"
            INSERT INTO answer_cache (town_id, normalized_key, answer_html, sources_json,
                                      created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(town_id, normalized_key) DO UPDATE SET
                answer_html = excluded.answer_html,
                sources_json = excluded.sources_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.town_id)
        .bind(&entry.normalized_key)
        .bind(&entry.answer_html)
        .bind(sources_json)
        .bind(to_ms(entry.created_at))
        .bind(to_ms(entry.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_town(&self, town_id: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO cache_invalidations (town_id, invalidated_at) VALUES (?, ?)
            ON CONFLICT(town_id) DO UPDATE SET
                invalidated_at = MAX(cache_invalidations.invalidated_at, excluded.invalidated_at)
            "#,
        )
        .bind(town_id)
        .bind(to_ms(at))
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM answer_cache WHERE town_id = ?")
            .bind(town_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn invalidated_at(&self, town_id: &str) -> Result<Option<DateTime<Utc>>> {
        let at: Option<i64> = sqlx::query_scalar(
            "SELECT invalidated_at FROM cache_invalidations WHERE town_id = ?",
        )
        .bind(town_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(at.map(from_ms))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let entries = sqlx::query("DELETE FROM answer_cache WHERE expires_at <= ?")
            .bind(to_ms(now))
            .execute(&self.pool)
            .await?;
        let claims = sqlx::query("DELETE FROM cache_claims WHERE expires_at <= ?")
            .bind(to_ms(now))
            .execute(&self.pool)
            .await?;
        Ok(entries.rows_affected() + claims.rows_affected())
    }

    async fn try_claim(
        &self,
        town_id: &str,
        normalized_key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let previous_owner: Option<String> = sqlx::query_scalar(
            "SELECT owner FROM cache_claims WHERE town_id = ? AND normalized_key = ?",
        )
        .bind(town_id)
        .bind(normalized_key)
        .fetch_optional(&self.pool)
        .await?;

        // The conditional upsert is the mutual-exclusion point: a live claim
        // held by someone else leaves the row untouched.
        let result = sqlx::query(
            r#"
            INSERT INTO cache_claims (town_id, normalized_key, owner, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(town_id, normalized_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE cache_claims.expires_at <= ? OR cache_claims.owner = excluded.owner
            "#,
        )
        .bind(town_id)
        .bind(normalized_key)
        .bind(owner)
        .bind(to_ms(expires_at))
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(ClaimOutcome::Held);
        }
        Ok(ClaimOutcome::Acquired {
            took_over_expired: previous_owner.is_some_and(|prev| prev != owner),
        })
    }

    async fn release_claim(&self, town_id: &str, normalized_key: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM cache_claims WHERE town_id = ? AND normalized_key = ? AND owner = ?",
        )
        .bind(town_id)
        .bind(normalized_key)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute_statement(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn record_telemetry(&self, event: &SearchTelemetry) -> Result<()> {
        let tiers = event
            .tiers
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(
            r#"
            INSERT INTO search_telemetry (town_id, query, normalized_key, tiers, cache_hit,
                                          result_count, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.town_id)
        .bind(&event.query)
        .bind(&event.normalized_key)
        .bind(tiers)
        .bind(event.cache_hit as i64)
        .bind(event.result_count as i64)
        .bind(event.latency_ms as i64)
        .bind(to_ms(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
