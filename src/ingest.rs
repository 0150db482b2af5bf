//! Connector Runner.
//!
//! Selects the due subset of active sources, runs their connectors with
//! bounded concurrency, and upserts every item:
//!
//! ```text
//! sources ─▶ filter (town, schedule) ─▶ due? ─▶ connector.scan()
//!        ─▶ canonicalize ─▶ content hash ─▶ upsert (insert / update / skip)
//! ```
//!
//! Failures are isolated: a per-item fetch, parse, or persistence failure
//! lands in that connector's `errors` and the remaining items still run;
//! a source whose type has no registered factory gets a synthetic result
//! with one configuration error and the batch continues. Every connector
//! attempted yields exactly one [`ConnectorRunResult`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use town_hub_core::models::{
    ConnectorRunRecord, ConnectorRunResult, DocumentInput, Schedule, Source, SourceFilter,
    SourceItem, UpsertOutcome,
};
use town_hub_core::store::Store;
use town_hub_core::{canonicalize, content_hash, ItemError, PipelineError};

use crate::deadline::Deadline;
use crate::hub::Hub;
use crate::sources::seed_sources;
use crate::traits::{Connector, ConnectorContext, ScanOutput};

/// Parameters of one runner invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub town_id: Option<String>,
    pub schedule: Option<Schedule>,
    /// Run every matching source regardless of when it last succeeded.
    pub force: bool,
}

/// Results of a batch, plus the due sources that were never started
/// because the deadline passed first.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub results: Vec<ConnectorRunResult>,
    pub deferred: usize,
}

/// Response of the ingest trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub timestamp: DateTime<Utc>,
    pub connectors_run: usize,
    pub deferred: usize,
    pub items_upserted: u64,
    pub items_skipped: u64,
    pub errors: usize,
    pub deadline_reached: bool,
    pub generate_requested: bool,
    pub results: Vec<ConnectorRunResult>,
}

impl IngestSummary {
    pub fn from_batch(batch: IngestBatch, generate_requested: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            connectors_run: batch.results.len(),
            deferred: batch.deferred,
            items_upserted: batch.results.iter().map(|r| r.items_upserted).sum(),
            items_skipped: batch.results.iter().map(|r| r.items_skipped).sum(),
            errors: batch.results.iter().map(|r| r.errors.len()).sum(),
            deadline_reached: batch.deferred > 0
                || batch.results.iter().any(|r| r.deadline_reached),
            generate_requested,
            results: batch.results,
        }
    }
}

/// Run the due connectors and return one result per connector attempted,
/// in priority order.
pub async fn run(hub: &Hub, options: &RunOptions) -> Result<Vec<ConnectorRunResult>> {
    Ok(run_batch(hub, options).await?.results)
}

/// Seed declared sources, run the batch, and summarize it.
pub async fn run_trigger(hub: &Hub, options: &RunOptions, generate: bool) -> Result<IngestSummary> {
    seed_sources(hub).await?;
    let batch = run_batch(hub, options).await?;
    Ok(IngestSummary::from_batch(batch, generate))
}

pub async fn run_batch(hub: &Hub, options: &RunOptions) -> Result<IngestBatch> {
    let deadline = Deadline::after(Duration::from_secs(hub.config.ingest.deadline_secs));
    run_batch_until(hub, options, deadline).await
}

/// [`run_batch`] against an explicit deadline.
pub async fn run_batch_until(
    hub: &Hub,
    options: &RunOptions,
    deadline: Deadline,
) -> Result<IngestBatch> {
    let due = select_due(hub, options, Utc::now()).await?;
    info!(
        due = due.len(),
        town = options.town_id.as_deref().unwrap_or("*"),
        force = options.force,
        "starting connector run"
    );

    let ctx = ConnectorContext {
        fetcher: hub.fetcher.clone(),
        deadline,
        request_delay: Duration::from_millis(hub.config.http.request_delay_ms),
    };

    let jobs: Vec<_> = due
        .iter()
        .enumerate()
        .map(|(i, source)| run_slot(hub, i, source, &ctx))
        .collect();
    let mut outcomes: Vec<(usize, Option<ConnectorRunResult>)> = stream::iter(jobs)
        .buffer_unordered(hub.config.ingest.max_concurrency.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|(i, _)| *i);

    let mut batch = IngestBatch::default();
    for (i, outcome) in outcomes {
        match outcome {
            Some(result) => batch.results.push(result),
            None => {
                batch.deferred += 1;
                warn!(source = %due[i].label(), "deadline reached; source deferred to next run");
            }
        }
    }
    Ok(batch)
}

/// Active sources matching the options that are due, ordered by
/// `(priority, id)`.
pub async fn select_due(
    hub: &Hub,
    options: &RunOptions,
    now: DateTime<Utc>,
) -> Result<Vec<Source>> {
    let filter = SourceFilter {
        town_id: options.town_id.clone(),
        schedule: options.schedule,
        source_types: None,
        active_only: true,
    };
    let grace = chrono::Duration::seconds(hub.config.ingest.schedule_grace_secs as i64);

    let mut due = Vec::new();
    for source in hub.store.list_sources(&filter).await? {
        if options.force {
            due.push(source);
            continue;
        }
        let last = hub.store.last_successful_run(&source.id).await?;
        if is_due(&source, last, now, grace) {
            due.push(source);
        }
    }
    due.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    Ok(due)
}

/// Elapsed time since the last successful run exceeds the cadence.
pub fn is_due(
    source: &Source,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> bool {
    match last_success {
        None => true,
        Some(last) => now - last > source.schedule.cadence() - grace,
    }
}

/// A source that has not started when the deadline passes is deferred.
async fn run_slot(
    hub: &Hub,
    index: usize,
    source: &Source,
    ctx: &ConnectorContext,
) -> (usize, Option<ConnectorRunResult>) {
    if ctx.deadline.is_past() {
        return (index, None);
    }
    (index, Some(run_source(hub, source, ctx).await))
}

async fn run_source(hub: &Hub, source: &Source, ctx: &ConnectorContext) -> ConnectorRunResult {
    let started_at = Utc::now();
    let timer = Instant::now();
    let mut result = ConnectorRunResult::empty(source);

    match hub.connectors.instantiate(source) {
        Err(e) => {
            warn!(source = %source.label(), error = %e, "connector unavailable");
            result.errors.push(e.into());
        }
        Ok(connector) => match scan_until_deadline(connector.as_ref(), ctx).await {
            Err(e) => {
                warn!(source = %source.label(), error = %e, "connector scan failed");
                result.errors.push(e.into());
            }
            Ok(scan) => {
                result.errors.extend(scan.errors);
                result.deadline_reached = scan.deadline_reached;
                for item in &scan.items {
                    match index_item(hub.store.as_ref(), source, item, Utc::now()).await {
                        Ok(outcome) if outcome.is_write() => result.items_upserted += 1,
                        Ok(_) => result.items_skipped += 1,
                        Err(e) => result.errors.push(e),
                    }
                }
            }
        },
    }

    result.duration_ms = timer.elapsed().as_millis() as u64;

    let record = ConnectorRunRecord {
        id: Uuid::new_v4().to_string(),
        source_id: source.id.clone(),
        started_at,
        finished_at: Utc::now(),
        result: result.clone(),
    };
    if let Err(e) = hub.store.record_run(&record).await {
        warn!(source = %source.label(), error = %e, "failed to record connector run");
    }

    if result.items_upserted > 0 {
        if let Err(e) = hub.cache.invalidate_town(&source.town_id).await {
            warn!(town = %source.town_id, error = %e, "failed to invalidate answer cache");
        }
    }

    info!(
        source = %source.label(),
        upserted = result.items_upserted,
        skipped = result.items_skipped,
        errors = result.errors.len(),
        duration_ms = result.duration_ms,
        "connector finished"
    );
    result
}

/// Slack past the deadline before an unresponsive scan is dropped.
const SCAN_GRACE: Duration = Duration::from_millis(250);

/// Built-in connectors stop at the deadline on their own; this bounds any
/// other connector to nearly the same ceiling.
async fn scan_until_deadline(
    connector: &dyn Connector,
    ctx: &ConnectorContext,
) -> Result<ScanOutput, PipelineError> {
    let cutoff = ctx.deadline.extended(SCAN_GRACE).instant();
    match tokio::time::timeout_at(cutoff, connector.scan(ctx)).await {
        Ok(scan) => scan,
        Err(_) => Ok(ScanOutput {
            errors: vec![PipelineError::DeadlineExceeded(format!(
                "{} connector did not finish before the deadline",
                connector.connector_type()
            ))
            .into()],
            deadline_reached: true,
            ..Default::default()
        }),
    }
}

/// Canonicalize, hash, and upsert one item on behalf of `source`.
pub async fn index_item(
    store: &dyn Store,
    source: &Source,
    item: &SourceItem,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, ItemError> {
    let canonical_url = canonicalize(&item.url);
    let doc = DocumentInput {
        town_id: source.town_id.clone(),
        source_id: source.id.clone(),
        content_hash: content_hash(&item.body),
        canonical_url,
        title: item.title.clone(),
        body: item.body.clone(),
        tier: source.tier,
    };
    store
        .upsert_document(&doc, now)
        .await
        .map_err(|e| ItemError::persistence(Some(&doc.canonical_url), &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use town_hub_core::models::RelevanceTier;

    fn source(schedule: Schedule) -> Source {
        Source {
            id: "s".into(),
            town_id: "springfield".into(),
            name: None,
            url: "https://springfield.gov".into(),
            source_type: "page".into(),
            schedule,
            priority: 1,
            max_depth: 0,
            max_pages: 1,
            is_active: true,
            tier: RelevanceTier::Primary,
        }
    }

    #[test]
    fn test_never_run_is_due() {
        assert!(is_due(&source(Schedule::Weekly), None, Utc::now(), chrono::Duration::zero()));
    }

    #[test]
    fn test_due_after_cadence_elapses() {
        let now = Utc::now();
        let s = source(Schedule::Hourly);
        let zero = chrono::Duration::zero();
        assert!(!is_due(&s, Some(now - chrono::Duration::minutes(30)), now, zero));
        assert!(is_due(&s, Some(now - chrono::Duration::minutes(61)), now, zero));
    }

    #[test]
    fn test_grace_absorbs_jitter() {
        let now = Utc::now();
        let s = source(Schedule::Daily);
        let last = Some(now - chrono::Duration::hours(23) - chrono::Duration::minutes(58));
        assert!(!is_due(&s, last, now, chrono::Duration::zero()));
        assert!(is_due(&s, last, now, chrono::Duration::minutes(5)));
    }
}
