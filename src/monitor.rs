//! Change Detection Monitor.
//!
//! Revisits tracked pages, hashes their normalized content, and classifies
//! each URL:
//!
//! | prior state          | outcome                                         |
//! |----------------------|-------------------------------------------------|
//! | none                 | `new`, reported in `newUrls`                    |
//! | discovered, unhashed | hash recorded, not reported again               |
//! | different hash       | `changed`, reported in `changedUrls`, reindexed |
//! | same hash            | `unchanged`, only `last_checked_at` moves       |
//! | fetch fails          | message in `errors`, state untouched            |
//!
//! Discovery feeds are then scanned for links not yet tracked; those are
//! inserted as `new` without a fetch. Work stops cooperatively when the
//! remaining time drops below the stop margin, and the partial report is
//! returned. Each URL's state is written in a single store call.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use town_hub_core::models::{
    ChangeDetectionState, ChangeReport, ChangeStatus, MonitorRunRecord, Source, SourceFilter,
    SourceItem,
};
use town_hub_core::{canonicalize, content_hash};

use crate::deadline::Deadline;
use crate::extract::{parse_feed, parse_html, resolve_link};
use crate::fetch::FetchedPage;
use crate::hub::Hub;
use crate::ingest::index_item;

/// Response of the monitor trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub checked: u64,
    pub changed: usize,
    pub changed_urls: Vec<String>,
    pub new_urls: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub deadline_reached: bool,
}

impl MonitorResponse {
    pub fn from_report(report: ChangeReport) -> Self {
        let status = if report.deadline_reached { "partial" } else { "ok" };
        Self {
            status: status.to_string(),
            timestamp: Utc::now(),
            checked: report.checked_urls,
            changed: report.changed_urls.len(),
            changed_urls: report.changed_urls,
            new_urls: report.new_urls,
            errors: report.errors,
            duration_ms: report.duration_ms,
            deadline_reached: report.deadline_reached,
        }
    }
}

struct Target {
    state: Option<ChangeDetectionState>,
    source_id: Option<String>,
}

pub async fn run_change_detection(
    hub: &Hub,
    town_id: &str,
    trigger_source: &str,
) -> Result<ChangeReport> {
    let deadline = Deadline::after(Duration::from_secs(hub.config.monitor.deadline_secs));
    run_change_detection_until(hub, town_id, trigger_source, deadline).await
}

/// Run every town with active sources under one shared deadline and merge
/// the reports.
pub async fn run_all_towns(hub: &Hub, trigger_source: &str) -> Result<ChangeReport> {
    let timer = Instant::now();
    let deadline = Deadline::after(Duration::from_secs(hub.config.monitor.deadline_secs));
    let towns: BTreeSet<String> = hub
        .store
        .list_sources(&SourceFilter {
            active_only: true,
            ..Default::default()
        })
        .await?
        .into_iter()
        .map(|s| s.town_id)
        .collect();

    let mut merged = ChangeReport::default();
    for town in &towns {
        let report = run_change_detection_until(hub, town, trigger_source, deadline).await?;
        merged.merge(report);
        if merged.deadline_reached {
            break;
        }
    }
    merged.duration_ms = timer.elapsed().as_millis() as u64;
    Ok(merged)
}

/// [`run_change_detection`] against an explicit deadline.
pub async fn run_change_detection_until(
    hub: &Hub,
    town_id: &str,
    trigger_source: &str,
    deadline: Deadline,
) -> Result<ChangeReport> {
    let started_at = Utc::now();
    let timer = Instant::now();
    let margin = Duration::from_millis(hub.config.monitor.stop_margin_ms);
    let monitor_cfg = &hub.config.monitor;

    let sources: Vec<Source> = hub
        .store
        .list_sources(&SourceFilter {
            town_id: Some(town_id.to_string()),
            active_only: true,
            ..Default::default()
        })
        .await?;
    let by_id: HashMap<&str, &Source> = sources.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut targets: BTreeMap<String, Target> = BTreeMap::new();
    for state in hub.store.tracked_states(town_id).await? {
        targets.insert(
            state.url.clone(),
            Target {
                source_id: state.source_id.clone(),
                state: Some(state),
            },
        );
    }
    for source in sources
        .iter()
        .filter(|s| monitor_cfg.tracked_types.contains(&s.source_type))
    {
        targets
            .entry(canonicalize(&source.url))
            .or_insert_with(|| Target {
                state: None,
                source_id: Some(source.id.clone()),
            });
    }

    let mut report = ChangeReport::default();

    for (url, target) in targets {
        if deadline.is_near(margin) {
            report.deadline_reached = true;
            break;
        }
        let fetched =
            match tokio::time::timeout_at(deadline.instant(), hub.fetcher.fetch(&url)).await {
                Ok(result) => result,
                Err(_) => {
                    report.deadline_reached = true;
                    break;
                }
            };
        report.checked_urls += 1;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                report.errors.push(format!("{}: {}", url, e));
                continue;
            }
        };

        let now = Utc::now();
        let hash = content_hash(&page.body);
        let prior_hash = target.state.as_ref().and_then(|s| s.last_hash.clone());
        let status = match (&target.state, prior_hash.as_deref()) {
            (None, _) => {
                report.new_urls.push(url.clone());
                ChangeStatus::New
            }
            (Some(_), None) => ChangeStatus::New,
            (Some(_), Some(prev)) if prev == hash => ChangeStatus::Unchanged,
            (Some(_), Some(_)) => {
                report.changed_urls.push(url.clone());
                ChangeStatus::Changed
            }
        };

        let last_changed_at = match status {
            ChangeStatus::Unchanged => target.state.as_ref().and_then(|s| s.last_changed_at),
            _ => Some(now),
        };
        let state = ChangeDetectionState {
            town_id: town_id.to_string(),
            url: url.clone(),
            source_id: target.source_id.clone(),
            last_hash: Some(hash),
            last_checked_at: Some(now),
            last_changed_at,
            status,
        };
        if let Err(e) = hub.store.put_change_state(&state).await {
            report.errors.push(format!("{}: persistence error: {:#}", url, e));
            continue;
        }

        if status != ChangeStatus::Unchanged {
            let owner = target.source_id.as_deref().and_then(|id| by_id.get(id));
            if let Some(source) = owner {
                reindex(hub, source, &url, &page, now, &mut report).await;
            }
        }
    }

    if !report.deadline_reached {
        discover(hub, town_id, &sources, deadline, margin, &mut report).await;
    }

    if !report.changed_urls.is_empty() || !report.new_urls.is_empty() {
        if let Err(e) = hub.cache.invalidate_town(town_id).await {
            warn!(town = town_id, error = %e, "failed to invalidate answer cache");
        }
    }

    report.duration_ms = timer.elapsed().as_millis() as u64;

    let record = MonitorRunRecord {
        id: Uuid::new_v4().to_string(),
        town_id: town_id.to_string(),
        trigger_source: trigger_source.to_string(),
        started_at,
        report: report.clone(),
    };
    if let Err(e) = hub.store.record_monitor_run(&record).await {
        warn!(town = town_id, error = %e, "failed to record monitor run");
    }

    info!(
        town = town_id,
        trigger = trigger_source,
        checked = report.checked_urls,
        changed = report.changed_urls.len(),
        new = report.new_urls.len(),
        errors = report.errors.len(),
        deadline_reached = report.deadline_reached,
        "change detection finished"
    );
    Ok(report)
}

/// Scan discovery feeds and start tracking links not seen before.
async fn discover(
    hub: &Hub,
    town_id: &str,
    sources: &[Source],
    deadline: Deadline,
    margin: Duration,
    report: &mut ChangeReport,
) {
    let feeds = sources
        .iter()
        .filter(|s| hub.config.monitor.feed_types.contains(&s.source_type));

    for feed in feeds {
        if deadline.is_near(margin) {
            report.deadline_reached = true;
            return;
        }
        let fetched =
            tokio::time::timeout_at(deadline.instant(), hub.fetcher.fetch(&feed.url)).await;
        let page = match fetched {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                report.errors.push(format!("{}: {}", feed.url, e));
                continue;
            }
            Err(_) => {
                report.deadline_reached = true;
                return;
            }
        };
        let entries = match parse_feed(&page.body) {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("{}: {}", feed.url, e));
                continue;
            }
        };

        let now = Utc::now();
        for entry in &entries {
            let Some(link) = entry
                .resolved_link()
                .and_then(|link| resolve_link(&page.url, link))
            else {
                continue;
            };
            let url = canonicalize(&link);
            match hub
                .store
                .insert_discovered(town_id, &url, Some(&feed.id), now)
                .await
            {
                Ok(true) => {
                    debug!(town = town_id, url = %url, "discovered new page");
                    report.new_urls.push(url);
                }
                Ok(false) => {}
                Err(e) => report
                    .errors
                    .push(format!("{}: persistence error: {:#}", url, e)),
            }
        }
    }
}

/// Push a changed page back through the runner's upsert path.
async fn reindex(
    hub: &Hub,
    source: &Source,
    url: &str,
    page: &FetchedPage,
    now: DateTime<Utc>,
    report: &mut ChangeReport,
) {
    let item = if page.is_html() {
        let parsed = parse_html(&page.body, url);
        SourceItem {
            url: url.to_string(),
            title: parsed.title,
            body: parsed.text,
            content_type: page.content_type.clone(),
        }
    } else {
        SourceItem {
            url: url.to_string(),
            title: None,
            body: page.body.trim().to_string(),
            content_type: page.content_type.clone(),
        }
    };
    if item.body.is_empty() {
        return;
    }
    if let Err(e) = index_item(hub.store.as_ref(), source, &item, now).await {
        report.errors.push(format!("{}: {}", url, e));
    }
}
