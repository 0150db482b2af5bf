use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use town_hub_core::models::SourceFilter;

use crate::hub::Hub;
use crate::ingest::is_due;

/// Upsert every `[[sources]]` entry into the store. Returns the count.
pub async fn seed_sources(hub: &Hub) -> Result<usize> {
    let sources = hub.config.declared_sources()?;
    for source in &sources {
        hub.store.upsert_source(source).await?;
    }
    Ok(sources.len())
}

/// Operational view of one stored source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub id: String,
    pub label: String,
    pub town_id: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub schedule: String,
    pub priority: u8,
    pub active: bool,
    /// A connector factory exists for the type.
    pub registered: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub due: bool,
}

pub async fn get_sources(hub: &Hub, town_id: Option<&str>) -> Result<Vec<SourceStatus>> {
    let filter = SourceFilter {
        town_id: town_id.map(str::to_string),
        ..Default::default()
    };
    let now = Utc::now();
    let grace = chrono::Duration::seconds(hub.config.ingest.schedule_grace_secs as i64);

    let mut out = Vec::new();
    for source in hub.store.list_sources(&filter).await? {
        let last_success = hub.store.last_successful_run(&source.id).await?;
        out.push(SourceStatus {
            id: source.id.clone(),
            label: source.label(),
            town_id: source.town_id.clone(),
            source_type: source.source_type.clone(),
            schedule: source.schedule.as_str().to_string(),
            priority: source.priority,
            active: source.is_active,
            registered: hub.connectors.contains(&source.source_type),
            last_success,
            due: source.is_active && is_due(&source, last_success, now, grace),
        });
    }
    out.sort_by(|a, b| {
        a.town_id
            .cmp(&b.town_id)
            .then(a.priority.cmp(&b.priority))
            .then_with(|| a.label.cmp(&b.label))
    });
    Ok(out)
}

pub async fn list_sources(hub: &Hub, town_id: Option<&str>) -> Result<()> {
    seed_sources(hub).await?;
    let statuses = get_sources(hub, town_id).await?;

    if statuses.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<32} {:<8} {:<4} {:<8} {:<10} LAST SUCCESS",
        "TOWN", "SOURCE", "SCHEDULE", "PRI", "STATUS", "CONNECTOR"
    );
    for s in &statuses {
        let status = match (s.active, s.due) {
            (false, _) => "inactive",
            (true, true) => "due",
            (true, false) => "fresh",
        };
        let connector = if s.registered { "ok" } else { "missing" };
        let last = s
            .last_success
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<16} {:<32} {:<8} {:<4} {:<8} {:<10} {}",
            s.town_id, s.label, s.schedule, s.priority, status, connector, last
        );
    }
    Ok(())
}
