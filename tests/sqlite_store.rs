//! SQLite store behaviour against a temporary database.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use town_hub::config::Config;
use town_hub::db;
use town_hub::migrate::run_migrations;
use town_hub::sqlite_store::SqliteStore;
use town_hub_core::models::{
    AnswerSource, CacheEntry, ChangeDetectionState, ChangeStatus, ClaimOutcome,
    ConnectorRunRecord, ConnectorRunResult, DocumentInput, RelevanceTier, Schedule, Source,
    SourceFilter, UpsertOutcome,
};
use town_hub_core::store::{CacheStore, ChangeStore, DocumentStore, SourceStore, Store};
use town_hub_core::{content_hash, ItemError, ErrorKind};

const TOWN: &str = "springfield";

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.db.path = tmp.path().join("data").join("hub.sqlite");
    let pool = db::connect(&config).await.unwrap();
    let store = SqliteStore::new(pool);
    run_migrations(&store).await.unwrap();
    (tmp, store)
}

fn source(url: &str, tier: RelevanceTier) -> Source {
    Source {
        id: Source::derive_id(TOWN, url),
        town_id: TOWN.to_string(),
        name: Some("minutes".to_string()),
        url: url.to_string(),
        source_type: "page".to_string(),
        schedule: Schedule::Weekly,
        priority: 2,
        max_depth: 1,
        max_pages: 5,
        is_active: true,
        tier,
    }
}

fn doc(source: &Source, url: &str, title: &str, body: &str) -> DocumentInput {
    DocumentInput {
        town_id: TOWN.to_string(),
        source_id: source.id.clone(),
        canonical_url: url.to_string(),
        content_hash: content_hash(body),
        title: Some(title.to_string()),
        body: body.to_string(),
        tier: source.tier,
    }
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, store) = open_store().await;
    run_migrations(&store).await.unwrap();
    run_migrations(&store).await.unwrap();
    assert_eq!(store.count_documents(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_source_round_trip_and_filter() {
    let (_tmp, store) = open_store().await;
    let active = source("https://springfield.gov/minutes", RelevanceTier::Regional);
    let mut inactive = source("https://springfield.gov/archive", RelevanceTier::Primary);
    inactive.is_active = false;
    store.upsert_source(&active).await.unwrap();
    store.upsert_source(&inactive).await.unwrap();

    let all = store.list_sources(&SourceFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let listed = store
        .list_sources(&SourceFilter {
            town_id: Some(TOWN.to_string()),
            active_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed, vec![active]);
}

#[tokio::test]
async fn test_last_successful_run_ignores_total_failures() {
    let (_tmp, store) = open_store().await;
    let s = source("https://springfield.gov/minutes", RelevanceTier::Primary);
    store.upsert_source(&s).await.unwrap();
    assert!(store.last_successful_run(&s.id).await.unwrap().is_none());

    let ok_at = Utc::now() - Duration::hours(2);
    let mut ok = ConnectorRunResult::empty(&s);
    ok.items_upserted = 3;
    store
        .record_run(&ConnectorRunRecord {
            id: "run-1".into(),
            source_id: s.id.clone(),
            started_at: ok_at,
            finished_at: ok_at,
            result: ok,
        })
        .await
        .unwrap();

    let mut failed = ConnectorRunResult::empty(&s);
    failed.errors.push(ItemError::new(
        ErrorKind::Fetch,
        Some("https://springfield.gov/minutes"),
        "HTTP 503",
    ));
    let failed_at = Utc::now();
    store
        .record_run(&ConnectorRunRecord {
            id: "run-2".into(),
            source_id: s.id.clone(),
            started_at: failed_at,
            finished_at: failed_at,
            result: failed,
        })
        .await
        .unwrap();

    let last = store.last_successful_run(&s.id).await.unwrap().unwrap();
    assert_eq!(last.timestamp_millis(), ok_at.timestamp_millis());
}

#[tokio::test]
async fn test_document_upsert_outcomes() {
    let (_tmp, store) = open_store().await;
    let s = source("https://springfield.gov/minutes", RelevanceTier::Primary);
    let url = "https://springfield.gov/minutes/2026-10-06";
    let now = Utc::now();

    let first = doc(&s, url, "Minutes", "Select board approved the budget.");
    assert_eq!(
        store.upsert_document(&first, now).await.unwrap(),
        UpsertOutcome::Inserted
    );
    assert_eq!(
        store.upsert_document(&first, now).await.unwrap(),
        UpsertOutcome::Unchanged
    );

    let revised = doc(&s, url, "Minutes", "Select board tabled the budget.");
    assert_eq!(
        store
            .upsert_document(&revised, now + Duration::seconds(5))
            .await
            .unwrap(),
        UpsertOutcome::Updated
    );

    let stored = store.get_document(TOWN, url).await.unwrap().unwrap();
    assert_eq!(stored.body, "Select board tabled the budget.");
    assert_eq!(store.count_documents(Some(TOWN)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_upserts_of_one_url_serialize() {
    let (_tmp, store) = open_store().await;
    let store = std::sync::Arc::new(store);
    let s = source("https://springfield.gov/minutes", RelevanceTier::Primary);
    let input = doc(
        &s,
        "https://springfield.gov/minutes/2026-10-13",
        "Minutes",
        "Select board voted to repave Elm St.",
    );

    let writes = (0..8).map(|_| {
        let store = store.clone();
        let input = input.clone();
        tokio::spawn(async move { store.upsert_document(&input, Utc::now()).await })
    });
    let outcomes: Vec<UpsertOutcome> = futures::future::join_all(writes)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let inserted = outcomes
        .iter()
        .filter(|o| **o == UpsertOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, UpsertOutcome::Inserted | UpsertOutcome::Unchanged)));
    assert_eq!(store.count_documents(Some(TOWN)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_keyword_search_respects_town_and_tier() {
    let (_tmp, store) = open_store().await;
    let local = source("https://springfield.gov/dpw", RelevanceTier::Primary);
    let state = source("https://mass.gov/dor", RelevanceTier::State);
    let now = Utc::now();
    store
        .upsert_document(
            &doc(
                &local,
                "https://springfield.gov/dpw/trash",
                "Trash pickup",
                "Trash pickup is every Monday.",
            ),
            now,
        )
        .await
        .unwrap();
    store
        .upsert_document(
            &doc(
                &state,
                "https://mass.gov/dor/income-tax",
                "Income tax",
                "State income tax filing and trash disposal fees.",
            ),
            now,
        )
        .await
        .unwrap();
    let mut elsewhere = doc(
        &local,
        "https://shelbyville.gov/trash",
        "Trash",
        "Trash pickup Tuesday.",
    );
    elsewhere.town_id = "shelbyville".to_string();
    store.upsert_document(&elsewhere, now).await.unwrap();

    let local_tiers = [RelevanceTier::Primary, RelevanceTier::Regional];
    let local_only = store
        .search_documents(TOWN, &local_tiers, "trash pickup?", 10)
        .await
        .unwrap();
    assert_eq!(local_only.len(), 1);
    assert_eq!(local_only[0].canonical_url, "https://springfield.gov/dpw/trash");
    assert!(local_only[0].snippet.contains("Monday"));

    let with_state = store
        .search_documents(
            TOWN,
            &[RelevanceTier::Primary, RelevanceTier::Regional, RelevanceTier::State],
            "trash",
            10,
        )
        .await
        .unwrap();
    assert_eq!(with_state.len(), 2);

    let nothing = store
        .search_documents(TOWN, &[RelevanceTier::Primary], "\"(*)\"", 10)
        .await
        .unwrap();
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn test_change_state_and_discovery() {
    let (_tmp, store) = open_store().await;
    let now = Utc::now();
    let url = "https://springfield.gov/news/hearing";

    assert!(store.insert_discovered(TOWN, url, Some("feed-1"), now).await.unwrap());
    assert!(!store.insert_discovered(TOWN, url, Some("feed-1"), now).await.unwrap());

    let discovered = store.get_change_state(TOWN, url).await.unwrap().unwrap();
    assert_eq!(discovered.last_hash, None);
    assert_eq!(discovered.source_id.as_deref(), Some("feed-1"));

    let checked = ChangeDetectionState {
        last_hash: Some(content_hash("Hearing moved.")),
        last_checked_at: Some(now),
        last_changed_at: Some(now),
        status: ChangeStatus::Changed,
        ..discovered
    };
    store.put_change_state(&checked).await.unwrap();

    let tracked = store.tracked_states(TOWN).await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].status, ChangeStatus::Changed);
    assert_eq!(tracked[0].last_hash, checked.last_hash);
    assert!(store.tracked_states("shelbyville").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claims_are_exclusive_until_expiry() {
    let (_tmp, store) = open_store().await;
    let now = Utc::now();
    let key = "trash pickup";

    assert_eq!(
        store
            .try_claim(TOWN, key, "a", now + Duration::seconds(60), now)
            .await
            .unwrap(),
        ClaimOutcome::Acquired { took_over_expired: false }
    );
    assert_eq!(
        store
            .try_claim(TOWN, key, "b", now + Duration::seconds(60), now)
            .await
            .unwrap(),
        ClaimOutcome::Held
    );

    // Once the first claim lapses, another owner takes it over.
    let later = now + Duration::seconds(61);
    assert_eq!(
        store
            .try_claim(TOWN, key, "b", later + Duration::seconds(60), later)
            .await
            .unwrap(),
        ClaimOutcome::Acquired { took_over_expired: true }
    );

    // A stale release from the first owner does not drop b's claim.
    store.release_claim(TOWN, key, "a").await.unwrap();
    assert_eq!(
        store
            .try_claim(TOWN, key, "c", later + Duration::seconds(60), later)
            .await
            .unwrap(),
        ClaimOutcome::Held
    );

    store.release_claim(TOWN, key, "b").await.unwrap();
    assert_eq!(
        store
            .try_claim(TOWN, key, "c", later + Duration::seconds(60), later)
            .await
            .unwrap(),
        ClaimOutcome::Acquired { took_over_expired: false }
    );
}

#[tokio::test]
async fn test_cache_entries_invalidate_and_purge() {
    let (_tmp, store) = open_store().await;
    let now = Utc::now();
    let entry = |key: &str, town: &str, expires_in: i64| CacheEntry {
        normalized_key: key.to_string(),
        town_id: town.to_string(),
        answer_html: "<p>Mondays</p>".to_string(),
        sources: vec![AnswerSource {
            title: Some("Trash pickup".to_string()),
            url: "https://springfield.gov/dpw/trash".to_string(),
        }],
        created_at: now,
        expires_at: now + Duration::seconds(expires_in),
    };

    store.put_entry(&entry("trash pickup", TOWN, 3600)).await.unwrap();
    store.put_entry(&entry("old question", TOWN, -10)).await.unwrap();
    store.put_entry(&entry("trash pickup", "shelbyville", 3600)).await.unwrap();

    let stored = store.get_entry(TOWN, "trash pickup").await.unwrap().unwrap();
    assert_eq!(stored.sources.len(), 1);
    assert_eq!(stored.answer_html, "<p>Mondays</p>");

    assert_eq!(store.purge_expired(now).await.unwrap(), 1);
    assert!(store.get_entry(TOWN, "old question").await.unwrap().is_none());

    assert!(store.invalidated_at(TOWN).await.unwrap().is_none());
    assert_eq!(store.invalidate_town(TOWN, now).await.unwrap(), 1);
    assert!(store.get_entry(TOWN, "trash pickup").await.unwrap().is_none());

    // The watermark only moves forward.
    store
        .invalidate_town(TOWN, now - Duration::seconds(30))
        .await
        .unwrap();
    let mark = store.invalidated_at(TOWN).await.unwrap().unwrap();
    assert_eq!(mark.timestamp_millis(), now.timestamp_millis());
    assert!(store.invalidated_at("shelbyville").await.unwrap().is_none());
    assert!(store
        .get_entry("shelbyville", "trash pickup")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_execute_statement_reports_rows() {
    let (_tmp, store) = open_store().await;
    let s = source("https://springfield.gov/minutes", RelevanceTier::Primary);
    store.upsert_source(&s).await.unwrap();
    let affected = store
        .execute_statement("UPDATE sources SET is_active = 0")
        .await
        .unwrap();
    assert_eq!(affected, 1);
}
