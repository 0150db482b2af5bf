use anyhow::Result;
use tracing::debug;

use town_hub_core::store::Store;

/// Schema statements, each idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        town_id TEXT NOT NULL,
        name TEXT,
        url TEXT NOT NULL,
        type TEXT NOT NULL,
        schedule TEXT NOT NULL,
        priority INTEGER NOT NULL,
        max_depth INTEGER NOT NULL,
        max_pages INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        tier TEXT NOT NULL DEFAULT 'primary'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        town_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        canonical_url TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        title TEXT,
        body TEXT NOT NULL,
        tier TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        last_changed_at INTEGER NOT NULL,
        UNIQUE(town_id, canonical_url)
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
        document_id UNINDEXED,
        title,
        body
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS connector_runs (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER NOT NULL,
        items_upserted INTEGER NOT NULL,
        items_skipped INTEGER NOT NULL,
        error_count INTEGER NOT NULL,
        successful INTEGER NOT NULL,
        result_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_detection_state (
        town_id TEXT NOT NULL,
        url TEXT NOT NULL,
        source_id TEXT,
        last_hash TEXT,
        last_checked_at INTEGER,
        last_changed_at INTEGER,
        status TEXT NOT NULL,
        PRIMARY KEY (town_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS monitor_runs (
        id TEXT PRIMARY KEY,
        town_id TEXT NOT NULL,
        trigger_source TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        checked_urls INTEGER NOT NULL,
        changed_count INTEGER NOT NULL,
        new_count INTEGER NOT NULL,
        error_count INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        deadline_reached INTEGER NOT NULL,
        report_json TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS answer_cache (
        town_id TEXT NOT NULL,
        normalized_key TEXT NOT NULL,
        answer_html TEXT NOT NULL,
        sources_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (town_id, normalized_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_claims (
        town_id TEXT NOT NULL,
        normalized_key TEXT NOT NULL,
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (town_id, normalized_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_invalidations (
        town_id TEXT PRIMARY KEY,
        invalidated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_telemetry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        town_id TEXT NOT NULL,
        query TEXT NOT NULL,
        normalized_key TEXT NOT NULL,
        tiers TEXT NOT NULL,
        cache_hit INTEGER NOT NULL,
        result_count INTEGER NOT NULL,
        latency_ms INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sources_town ON sources(town_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_town_tier ON documents(town_id, tier)",
    "CREATE INDEX IF NOT EXISTS idx_connector_runs_source ON connector_runs(source_id, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_monitor_runs_town ON monitor_runs(town_id, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_answer_cache_expires ON answer_cache(expires_at)",
];

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(store: &dyn Store) -> Result<()> {
    for statement in SCHEMA {
        store.execute_statement(statement).await?;
    }
    debug!(statements = SCHEMA.len(), "schema migrations applied");
    Ok(())
}
