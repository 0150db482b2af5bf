//! Dependency container.
//!
//! A [`Hub`] is built once per process and passed by reference into the
//! runner, the monitor, the cache, and the trigger surfaces. Nothing in
//! the pipeline reaches for a global client or registry.

use anyhow::Result;
use std::sync::Arc;

use town_hub_core::store::Store;

use crate::cache::AnswerCache;
use crate::config::Config;
use crate::db;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::migrate;
use crate::search::{ExtractiveGenerator, TextGenerator};
use crate::sqlite_store::SqliteStore;
use crate::telemetry::{NoopTelemetry, StoreTelemetry, TelemetrySink};
use crate::traits::ConnectorRegistry;

pub struct Hub {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn Fetcher>,
    pub connectors: Arc<ConnectorRegistry>,
    pub cache: Arc<AnswerCache>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub generator: Arc<dyn TextGenerator>,
}

impl Hub {
    /// Wire the SQLite store and HTTP fetcher from configuration, applying
    /// schema migrations.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        migrate::run_migrations(store.as_ref()).await?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.http)?);
        Ok(Self::new(config, store, fetcher))
    }

    /// Assemble a hub around injected collaborators, with the built-in
    /// connectors, the extractive generator, and telemetry per config.
    pub fn new(config: Config, store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>) -> Self {
        let telemetry: Arc<dyn TelemetrySink> = if config.telemetry.enabled {
            Arc::new(StoreTelemetry::new(store.clone()))
        } else {
            Arc::new(NoopTelemetry)
        };
        let cache = Arc::new(AnswerCache::new(store.clone(), config.cache.clone()));
        Self {
            config: Arc::new(config),
            store,
            fetcher,
            connectors: Arc::new(ConnectorRegistry::with_builtins()),
            cache,
            telemetry,
            generator: Arc::new(ExtractiveGenerator),
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = Arc::new(connectors);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}
