//! Connector extension point.
//!
//! Every [`Source`] names a connector type. The runner looks the type up in
//! a [`ConnectorRegistry`] (an explicit `type → factory` map built once at
//! start-up) and asks the factory for a [`Connector`] bound to that source.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │          ConnectorRegistry           │
//! │  "page" → PageConnector::factory     │
//! │  "rss"  → RssConnector::factory      │
//! │  "..."  → custom (Rust) factories    │
//! └──────────────────┬───────────────────┘
//!                    ▼
//!     ingest::run() → canonicalize → hash → upsert
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use town_hub::traits::{Connector, ConnectorContext, ConnectorRegistry, ScanOutput};
//! use town_hub_core::models::Source;
//! use town_hub_core::PipelineError;
//!
//! struct Bulletin;
//!
//! #[async_trait]
//! impl Connector for Bulletin {
//!     fn connector_type(&self) -> &str { "bulletin" }
//!
//!     async fn scan(&self, _ctx: &ConnectorContext) -> Result<ScanOutput, PipelineError> {
//!         Ok(ScanOutput::default())
//!     }
//! }
//!
//! let mut registry = ConnectorRegistry::with_builtins();
//! registry.register(
//!     "bulletin",
//!     Arc::new(|_: &Source| Ok::<Box<dyn Connector>, PipelineError>(Box::new(Bulletin))),
//! );
//! assert!(registry.contains("bulletin"));
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use town_hub_core::models::{Source, SourceItem};
use town_hub_core::{ItemError, PipelineError};

use crate::deadline::Deadline;
use crate::fetch::{FetchedPage, Fetcher};

/// Everything a connector may use while scanning.
#[derive(Clone)]
pub struct ConnectorContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub deadline: Deadline,
    /// Pause between consecutive fetches to the same site.
    pub request_delay: Duration,
}

impl ConnectorContext {
    /// Fetch `url`, abandoning it (retries and backoff included) when the
    /// deadline passes. `Ok(None)` means the deadline won.
    pub async fn fetch(&self, url: &str) -> Result<Option<FetchedPage>, PipelineError> {
        match tokio::time::timeout_at(self.deadline.instant(), self.fetcher.fetch(url)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Politeness pause between fetches, cut short by the deadline.
    pub async fn pause(&self) {
        let delay = self.request_delay.min(self.deadline.remaining());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Items produced by one scan, with the per-item failures met on the way.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub items: Vec<SourceItem>,
    pub errors: Vec<ItemError>,
    /// The scan stopped early because the deadline passed.
    pub deadline_reached: bool,
}

/// A content-source connector bound to one [`Source`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Type name this connector was registered under (e.g. `"page"`).
    fn connector_type(&self) -> &str;

    /// Fetch the source and return its items.
    ///
    /// Per-item failures go into [`ScanOutput::errors`]. An `Err` means the
    /// source as a whole could not be read (e.g. the feed itself is down).
    /// Fetches go through [`ConnectorContext::fetch`] so the scan returns
    /// with what it has once the deadline passes.
    async fn scan(&self, ctx: &ConnectorContext) -> Result<ScanOutput, PipelineError>;
}

/// Builds a connector for a source, or rejects the source's settings.
pub type ConnectorFactory =
    Arc<dyn Fn(&Source) -> Result<Box<dyn Connector>, PipelineError> + Send + Sync>;

/// Explicit map from connector type to factory.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `page` and `rss` connectors.
    pub fn with_builtins() -> Self {
        use crate::connector_page::PageConnector;
        use crate::connector_rss::RssConnector;

        let mut registry = Self::new();
        registry.register("page", Arc::new(PageConnector::factory));
        registry.register("rss", Arc::new(RssConnector::factory));
        registry
    }

    /// Register (or replace) the factory for a type.
    pub fn register(&mut self, connector_type: impl Into<String>, factory: ConnectorFactory) {
        self.factories.insert(connector_type.into(), factory);
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.factories.contains_key(connector_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Instantiate the connector for a source.
    pub fn instantiate(&self, source: &Source) -> Result<Box<dyn Connector>, PipelineError> {
        let factory = self.factories.get(&source.source_type).ok_or_else(|| {
            PipelineError::config(format!(
                "no connector registered for type '{}' (source {})",
                source.source_type,
                source.label()
            ))
        })?;
        factory(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use town_hub_core::models::{RelevanceTier, Schedule};

    fn source(kind: &str) -> Source {
        Source {
            id: "s1".into(),
            town_id: "springfield".into(),
            name: None,
            url: "https://springfield.gov".into(),
            source_type: kind.into(),
            schedule: Schedule::Daily,
            priority: 1,
            max_depth: 1,
            max_pages: 5,
            is_active: true,
            tier: RelevanceTier::Primary,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ConnectorRegistry::with_builtins();
        assert_eq!(registry.types(), vec!["page", "rss"]);
        assert!(registry.instantiate(&source("page")).is_ok());
    }

    #[test]
    fn test_unregistered_type_is_config_error() {
        let registry = ConnectorRegistry::with_builtins();
        let err = match registry.instantiate(&source("ftp")) {
            Err(e) => e,
            Ok(_) => panic!("ftp should not resolve"),
        };
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("ftp"));
    }
}
