//! # Town Hub
//!
//! Ingestion, freshness, and retrieval-routing pipeline for a municipal
//! information hub.
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Connectors  │──▶│ Runner       │──▶│  SQLite    │
//! │ page / rss  │   │ canon + hash │   │  FTS5      │
//! └─────────────┘   └──────────────┘   └─────┬─────┘
//!        ▲                                   │
//! ┌──────┴──────┐                  ┌─────────┴────────┐
//! │  Monitor    │                  │ classify tiers   │
//! │ change det. │                  │ → answer cache   │
//! └─────────────┘                  │ → telemetry      │
//!                                  └──────────────────┘
//! ```
//!
//! Both triggers run under a deadline below the hosting ceiling and return
//! partial results rather than being killed mid-write.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`hub`] | Dependency container |
//! | [`ingest`] | Connector Runner |
//! | [`monitor`] | Change Detection Monitor |
//! | [`cache`] | Answer cache with single-flight computation |
//! | [`search`] | Keyword search and the answer path |
//! | [`telemetry`] | Fire-and-forget search telemetry |
//! | [`traits`] | Connector trait and registry |
//! | [`server`] | HTTP trigger server |
//! | [`sqlite_store`] | SQLite implementation of the store traits |

pub mod cache;
pub mod config;
pub mod connector_page;
pub mod connector_rss;
pub mod db;
pub mod deadline;
pub mod extract;
pub mod fetch;
pub mod hub;
pub mod ingest;
pub mod migrate;
pub mod monitor;
pub mod search;
pub mod server;
pub mod sources;
pub mod sqlite_store;
pub mod telemetry;
pub mod traits;
