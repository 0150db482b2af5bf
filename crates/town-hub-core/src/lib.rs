//! # Town Hub Core
//!
//! Runtime-free logic shared by the Town Hub pipeline: the data model,
//! error taxonomy, URL canonicalization, query normalization, relevance
//! tier classification, content hashing, and the storage traits.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. Everything
//! here is deterministic and can be exercised without I/O.

pub mod canonical;
pub mod error;
pub mod hash;
pub mod models;
pub mod query;
pub mod store;
pub mod tiers;

pub use canonical::canonicalize;
pub use error::{ErrorKind, ItemError, PipelineError};
pub use hash::content_hash;
pub use query::normalize_query;
pub use tiers::get_search_tiers;
