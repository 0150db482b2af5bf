//! Error taxonomy for the ingestion, freshness, and retrieval pipeline.
//!
//! Per-item and per-connector failures are never thrown past their owning
//! boundary. They are converted into [`ItemError`] values and collected in
//! run results, so partial-failure aggregation is plain data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Parse,
    Config,
    Persistence,
    DeadlineExceeded,
    CacheClaimExpired,
    UnsupportedOperation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Parse => "parse",
            ErrorKind::Config => "config",
            ErrorKind::Persistence => "persistence",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::CacheClaimExpired => "cache_claim_expired",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Network failure, timeout, or non-success status retrieving a URL.
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Malformed content at a single item.
    #[error("parse failed for {context}: {message}")]
    Parse { context: String, message: String },

    /// A source or setting is unusable as configured.
    #[error("configuration error: {0}")]
    Config(String),

    /// A write to the backing store failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The execution ceiling is close; work stopped early.
    #[error("deadline reached: {0}")]
    DeadlineExceeded(String),

    /// An in-flight cache computation outlived its claim.
    #[error("cache claim expired for key '{0}'")]
    CacheClaimExpired(String),

    /// The backend does not provide the requested capability.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl PipelineError {
    pub fn fetch(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn persistence(message: impl std::fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch { .. } => ErrorKind::Fetch,
            PipelineError::Parse { .. } => ErrorKind::Parse,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            PipelineError::CacheClaimExpired(_) => ErrorKind::CacheClaimExpired,
            PipelineError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
        }
    }

    /// The URL this error concerns, when there is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            PipelineError::Fetch { url, .. } => Some(url),
            PipelineError::Parse { context, .. } if context.starts_with("http") => Some(context),
            _ => None,
        }
    }

    pub fn to_item_error(&self) -> ItemError {
        ItemError {
            kind: self.kind(),
            url: self.url().map(str::to_string),
            message: self.to_string(),
        }
    }
}

/// Structured per-item failure recorded in a run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ErrorKind, url: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.map(str::to_string),
            message: message.into(),
        }
    }

    /// Wrap an untyped store failure as a persistence error.
    pub fn persistence(url: Option<&str>, err: &anyhow::Error) -> Self {
        Self::new(ErrorKind::Persistence, url, format!("persistence error: {err:#}"))
    }
}

impl From<PipelineError> for ItemError {
    fn from(err: PipelineError) -> Self {
        err.to_item_error()
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_keeps_url() {
        let err = PipelineError::fetch("https://town.gov/a", "timed out");
        let item = err.to_item_error();
        assert_eq!(item.kind, ErrorKind::Fetch);
        assert_eq!(item.url.as_deref(), Some("https://town.gov/a"));
        assert!(item.message.contains("timed out"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
    }

    #[test]
    fn test_config_error_has_no_url() {
        let item: ItemError = PipelineError::config("no connector for type 'ftp'").into();
        assert_eq!(item.kind, ErrorKind::Config);
        assert!(item.url.is_none());
    }
}
