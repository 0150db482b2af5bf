//! Content hashing for change detection and upsert decisions.
//!
//! Hashes are computed over a normalized rendering of the content so that
//! incidental churn (re-indentation, attribute reordering, injected
//! scripts, comment timestamps) does not register as a change.
//!
//! # Normalization
//!
//! 1. Drop `<script>`, `<style>`, and `<noscript>` blocks and HTML comments.
//! 2. Replace remaining tags with whitespace.
//! 3. Decode the common named and numeric entities.
//! 4. Collapse whitespace runs to a single space and trim.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<noscript\b.*?</noscript\s*>|<!--.*?-->")
        .expect("block pattern must compile")
});

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</?[A-Za-z!][^>]*>").expect("tag pattern must compile"));

static NUMERIC_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&#(x[0-9A-Fa-f]+|[0-9]+);").expect("entity pattern must compile")
});

/// Reduce HTML (or plain text) to its visible text, whitespace-collapsed.
pub fn normalize_content(content: &str) -> String {
    let without_blocks = BLOCKS.replace_all(content, " ");
    let without_tags = TAGS.replace_all(&without_blocks, " ");
    let decoded = decode_entities(&without_tags);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(content: &str) -> String {
    sha256_hex(normalize_content(content).as_bytes())
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn decode_entities(text: &str) -> String {
    let numeric = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_default()
    });
    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
