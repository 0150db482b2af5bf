//! URL canonicalization for document deduplication.
//!
//! [`canonicalize`] is a total function: every input produces a key, and
//! unparsable input falls back to its trimmed, lowercased form.
//!
//! # Algorithm
//!
//! Applied in this fixed order:
//!
//! 1. Force the scheme to `https`.
//! 2. Strip leading `www.` labels from the host.
//! 3. Drop the fragment.
//! 4. Remove tracking query parameters (`utm_*`, `fbclid`, `gclid`, `ref`, `source`).
//! 5. Strip trailing slashes from the path unless the path is the root `/`.
//! 6. Lowercase the whole result.
//!
//! Tracking keys are matched after ASCII lowercasing and every trailing
//! slash is removed, so that step 6 never exposes work for a second pass:
//! `canonicalize(canonicalize(u)) == canonicalize(u)`.
//!
//! # Example
//!
//! ```rust
//! use town_hub_core::canonical::canonicalize;
//!
//! assert_eq!(
//!     canonicalize("http://WWW.Example.com/path/?utm_source=x&ref=y#frag"),
//!     "https://example.com/path"
//! );
//! ```

use url::Url;

/// Exact-match tracking parameter keys.
const TRACKING_KEYS: &[&str] = &["fbclid", "gclid", "ref", "source"];

/// Prefix-match tracking parameter keys.
const TRACKING_PREFIX: &str = "utm_";

/// Normalize a raw URL into its deduplication key.
pub fn canonicalize(raw_url: &str) -> String {
    let trimmed = raw_url.trim();
    let fallback = || trimmed.to_lowercase();

    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return fallback(),
    };

    // Only special schemes can be switched to https.
    if url.scheme() != "https" && url.set_scheme("https").is_err() {
        return fallback();
    }

    let stripped_host = url.host_str().and_then(strip_www).map(str::to_string);
    if let Some(host) = stripped_host {
        if url.set_host(Some(&host)).is_err() {
            return fallback();
        }
    }

    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !is_tracking_key(key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = url.path().to_string();
    if path != "/" && path.ends_with('/') {
        let trimmed_path = path.trim_end_matches('/');
        if trimmed_path.is_empty() {
            url.set_path("/");
        } else {
            url.set_path(trimmed_path);
        }
    }

    url.as_str().to_lowercase()
}

/// Host without any stack of leading `www.` labels, or `None` when there
/// is nothing to strip.
fn strip_www(host: &str) -> Option<&str> {
    let mut rest = host;
    while let Some(next) = rest.strip_prefix("www.").filter(|next| !next.is_empty()) {
        rest = next;
    }
    (rest.len() < host.len()).then_some(rest)
}

fn is_tracking_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with(TRACKING_PREFIX) || TRACKING_KEYS.contains(&key.as_str())
}

/// Host of a canonical URL, used to keep crawls on one site.
pub fn canonical_host(raw_url: &str) -> Option<String> {
    Url::parse(&canonicalize(raw_url))
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
