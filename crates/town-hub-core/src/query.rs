//! Query normalization for answer-cache keys.
//!
//! Two queries that differ only in case, punctuation, or spacing map to the
//! same key. The empty string is a valid key.

/// Derive the cache key for a free-text query.
///
/// 1. Lowercase.
/// 2. Drop every character that is not a letter, digit, or whitespace.
/// 3. Collapse whitespace runs to a single space.
/// 4. Trim.
///
/// ```rust
/// use town_hub_core::query::normalize_query;
///
/// assert_eq!(normalize_query("Transfer Station Hours?"), "transfer station hours");
/// assert_eq!(normalize_query("???!!!"), "");
/// ```
pub fn normalize_query(query: &str) -> String {
    let kept: String = query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a normalized query into search terms.
pub fn query_terms(query: &str) -> Vec<String> {
    normalize_query(query)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_variants_share_a_key() {
        let expected = "transfer station hours";
        assert_eq!(normalize_query("Transfer Station Hours?"), expected);
        assert_eq!(normalize_query("transfer   station   hours"), expected);
        assert_eq!(normalize_query("TRANSFER STATION HOURS!"), expected);
        assert_eq!(normalize_query("\ttransfer\nstation hours  "), expected);
    }

    #[test]
    fn test_punctuation_only_is_empty() {
        assert_eq!(normalize_query("???!!!"), "");
        assert_eq!(normalize_query(""), "");
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn test_digits_and_unicode_letters_survive() {
        assert_eq!(normalize_query("Route 9 — Café hours"), "route 9 café hours");
    }

    #[test]
    fn test_punctuation_inside_words_is_removed_not_split() {
        assert_eq!(normalize_query("don't e-mail"), "dont email");
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("When is  trash pickup?"), vec!["when", "is", "trash", "pickup"]);
        assert!(query_terms("?!").is_empty());
    }
}
