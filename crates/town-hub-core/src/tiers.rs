//! Relevance tier classification for search queries.
//!
//! Every query searches the town's own content ([`RelevanceTier::Primary`])
//! and regional content ([`RelevanceTier::Regional`]). Queries touching a
//! state-level concern additionally search [`RelevanceTier::State`].
//!
//! Matching is case-insensitive regex matching against the raw query; any
//! single pattern match expands the scope.

use std::sync::LazyLock;

use regex::RegexSet;

use crate::models::RelevanceTier;

/// Topic patterns associated with state-level government.
const STATE_TOPIC_PATTERNS: &[&str] = &[
    // Taxation
    r"\b(income|sales|estate|excise|gas|meals)\s+tax(es)?\b",
    r"\bstate\s+tax(es|ation)?\b",
    r"\b(department|dept\.?)\s+of\s+revenue\b",
    r"\btax\s+(return|refund|filing|bracket)s?\b",
    // State benefit programs
    r"\b(medicaid|medicare|snap|ebt|wic|tanf|food\s+stamps)\b",
    r"\bunemployment(\s+(benefits|insurance|claim))?\b",
    r"\b(fuel|heating)\s+assistance\b",
    r"\bstate\s+(benefits?|programs?|aid|assistance)\b",
    // Registry and licensing
    r"\b(rmv|dmv|registry\s+of\s+motor\s+vehicles)\b",
    r"\bdriver'?s?\s+licen[cs]e\b",
    r"\b(vehicle|car)\s+registration\b",
    r"\breal\s+id\b",
    r"\bprofessional\s+licens(e|es|ing)\b",
    r"\b(hunting|fishing)\s+licen[cs]e\b",
    // State statutes and government
    r"\bstate\s+(law|laws|statute|statutes|legislature|senator|representative|constitution)\b",
    r"\bgeneral\s+laws?\b",
    r"\b(statute|statutes|legislature|governor)\b",
    // State-level housing and education policy
    r"\bstate\s+(housing|education|school)\b",
    r"\b(section\s+8|housing\s+voucher|rental\s+assistance)\b",
    r"\b(department|board)\s+of\s+(elementary\s+and\s+secondary\s+)?education\b",
    r"\b(school\s+funding\s+formula|chapter\s+70|charter\s+schools?|standardized\s+test(s|ing)?)\b",
    // State public safety and environmental regulation
    r"\bstate\s+(police|trooper|park|parks|forest|regulation|regulations|agency)\b",
    r"\b(department|dept\.?)\s+of\s+(environmental|environment|conservation|public\s+health|transportation)\b",
    r"\b(wetlands?\s+protection|emissions?\s+(test|testing|standards?)|environmental\s+regulations?)\b",
];

static STATE_TOPICS: LazyLock<RegexSet> = LazyLock::new(|| {
    let patterns: Vec<String> = STATE_TOPIC_PATTERNS
        .iter()
        .map(|p| format!("(?i){p}"))
        .collect();
    // Patterns are compile-time constants covered by tests.
    RegexSet::new(patterns).expect("state topic patterns must compile")
});

/// Map a free-text query to the tiers it may draw from.
///
/// Returns `[Primary, Regional]`, or `[Primary, Regional, State]` when the
/// query matches a state-level topic. The result is always sorted.
///
/// ```rust
/// use town_hub_core::models::RelevanceTier;
/// use town_hub_core::tiers::get_search_tiers;
///
/// assert!(get_search_tiers("what is the state income tax rate").contains(&RelevanceTier::State));
/// assert!(!get_search_tiers("when is trash pickup").contains(&RelevanceTier::State));
/// ```
pub fn get_search_tiers(query: &str) -> Vec<RelevanceTier> {
    let mut tiers = vec![RelevanceTier::Primary, RelevanceTier::Regional];
    if is_state_topic(query) {
        tiers.push(RelevanceTier::State);
    }
    tiers
}

/// Whether any state-level topic pattern matches the query.
pub fn is_state_topic(query: &str) -> bool {
    STATE_TOPICS.is_match(query)
}
