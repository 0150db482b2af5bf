//! Search and answer path.
//!
//! A query is classified into relevance tiers, then answered through the
//! [`AnswerCache`](crate::cache::AnswerCache): on a miss, keyword search
//! runs over the town's documents in those tiers and the hits are handed
//! to a [`TextGenerator`]. Each answered query emits one telemetry event.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;

use town_hub_core::get_search_tiers;
use town_hub_core::models::{AnswerSource, RelevanceTier, SearchHit, SearchTelemetry};
use town_hub_core::normalize_query;

use crate::cache::ComputedAnswer;
use crate::hub::Hub;

/// Opaque text-generation capability that writes an answer from hits.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, query: &str, hits: &[SearchHit]) -> Result<String>;
}

/// Builds an HTML answer directly from hit titles and snippets.
pub struct ExtractiveGenerator;

#[async_trait]
impl TextGenerator for ExtractiveGenerator {
    async fn generate(&self, _query: &str, hits: &[SearchHit]) -> Result<String> {
        if hits.is_empty() {
            return Ok("<p>No matching information was found for this town.</p>".to_string());
        }
        let mut html = String::from("<ul>");
        for hit in hits {
            let title = hit.title.as_deref().unwrap_or(&hit.canonical_url);
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a>: {}</li>",
                escape_html(&hit.canonical_url),
                escape_html(title),
                escape_html(hit.snippet.trim())
            ));
        }
        html.push_str("</ul>");
        Ok(html)
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub town_id: String,
    pub query: String,
    pub answer_html: String,
    pub sources: Vec<AnswerSource>,
    pub tiers: Vec<RelevanceTier>,
    pub cached: bool,
}

/// Raw keyword hits for a query, restricted to its classified tiers.
pub async fn search(hub: &Hub, town_id: &str, query: &str) -> Result<Vec<SearchHit>> {
    let tiers = get_search_tiers(query);
    hub.store
        .search_documents(town_id, &tiers, query, hub.config.search.result_limit)
        .await
}

/// Answer a query through the cache.
pub async fn answer_query(hub: &Hub, town_id: &str, query: &str) -> Result<Answer> {
    let started = Instant::now();
    let tiers = get_search_tiers(query);

    let store = hub.store.clone();
    let generator = hub.generator.clone();
    let limit = hub.config.search.result_limit;
    let compute_town = town_id.to_string();
    let compute_query = query.to_string();
    let compute_tiers = tiers.clone();

    let resolved = hub
        .cache
        .get_or_compute(town_id, query, move || async move {
            let hits = store
                .search_documents(&compute_town, &compute_tiers, &compute_query, limit)
                .await?;
            let answer_html = generator.generate(&compute_query, &hits).await?;
            let sources = hits
                .into_iter()
                .map(|h| AnswerSource {
                    title: h.title,
                    url: h.canonical_url,
                })
                .collect();
            Ok(ComputedAnswer {
                answer_html,
                sources,
            })
        })
        .await?;

    let cached = resolved.origin.is_cached();
    hub.telemetry.record(SearchTelemetry {
        town_id: town_id.to_string(),
        query: query.to_string(),
        normalized_key: normalize_query(query),
        tiers: tiers.clone(),
        cache_hit: cached,
        result_count: resolved.entry.sources.len() as u64,
        latency_ms: started.elapsed().as_millis() as u64,
        created_at: Utc::now(),
    });

    Ok(Answer {
        town_id: town_id.to_string(),
        query: query.to_string(),
        answer_html: resolved.entry.answer_html,
        sources: resolved.entry.sources,
        tiers,
        cached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_extractive_answer_escapes() {
        let hits = vec![SearchHit {
            document_id: "d1".into(),
            canonical_url: "https://springfield.gov/dump".into(),
            title: Some("Transfer <Station>".into()),
            tier: RelevanceTier::Primary,
            score: 1.0,
            snippet: "Open Sat & Sun".into(),
        }];
        let html = ExtractiveGenerator.generate("dump hours", &hits).await.unwrap();
        assert!(html.contains("Transfer &lt;Station&gt;"));
        assert!(html.contains("Open Sat &amp; Sun"));
    }

    #[tokio::test]
    async fn test_extractive_answer_without_hits() {
        let html = ExtractiveGenerator.generate("anything", &[]).await.unwrap();
        assert!(html.contains("No matching information"));
    }
}
