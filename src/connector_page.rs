//! Web page connector.
//!
//! Crawls breadth-first from the source URL, staying on the source's host.
//! `max_depth` bounds link hops from the start page and `max_pages` bounds
//! the number of fetches, so the crawl terminates on any site. URLs are
//! deduplicated by canonical form before they are queued.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use tracing::debug;
use url::Url;

use town_hub_core::canonical::canonical_host;
use town_hub_core::models::{Source, SourceItem};
use town_hub_core::{canonicalize, PipelineError};

use crate::extract::parse_html;
use crate::traits::{Connector, ConnectorContext, ScanOutput};

pub struct PageConnector {
    source: Source,
}

impl PageConnector {
    pub fn new(source: Source) -> Self {
        Self { source }
    }

    pub fn factory(source: &Source) -> Result<Box<dyn Connector>, PipelineError> {
        Url::parse(&source.url).map_err(|e| {
            PipelineError::config(format!(
                "invalid url '{}' for {}: {}",
                source.url,
                source.label(),
                e
            ))
        })?;
        Ok(Box::new(Self::new(source.clone())))
    }
}

#[async_trait]
impl Connector for PageConnector {
    fn connector_type(&self) -> &str {
        "page"
    }

    async fn scan(&self, ctx: &ConnectorContext) -> Result<ScanOutput, PipelineError> {
        let mut out = ScanOutput::default();
        let host = canonical_host(&self.source.url);

        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(canonicalize(&self.source.url));
        queue.push_back((self.source.url.clone(), 0));

        let mut fetched = 0u32;
        while let Some((url, depth)) = queue.pop_front() {
            if fetched >= self.source.max_pages {
                break;
            }
            if ctx.deadline.is_past() {
                out.deadline_reached = true;
                break;
            }
            if fetched > 0 {
                ctx.pause().await;
            }
            fetched += 1;

            let page = match ctx.fetch(&url).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    out.deadline_reached = true;
                    break;
                }
                Err(e) => {
                    out.errors.push(e.into());
                    continue;
                }
            };

            let (title, body) = if page.is_html() {
                let parsed = parse_html(&page.body, &url);
                if depth < self.source.max_depth {
                    for link in parsed.links {
                        if canonical_host(&link) != host {
                            continue;
                        }
                        if seen.insert(canonicalize(&link)) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
                (parsed.title, parsed.text)
            } else {
                (None, page.body.trim().to_string())
            };

            if body.is_empty() {
                out.errors
                    .push(PipelineError::parse(url.as_str(), "page has no visible text").into());
                continue;
            }

            out.items.push(SourceItem {
                url,
                title,
                body,
                content_type: page.content_type,
            });
        }

        debug!(
            source = %self.source.label(),
            fetched,
            items = out.items.len(),
            errors = out.errors.len(),
            "page crawl finished"
        );
        Ok(out)
    }
}
