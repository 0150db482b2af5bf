//! RSS/Atom feed connector.
//!
//! Takes at most `max_pages` entries from the feed. With `max_depth >= 1`
//! each entry's linked page is fetched and its visible text indexed;
//! otherwise the entry summary is indexed as-is.

use async_trait::async_trait;
use url::Url;

use town_hub_core::models::{Source, SourceItem};
use town_hub_core::PipelineError;

use crate::extract::{parse_feed, parse_html, resolve_link};
use crate::traits::{Connector, ConnectorContext, ScanOutput};

pub struct RssConnector {
    source: Source,
}

impl RssConnector {
    pub fn new(source: Source) -> Self {
        Self { source }
    }

    pub fn factory(source: &Source) -> Result<Box<dyn Connector>, PipelineError> {
        Url::parse(&source.url).map_err(|e| {
            PipelineError::config(format!(
                "invalid feed url '{}' for {}: {}",
                source.url,
                source.label(),
                e
            ))
        })?;
        Ok(Box::new(Self::new(source.clone())))
    }
}

#[async_trait]
impl Connector for RssConnector {
    fn connector_type(&self) -> &str {
        "rss"
    }

    async fn scan(&self, ctx: &ConnectorContext) -> Result<ScanOutput, PipelineError> {
        let mut out = ScanOutput::default();
        let Some(feed) = ctx.fetch(&self.source.url).await? else {
            out.deadline_reached = true;
            return Ok(out);
        };
        let entries = parse_feed(&feed.body)?;
        let follow_links = self.source.max_depth >= 1;

        for (i, entry) in entries
            .iter()
            .take(self.source.max_pages as usize)
            .enumerate()
        {
            if ctx.deadline.is_past() {
                out.deadline_reached = true;
                break;
            }

            let Some(link) = entry.resolved_link() else {
                let context = format!("{} entry #{}", self.source.url, i + 1);
                out.errors
                    .push(PipelineError::parse(context, "feed entry has no link").into());
                continue;
            };
            let Some(link) = resolve_link(&feed.url, link) else {
                let err = PipelineError::parse(link, "feed entry link is not an http(s) URL");
                out.errors.push(err.into());
                continue;
            };

            if !follow_links {
                let body = entry
                    .summary
                    .clone()
                    .or_else(|| entry.title.clone())
                    .unwrap_or_default();
                if body.is_empty() {
                    out.errors
                        .push(PipelineError::parse(link.as_str(), "feed entry has no text").into());
                    continue;
                }
                out.items.push(SourceItem {
                    url: link,
                    title: entry.title.clone(),
                    body,
                    content_type: "text/plain".to_string(),
                });
                continue;
            }

            ctx.pause().await;
            let page = match ctx.fetch(&link).await {
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
            let parsed = parse_html(&page.body, &link);
            if parsed.text.is_empty() {
                out.errors
                    .push(PipelineError::parse(link.as_str(), "page has no visible text").into());
                continue;
            }
            out.items.push(SourceItem {
                url: link,
                title: entry.title.clone().or(parsed.title),
                body: parsed.text,
                content_type: page.content_type,
            });
        }

        Ok(out)
    }
}
