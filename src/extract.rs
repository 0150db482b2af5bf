//! Content extraction for fetched pages and feeds.
//!
//! HTML pages are parsed with `scraper` into a title, visible text, and
//! outbound links. RSS 2.0 and Atom feeds are read with a `quick-xml`
//! event reader into [`FeedEntry`] values.

use quick_xml::events::{BytesStart, Event};
use scraper::{Html, Selector};
use url::Url;

use town_hub_core::PipelineError;

/// Elements whose text is never user-visible.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// A parsed HTML page.
#[derive(Debug, Clone, Default)]
pub struct HtmlPage {
    pub title: Option<String>,
    pub text: String,
    /// Absolute http(s) links in document order, fragments dropped, deduplicated.
    pub links: Vec<String>,
}

pub fn parse_html(html: &str, base_url: &str) -> HtmlPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|t| collapse(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty())
    });

    let mut text = String::new();
    for node in document.tree.root().descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let trimmed = fragment.trim();
        if !trimmed.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(trimmed);
        }
    }

    HtmlPage {
        title,
        text: collapse(&text),
        links: extract_links(&document, base_url),
    }
}

fn extract_links(document: &Html, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(link_selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links: Vec<String> = Vec::new();
    for element in document.select(&link_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let resolved = resolved.to_string();
        if !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    links
}

/// Resolve a feed or page link against the URL it was found at. Only
/// http(s) results are returned.
pub fn resolve_link(base_url: &str, link: &str) -> Option<String> {
    let link = link.trim();
    let resolved = match Url::parse(base_url) {
        Ok(base) => base.join(link).ok()?,
        Err(_) => Url::parse(link).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One `<item>` (RSS) or `<entry>` (Atom).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
    pub guid: Option<String>,
}

impl FeedEntry {
    /// The entry's page URL: `link`, or `guid` when it is an absolute http(s) URL.
    pub fn resolved_link(&self) -> Option<&str> {
        self.link.as_deref().filter(|l| !l.is_empty()).or_else(|| {
            self.guid
                .as_deref()
                .filter(|g| g.starts_with("http://") || g.starts_with("https://"))
        })
    }

    fn push_field(&mut self, field: &[u8], text: &str) {
        let slot = match field {
            b"title" => &mut self.title,
            b"link" => &mut self.link,
            b"description" | b"summary" | b"content" | b"encoded" => &mut self.summary,
            b"guid" | b"id" => &mut self.guid,
            b"pubDate" | b"published" | b"updated" | b"date" => &mut self.published,
            _ => return,
        };
        slot.get_or_insert_with(String::new).push_str(text);
    }
}

/// Parse an RSS 2.0 or Atom document.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, PipelineError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"item" | b"entry" => current = Some(FeedEntry::default()),
                    b"link" => {
                        if let Some(entry) = current.as_mut() {
                            apply_atom_link(entry, &e);
                        }
                    }
                    _ => {}
                }
                field = Some(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" {
                    if let Some(entry) = current.as_mut() {
                        apply_atom_link(entry, &e);
                    }
                }
            }
            Ok(Event::Text(te)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field.as_deref()) {
                    let text = te
                        .unescape()
                        .map_err(|e| PipelineError::parse("feed", e))?;
                    entry.push_field(f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field.as_deref()) {
                    entry.push_field(f, &String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(e)) => {
                if matches!(e.local_name().as_ref(), b"item" | b"entry") {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PipelineError::parse("feed", e)),
            _ => {}
        }
        buf.clear();
    }

    for entry in &mut entries {
        if let Some(summary) = entry.summary.take() {
            let visible = town_hub_core::hash::normalize_content(&summary);
            entry.summary = (!visible.is_empty()).then_some(visible);
        }
        entry.title = entry.title.take().map(|t| collapse(&t));
        entry.link = entry.link.take().map(|l| l.trim().to_string());
    }

    Ok(entries)
}

/// Atom carries links as `<link rel="alternate" href="..."/>`.
fn apply_atom_link(entry: &mut FeedEntry, e: &BytesStart<'_>) {
    if entry.link.is_some() {
        return;
    }
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"rel" => rel = Some(value.into_owned()),
            _ => {}
        }
    }
    if let Some(href) = href {
        if rel.as_deref().map_or(true, |r| r == "alternate") {
            entry.link = Some(href);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_title_text_and_links() {
        let html = r##"
            <html><head><title> Board of Health </title><style>p{}</style></head>
            <body>
              <h1>Agenda</h1>
              <script>var x = "hidden";</script>
              <p>Meeting   Tuesday</p>
              <a href="/minutes#top">Minutes</a>
              <a href="https://springfield.gov/minutes">Again</a>
              <a href="mailto:clerk@springfield.gov">Mail</a>
              <a href="#skip">Skip</a>
            </body></html>"##;
        let page = parse_html(html, "https://springfield.gov/health/");
        assert_eq!(page.title.as_deref(), Some("Board of Health"));
        assert_eq!(page.text, "Agenda Meeting Tuesday Minutes Again Mail Skip");
        assert_eq!(page.links, vec!["https://springfield.gov/minutes"]);
    }

    #[test]
    fn test_rss_items() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel><title>Town News</title>
              <item>
                <title>Road closure</title>
                <link>https://springfield.gov/news/road</link>
                <description><![CDATA[<p>Main St closed &amp; detoured</p>]]></description>
                <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
              </item>
              <item>
                <title>No link</title>
                <guid>https://springfield.gov/news/guid-only</guid>
              </item>
            </channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title.as_deref(), Some("Road closure"));
        assert_eq!(entries[0].resolved_link(), Some("https://springfield.gov/news/road"));
        assert_eq!(entries[0].summary.as_deref(), Some("Main St closed & detoured"));
        assert_eq!(entries[1].resolved_link(), Some("https://springfield.gov/news/guid-only"));
    }

    #[test]
    fn test_atom_entries() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
              <title>Clerk</title>
              <link href="https://springfield.gov/"/>
              <entry>
                <title>Election notice</title>
                <link rel="edit" href="https://springfield.gov/admin/1"/>
                <link rel="alternate" href="https://springfield.gov/clerk/election"/>
                <summary>Polls open at 7am</summary>
                <updated>2025-01-06T10:00:00Z</updated>
              </entry>
            </feed>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resolved_link(), Some("https://springfield.gov/clerk/election"));
        assert_eq!(entries[0].published.as_deref(), Some("2025-01-06T10:00:00Z"));
    }

    #[test]
    fn test_resolve_link() {
        let base = "https://springfield.gov/news/rss";
        assert_eq!(
            resolve_link(base, "/news/budget").as_deref(),
            Some("https://springfield.gov/news/budget")
        );
        assert_eq!(
            resolve_link(base, " https://mass.gov/dor ").as_deref(),
            Some("https://mass.gov/dor")
        );
        assert_eq!(resolve_link(base, "mailto:clerk@springfield.gov"), None);
        assert_eq!(resolve_link("not a url", "/relative"), None);
    }

    #[test]
    fn test_malformed_feed_is_parse_error() {
        let err = parse_feed("<rss><channel><item><title>x</item></rss>").unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }
}
