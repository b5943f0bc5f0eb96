//! RSS / Atom feed fetching and parsing
//!
//! Feeds are fetched over HTTP and parsed with quick-xml into [`FeedItems`],
//! an ordered, restartable sequence of [`Item`]s. Every item carries a stable
//! identifier: the `<guid>` (or Atom `<id>`) when present, otherwise a SHA-256
//! digest of the link. Items with neither are dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{Error, Result};

/// Represents a single entry parsed from a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub link: String,
    /// Enclosure URL if the feed has one, otherwise the link
    pub download_url: String,
    pub published: DateTime<Utc>,
}

/// The items of one fetch, in document order.
///
/// Iterating does not consume the sequence, so it can be walked once per rule
/// set or again after a partial pass.
#[derive(Debug, Clone, Default)]
pub struct FeedItems {
    items: Vec<Item>,
}

impl FeedItems {
    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<Item>> for FeedItems {
    fn from(items: Vec<Item>) -> Self {
        Self { items }
    }
}

impl<'a> IntoIterator for &'a FeedItems {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Anything that can turn a feed URL into items
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FeedItems>;
}

/// Fetches feeds over HTTP. No retries: a failed fetch is simply reported and
/// the next scheduled tick tries again.
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: super::build_http_client(timeout)?,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<FeedItems> {
        tracing::debug!("Fetching feed: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(describe_reqwest_error(url, &e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("{} returned HTTP {}", url, status)));
        }

        let xml = response
            .text()
            .await
            .map_err(|e| Error::Fetch(describe_reqwest_error(url, &e)))?;

        parse_feed_xml(&xml)
    }
}

fn describe_reqwest_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out fetching {}", url)
    } else {
        format!("failed to fetch {}: {}", url, err)
    }
}

/// Parses RSS 2.0, RSS 1.0 (RDF) or Atom XML into feed items
///
/// `<item>` and `<entry>` elements are both recognised. Only their direct
/// children are read, so nested metadata such as an Atom `<source>` block
/// never leaks into the item. Missing or unparseable publish dates default to
/// the current time.
pub fn parse_feed_xml(xml: &str) -> Result<FeedItems> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut buf = Vec::new();
    let mut saw_root = false;
    // Number of currently open elements
    let mut depth = 0usize;

    // Current item being parsed, with the depth of its own element
    let mut current_item: Option<(ItemBuilder, usize)> = None;
    let mut current_element: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if !saw_root {
                    check_root(e)?;
                    saw_root = true;
                }
                depth += 1;
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();

                if current_item.is_none() && (name == "item" || name == "entry") {
                    current_item = Some((ItemBuilder::default(), depth));
                    current_element = None;
                } else if let Some((item, _)) = current_item.as_mut().filter(|(_, d)| depth == *d + 1) {
                    item.read_attributes(&name, e);
                    current_element = Some(name);
                } else {
                    current_element = None;
                }
            }
            Ok(Event::Empty(ref e)) => {
                if !saw_root {
                    check_root(e)?;
                    saw_root = true;
                }
                if let Some((item, item_depth)) = &mut current_item {
                    if depth == *item_depth {
                        let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                        item.read_attributes(&name, e);
                    }
                }
            }
            Ok(Event::End(_)) => {
                if current_item.as_ref().is_some_and(|(_, d)| *d == depth) {
                    if let Some((builder, _)) = current_item.take() {
                        match builder.build() {
                            Some(item) => items.push(item),
                            None => tracing::debug!("Skipping feed item without id or link"),
                        }
                    }
                }
                depth = depth.saturating_sub(1);
                current_element = None;
            }
            Ok(Event::Text(ref e)) => {
                if let (Some((item, _)), Some(element)) = (&mut current_item, &current_element) {
                    let text = e.unescape().unwrap_or_default();
                    item.push_text(element, &text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let (Some((item, _)), Some(element)) = (&mut current_item, &current_element) {
                    let text = String::from_utf8_lossy(e).to_string();
                    item.push_text(element, &text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Fetch(format!(
                    "malformed feed XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(Error::Fetch("feed document is empty".to_string()));
    }
    if current_item.is_some() {
        return Err(Error::Fetch("feed document ended inside an item".to_string()));
    }

    Ok(items.into())
}

/// The document element must be `<rss>`, `<feed>` or `<rdf:RDF>`. Anything
/// else, typically an HTML login or error page, is not a feed.
fn check_root(e: &BytesStart) -> Result<()> {
    match e.local_name().as_ref() {
        b"rss" | b"feed" | b"RDF" => Ok(()),
        other => Err(Error::Fetch(format!(
            "not an RSS/Atom document (root element <{}>)",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Builder for items while walking the XML events
#[derive(Default)]
struct ItemBuilder {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    enclosure: Option<String>,
}

impl ItemBuilder {
    fn push_text(&mut self, element: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let slot = match element {
            "title" => &mut self.title,
            "link" => &mut self.link,
            "guid" | "id" => &mut self.guid,
            "pubDate" | "published" => &mut self.published,
            "updated" | "dc:date" => &mut self.updated,
            _ => return,
        };
        slot.get_or_insert_with(String::new).push_str(text);
    }

    /// Picks up `<enclosure url=..>` and Atom `<link href=.. rel=..>`
    fn read_attributes(&mut self, name: &str, e: &BytesStart) {
        match name {
            "enclosure" => {
                if let Some(url) = attribute(e, b"url") {
                    self.enclosure.get_or_insert(url);
                }
            }
            "link" => {
                let Some(href) = attribute(e, b"href") else {
                    return;
                };
                match attribute(e, b"rel").as_deref() {
                    Some("enclosure") => {
                        self.enclosure.get_or_insert(href);
                    }
                    None | Some("alternate") => {
                        self.link.get_or_insert(href);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn build(self) -> Option<Item> {
        let link = self.link.map(|l| l.trim().to_string()).unwrap_or_default();
        let guid = self.guid.map(|g| g.trim().to_string()).unwrap_or_default();

        let id = if !guid.is_empty() {
            guid.clone()
        } else if !link.is_empty() {
            link_digest(&link)
        } else {
            return None;
        };

        let download_url = self
            .enclosure
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .or_else(|| Some(link.clone()).filter(|l| !l.is_empty()))
            .or_else(|| Some(guid).filter(|g| looks_downloadable(g)))?;

        let published = self
            .published
            .or(self.updated)
            .and_then(|raw| parse_date(&raw))
            .unwrap_or_else(Utc::now);

        Some(Item {
            id,
            title: self.title.map(|t| t.trim().to_string()).unwrap_or_default(),
            link,
            download_url,
            published,
        })
    }
}

fn attribute(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.to_string()))
}

fn looks_downloadable(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://") || value.starts_with("magnet:")
}

/// Stable identifier for items that carry no guid
pub fn link_digest(link: &str) -> String {
    let digest = Sha256::digest(link.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Parses RFC 2822 (RSS) or RFC 3339 (Atom) dates
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
