use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{Error, FetchError, Result};

/// Channel metadata and items of a fetched feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    /// Items in document order
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// GET `url` and parse the body as a feed.
    pub async fn fetch(&self, url: &str) -> std::result::Result<ParsedFeed, FetchError> {
        debug!("Fetching feed: {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let bytes = response.bytes().await?;
        parse_feed(&bytes)
    }
}

/// Parse feed bytes into a [`ParsedFeed`], decoding HTML entities in text fields.
pub fn parse_feed(bytes: &[u8]) -> std::result::Result<ParsedFeed, FetchError> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| decode_entities(&t.content))
        .unwrap_or_default();
    let description = feed.description.map(|d| decode_entities(&d.content));
    let link = feed.links.first().map(|l| l.href.clone());

    let mut items = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let item_title = entry
            .title
            .map(|t| decode_entities(&t.content))
            .unwrap_or_else(|| "Untitled".to_string());

        // A post is keyed by its url, so entries without one cannot be stored
        let Some(item_link) = entry.links.first().map(|l| l.href.trim().to_string()) else {
            warn!("Skipping entry with no link: {}", item_title);
            continue;
        };
        if item_link.is_empty() {
            warn!("Skipping entry with no link: {}", item_title);
            continue;
        }

        let item_description = entry
            .summary
            .map(|s| s.content)
            .or_else(|| entry.content.and_then(|c| c.body))
            .map(|d| decode_entities(&d));

        items.push(ParsedItem {
            title: item_title,
            link: item_link,
            description: item_description,
            published_at: entry.published.or(entry.updated),
        });
    }

    Ok(ParsedFeed {
        title,
        description,
        link,
        items,
    })
}

/// Decode HTML entities left over after XML unescaping (`&amp;amp;` style
/// double escaping). Each `&name;` token is decoded on its own; a stray `&` or
/// an unknown entity is kept literally.
pub fn decode_entities(text: &str) -> String {
    let text = text.trim();
    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let candidate = &rest[amp..];

        let entity = entity_len(candidate)
            .and_then(|len| Some((len, htmlescape::decode_html(&candidate[..len]).ok()?)));
        match entity {
            Some((len, value)) => {
                decoded.push_str(&value);
                rest = &candidate[len..];
            }
            None => {
                decoded.push('&');
                rest = &candidate[1..];
            }
        }
    }

    decoded.push_str(rest);
    decoded
}

/// Length of the `&...;` token at the start of `text`, if it is shaped like one.
fn entity_len(text: &str) -> Option<usize> {
    let body = &text[1..];
    let end = body.find(|c: char| c == ';' || c == '&' || c.is_whitespace())?;
    if end == 0 || !body[end..].starts_with(';') {
        return None;
    }
    Some(end + 2)
}
