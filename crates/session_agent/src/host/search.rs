use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::collaborators::SearchProvider;
use crate::config::SearchConfig;
use crate::error::ConfigError;

/// Full-text search against a MediaWiki `api.php` endpoint.
#[derive(Debug, Clone)]
pub struct MediaWikiSearch {
    client: Client,
    endpoint: String,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: Option<SearchQuery>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    #[serde(default)]
    snippet: String,
}

impl MediaWikiSearch {
    pub fn new(endpoint: impl Into<String>, config: &SearchConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ConfigError::invalid("search", error.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            max_results: config.max_results,
        })
    }

    fn fetch(&self, query: &str) -> Result<SearchResponse, reqwest::Error> {
        let limit = self.max_results.to_string();
        self.client
            .get(&self.endpoint)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("srsearch", query),
                ("srlimit", limit.as_str()),
                ("format", "json"),
                ("utf8", "1"),
            ])
            .send()?
            .error_for_status()?
            .json()
    }
}

impl SearchProvider for MediaWikiSearch {
    fn search(&self, query: &str) -> Result<String, String> {
        debug!(endpoint = %self.endpoint, query, "wiki search");
        match self.fetch(query) {
            Ok(response) => Ok(render_hits(query, response, self.max_results)),
            Err(error) => {
                warn!(endpoint = %self.endpoint, %error, "wiki search failed");
                Err(format!("Search failed: {error}"))
            }
        }
    }
}

fn render_hits(query: &str, response: SearchResponse, max_results: usize) -> String {
    let hits = response.query.map(|query| query.search).unwrap_or_default();
    if hits.is_empty() {
        return format!("No results for '{query}'");
    }

    let mut rendered = String::from("Search results:");
    for hit in hits.into_iter().take(max_results) {
        rendered.push_str("\n- ");
        rendered.push_str(&hit.title);
        rendered.push_str(": ");
        rendered.push_str(&strip_markup(&hit.snippet));
    }
    rendered
}

/// Drops tags from a search snippet and decodes the entities MediaWiki emits.
fn strip_markup(snippet: &str) -> String {
    let mut text = String::with_capacity(snippet.len());
    let mut in_tag = false;
    for ch in snippet.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }

    text.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
