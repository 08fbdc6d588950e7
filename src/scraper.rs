use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;
use url::Url;

/// Raw page as returned by the scraping service.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub markdown: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    /// The full upstream object, kept verbatim as the page's raw content.
    pub raw: Value,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Scrapes through spider.cloud, asking for markdown plus page metadata.
pub struct SpiderFetcher {
    spider: Spider,
}

impl SpiderFetcher {
    pub fn new(api_key: &str) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing spider API key");
        let spider = Spider::new(Some(api_key.trim().to_string()))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self { spider })
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            metadata: Some(true),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| anyhow!("Spider scrape failed: {}", e))?;

        // Some responses arrive as a JSON-encoded string
        let parsed: Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        debug!(url, "spider response received");
        parse_spider_response(parsed)
    }
}

/// Pull markdown and metadata out of a spider response (an array of page objects).
///
/// Only an upstream error or a non-2xx status is a failure; a page without
/// content still comes back with `markdown: None`.
pub fn parse_spider_response(parsed: Value) -> Result<FetchedPage> {
    let first = match parsed {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty spider response"))?,
        obj @ Value::Object(_) => obj,
        other => bail!("Unexpected spider response: {}", other),
    };

    let status = first.get("status").and_then(Value::as_i64);
    if let Some(err) = first.get("error").and_then(Value::as_str).filter(|e| !e.is_empty()) {
        bail!("Spider reported an error (status {:?}): {}", status, err);
    }
    if let Some(code) = status.filter(|c| !(200..300).contains(c)) {
        bail!("Spider returned status {}", code);
    }

    let markdown = first
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let meta = first.get("metadata");
    let meta_str = |key: &str| {
        meta.and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(FetchedPage {
        markdown,
        title: meta_str("title"),
        description: meta_str("description"),
        icon_url: meta_str("favicon").or_else(|| meta_str("icon")),
        raw: first,
    })
}

/// Trim, default the scheme to https, and accept only http(s) URLs with a host.
pub fn normalize_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    anyhow::ensure!(!trimmed.is_empty(), "empty URL");
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&candidate).with_context(|| format!("invalid URL {:?}", input))?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("unsupported URL scheme {:?}", other),
    }
    anyhow::ensure!(url.host_str().is_some_and(|h| !h.is_empty()), "URL has no host");
    Ok(url.to_string())
}
