//! Content retrieval seam.
//!
//! The scheduler only depends on [`Fetcher`]. The bundled [`HttpFetcher`]
//! covers `url` targets (web pages through reqwest/html2text, GitHub
//! repositories through githem-core) and `arxiv` targets through the arXiv
//! Atom API. Keyword, topic and news sources need a host-supplied fetcher.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quick_xml::events::Event;
use tracing::debug;

use crate::error::FetchError;
use crate::targets::types::{MonitoringTarget, MonitoringType};

/// One entry of a listing source (paper, article, search hit).
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    /// Canonical id or URL; used for seen-item tracking.
    pub id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchedContent {
    Document { text: String, source_ref: String },
    Items(Vec<FeedItem>),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Whether targets of `kind` can be fetched at all. Targets of other
    /// kinds are refused at registration.
    fn supports(&self, _kind: MonitoringType) -> bool {
        true
    }

    async fn fetch(&self, target: &MonitoringTarget) -> Result<FetchedContent, FetchError>;
}

pub const ARXIV_API: &str = "http://export.arxiv.org/api/query";
pub const ARXIV_MAX_RESULTS: usize = 10;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Most recently submitted papers matching the target query.
    async fn fetch_arxiv(&self, query: &str) -> Result<Vec<FeedItem>, FetchError> {
        let max_results = ARXIV_MAX_RESULTS.to_string();
        let search = format!("all:{}", query);
        let resp = self
            .client
            .get(ARXIV_API)
            .query(&[
                ("search_query", search.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body = resp.text().await?;

        let papers = parse_arxiv_feed(&body)?;
        debug!(query, papers = papers.len(), "arXiv feed fetched");
        Ok(papers)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = resp.bytes().await?;

        // Convert HTML to text if applicable
        let text = if content_type.contains("html") {
            html2text::from_read(&body[..], 120)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string())
        } else {
            String::from_utf8_lossy(&body).to_string()
        };
        debug!(url, size = text.len(), "page fetched");
        Ok(text)
    }

    /// Snapshot a GitHub repository as one text document.
    async fn fetch_github_repo(&self, url: &str) -> Result<String, FetchError> {
        let _parsed = githem_core::parse_github_url(url)
            .context("Invalid GitHub URL")
            .map_err(|e| FetchError::Other(format!("{e:#}")))?;

        let opts = githem_core::IngestOptions::with_preset(githem_core::FilterPreset::Standard);

        // Clone and ingest; this is blocking I/O so run in spawn_blocking
        let url_owned = url.to_string();
        let output = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let ingester = githem_core::Ingester::from_url_cached(&url_owned, opts)?;
            let mut output = Vec::new();
            ingester.ingest(&mut output)?;
            Ok(output)
        })
        .await
        .context("spawn_blocking join failed")
        .and_then(|r| r)
        .map_err(|e| FetchError::Other(format!("{e:#}")))?;

        debug!(url, size = output.len(), "GitHub repository ingested");
        Ok(String::from_utf8_lossy(&output).to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn supports(&self, kind: MonitoringType) -> bool {
        matches!(kind, MonitoringType::Url | MonitoringType::Arxiv)
    }

    async fn fetch(&self, target: &MonitoringTarget) -> Result<FetchedContent, FetchError> {
        match target.monitoring_type {
            MonitoringType::Url => {
                let url = target.target.as_str();
                let text = if url.contains("github.com") {
                    self.fetch_github_repo(url).await?
                } else {
                    self.fetch_page(url).await?
                };
                Ok(FetchedContent::Document {
                    text,
                    source_ref: url.to_string(),
                })
            }
            MonitoringType::Arxiv => Ok(FetchedContent::Items(self.fetch_arxiv(&target.target).await?)),
            other => Err(FetchError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Clone, Copy)]
enum AtomField {
    Id,
    Title,
    Summary,
}

#[derive(Default)]
struct AtomEntry {
    id: String,
    title: String,
    summary: String,
}

impl AtomEntry {
    fn field_mut(&mut self, field: AtomField) -> &mut String {
        match field {
            AtomField::Id => &mut self.id,
            AtomField::Title => &mut self.title,
            AtomField::Summary => &mut self.summary,
        }
    }

    fn into_item(self) -> FeedItem {
        let id = self.id.trim().to_string();
        FeedItem {
            url: Some(id.clone()),
            id,
            title: collapse_whitespace(&self.title),
            body: collapse_whitespace(&self.summary),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Entries of an arXiv Atom response. Feed-level elements are ignored and
/// entries without an id are skipped.
pub fn parse_arxiv_feed(xml: &str) -> Result<Vec<FeedItem>, FetchError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut items = Vec::new();
    let mut entry: Option<AtomEntry> = None;
    let mut field: Option<AtomField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                field = match e.local_name().as_ref() {
                    b"entry" => {
                        entry = Some(AtomEntry::default());
                        None
                    }
                    b"id" => Some(AtomField::Id),
                    b"title" => Some(AtomField::Title),
                    b"summary" => Some(AtomField::Summary),
                    _ => None,
                };
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(entry), Some(field)) = (entry.as_mut(), field) {
                    let text = e
                        .unescape()
                        .map_err(|e| FetchError::Malformed(format!("arXiv feed: {}", e)))?;
                    entry.field_mut(field).push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().as_ref() == b"entry" {
                    if let Some(done) = entry.take().filter(|d| !d.id.trim().is_empty()) {
                        items.push(done.into_item());
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Malformed(format!("arXiv feed: {}", e))),
            _ => {}
        }
    }

    Ok(items)
}
