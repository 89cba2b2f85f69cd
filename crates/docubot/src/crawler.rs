// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site crawler collaborator.
//!
//! The crawl loop only needs an ordered list of documents in a temporary
//! directory. [`SitemapCrawler`] produces one by fetching every page listed in
//! the site's `sitemap.xml` and rendering it to PDF.

use std::path::PathBuf;

use async_trait::async_trait;
use docubot_sdk::StepError;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::document;

/// Documents produced by one crawl.
///
/// The directory is removed when this value is dropped.
#[derive(Debug)]
pub struct CrawlOutput {
    pub dir: TempDir,
    /// Documents in crawl order.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid sitemap: {0}")]
    Sitemap(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf rendering failed: {0}")]
    Render(#[from] lopdf::Error),

    #[error("crawl of {0} produced no documents")]
    Empty(String),
}

impl From<CrawlError> for StepError {
    fn from(err: CrawlError) -> Self {
        // Sites come and go; the next attempt may succeed.
        StepError::Retryable(err.to_string())
    }
}

#[async_trait]
pub trait Crawler: Send + Sync {
    /// Crawl `site_url` into a fresh temporary directory.
    async fn crawl(&self, site_url: &str) -> Result<CrawlOutput, CrawlError>;
}

/// Fetches `<site>/sitemap.xml` and every page it lists, one PDF per page.
#[derive(Debug, Clone, Default)]
pub struct SitemapCrawler {
    client: reqwest::Client,
}

impl SitemapCrawler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, CrawlError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }

    /// Page URLs in sitemap order, following one level of sitemap index.
    async fn page_urls(&self, sitemap_url: &str) -> Result<Vec<String>, CrawlError> {
        let xml = self.fetch_text(sitemap_url).await?;
        let (is_index, locations) = parse_sitemap(&xml)?;
        if !is_index {
            return Ok(locations);
        }

        let mut pages = Vec::new();
        for child in locations {
            let xml = self.fetch_text(&child).await?;
            let (_, child_pages) = parse_sitemap(&xml)?;
            debug!(sitemap = %child, pages = child_pages.len(), "Read child sitemap");
            pages.extend(child_pages);
        }
        Ok(pages)
    }
}

#[async_trait]
impl Crawler for SitemapCrawler {
    #[instrument(skip(self))]
    async fn crawl(&self, site_url: &str) -> Result<CrawlOutput, CrawlError> {
        let sitemap_url = format!("{}/sitemap.xml", site_url.trim_end_matches('/'));
        let urls = self.page_urls(&sitemap_url).await?;
        if urls.is_empty() {
            return Err(CrawlError::Empty(site_url.to_string()));
        }

        let dir = tempfile::Builder::new().prefix("docubot-crawl-").tempdir()?;
        let mut paths = Vec::with_capacity(urls.len());

        for (i, url) in urls.iter().enumerate() {
            let body = self.fetch_text(url).await?;
            let pdf = document::render_pdf(url, &document::html_to_text(&body))?;
            let path = dir.path().join(format!("{i}.pdf"));
            tokio::fs::write(&path, pdf).await?;
            paths.push(path);
        }

        info!(pages = paths.len(), "Crawl finished");
        Ok(CrawlOutput { dir, paths })
    }
}

/// Returns whether the document is a sitemap index, and its `<loc>` values.
fn parse_sitemap(xml: &str) -> Result<(bool, Vec<String>), CrawlError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| CrawlError::Sitemap(e.to_string()))?;
    let root = doc.root_element();
    let is_index = root.tag_name().name() == "sitemapindex";

    let locations = root
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "loc")
        .filter_map(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    Ok((is_index, locations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn urlset(urls: &[String]) -> String {
        let entries: String = urls
            .iter()
            .map(|u| format!("<url><loc>{u}</loc></url>"))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#
        )
    }

    async fn mount_page(server: &MockServer, page: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_sitemap() {
        let xml = urlset(&["https://a.test/".to_string(), " https://a.test/x ".to_string()]);
        let (is_index, locs) = parse_sitemap(&xml).unwrap();
        assert!(!is_index);
        assert_eq!(locs, vec!["https://a.test/", "https://a.test/x"]);

        assert!(matches!(parse_sitemap("<urlset>"), Err(CrawlError::Sitemap(_))));
    }

    fn pdf_text(path: &std::path::Path) -> String {
        let doc = lopdf::Document::load(path).unwrap();
        let page = doc.get_pages()[&1];
        String::from_utf8_lossy(&doc.get_page_content(page).unwrap()).into_owned()
    }

    #[tokio::test]
    async fn test_crawl_writes_pages_in_sitemap_order() {
        let server = MockServer::start().await;
        let base = server.uri();

        let sitemap = urlset(&[format!("{base}/"), format!("{base}/guide")]);
        mount_page(&server, "/sitemap.xml", &sitemap).await;
        mount_page(&server, "/", "<h1>Home</h1>").await;
        mount_page(&server, "/guide", "<h1>Guide</h1>").await;

        let output = SitemapCrawler::default().crawl(&format!("{base}/")).await.unwrap();
        assert_eq!(output.paths.len(), 2);
        assert!(output.paths[0].ends_with("0.pdf"));
        assert!(output.paths[1].ends_with("1.pdf"));
        assert!(std::fs::read(&output.paths[0]).unwrap().starts_with(b"%PDF-"));

        let home = pdf_text(&output.paths[0]);
        assert!(home.contains("Home"));
        assert!(!home.contains("<h1>"));
        assert!(pdf_text(&output.paths[1]).contains("Guide"));

        let dir = output.dir.path().to_path_buf();
        drop(output);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_crawl_follows_sitemap_index() {
        let server = MockServer::start().await;
        let base = server.uri();

        let index = format!(
            r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"><sitemap><loc>{base}/docs.xml</loc></sitemap></sitemapindex>"#
        );
        mount_page(&server, "/sitemap.xml", &index).await;
        mount_page(&server, "/docs.xml", &urlset(&[format!("{base}/a")])).await;
        mount_page(&server, "/a", "a").await;

        let output = SitemapCrawler::default().crawl(&base).await.unwrap();
        assert_eq!(output.paths.len(), 1);
    }

    #[tokio::test]
    async fn test_crawl_empty_sitemap() {
        let server = MockServer::start().await;
        mount_page(&server, "/sitemap.xml", &urlset(&[])).await;

        let err = SitemapCrawler::default().crawl(&server.uri()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Empty(_)));
        assert!(StepError::from(err).is_retryable());
    }
}
