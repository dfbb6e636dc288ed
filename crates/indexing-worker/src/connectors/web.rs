use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use scraper::{Html, Selector};
use search_shared::http::{RateLimitedClient, RequestAuth};
use search_shared::models::{Document, DocumentSource, MetadataValue, Section};
use tracing::{debug, info, warn};
use url::Url;

use crate::extract::{html, pdf};
use crate::image::{append_embedded_image_content, ImageProcessorClient};

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    LoadConnector,
};

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".svg"];
/// Hosts that serve images from extensionless URLs.
const CDN_MARKERS: &[&str] = &["cloudfront.net", "imgix.net", "cloudinary.com", "/cdn/", "cdn."];

/// Does this URL plausibly point at an image, either by extension or by a
/// known CDN shape?
pub fn is_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }
    let lower = url.to_ascii_lowercase();
    CDN_MARKERS.iter().any(|marker| lower.contains(marker))
        && (lower.contains("image") || lower.contains("img") || lower.contains("format="))
}

/// Canonical form used as the document id: no fragment, no trailing slash
/// on non-root paths.
pub fn canonicalize_url(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    let mut out = canonical.to_string();
    if out.ends_with('/') && canonical.path() != "/" {
        out.pop();
    }
    out
}

#[derive(Clone)]
pub struct WebConnector {
    http: Arc<RateLimitedClient>,
    start_url: String,
    batch_size: usize,
    max_pages: usize,
    image_processor: Option<Arc<ImageProcessorClient>>,
}

impl WebConnector {
    pub fn new(
        http: Arc<RateLimitedClient>,
        start_url: String,
        batch_size: usize,
        max_pages: usize,
        image_processor: Option<Arc<ImageProcessorClient>>,
    ) -> Self {
        Self {
            http,
            start_url,
            batch_size,
            max_pages,
            image_processor,
        }
    }

    pub fn from_config(
        http: Arc<RateLimitedClient>,
        config: &serde_json::Value,
        batch_size: usize,
        max_pages: usize,
        image_processor: Option<Arc<ImageProcessorClient>>,
    ) -> ConnectorResult<Self> {
        let start_url = config
            .get("base_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("web connector needs base_url".into()))?
            .to_string();
        Ok(Self::new(http, start_url, batch_size, max_pages, image_processor))
    }

    /// Fetch one page; returns the page document (plus any standalone image
    /// documents) and the same-host links found on it.
    async fn process_page(
        &self,
        page_url: &Url,
    ) -> ConnectorResult<(Vec<Document>, Vec<Url>)> {
        let canonical = canonicalize_url(page_url);
        let response = self.http.get(page_url.as_str(), &RequestAuth::None).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // PDFs linked from pages become standalone documents
        if content_type.starts_with("application/pdf") || canonical.ends_with(".pdf") {
            let bytes = response.bytes().await.map_err(anyhow::Error::from)?;
            let extracted = pdf::extract_pdf(&bytes, &canonical, None, false);
            if extracted.text.trim().is_empty() {
                return Ok((Vec::new(), Vec::new()));
            }
            let doc = Document {
                id: canonical.clone(),
                sections: vec![Section::text(Some(canonical.clone()), extracted.text)],
                source: DocumentSource::Web,
                semantic_identifier: canonical.clone(),
                doc_updated_at: None,
                primary_owners: None,
                metadata: HashMap::new(),
                external_access: None,
            };
            return Ok((vec![doc], Vec::new()));
        }

        if !content_type.starts_with("text/html") && !content_type.is_empty() {
            debug!("Skipping non-HTML page {} ({})", canonical, content_type);
            return Ok((Vec::new(), Vec::new()));
        }

        let body = response.text().await.map_err(anyhow::Error::from)?;
        let (title, text, links, image_urls) = parse_page(&body, page_url);

        let mut documents = Vec::new();
        let mut page_text = text;

        if let Some(ref processor) = self.image_processor {
            let mut image_texts: Vec<(String, String)> = Vec::new();
            for image_url in &image_urls {
                let image_bytes = match self.http.get(image_url.as_str(), &RequestAuth::None).await
                {
                    Ok(r) => match r.bytes().await {
                        Ok(b) => b,
                        Err(e) => {
                            warn!("Failed to read image {}: {}", image_url, e);
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!("Failed to fetch image {}: {}", image_url, e);
                        continue;
                    }
                };

                let file_name = image_url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .unwrap_or("image")
                    .to_string();
                let processed = processor.process(&image_bytes, &file_name).await;
                if processed.text.trim().is_empty() {
                    continue;
                }
                image_texts.push((file_name.clone(), processed.text.clone()));

                // Separate image document pointing back at the page enables
                // source co-retrieval at query time
                let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
                metadata.insert("source_document_id".to_string(), canonical.as_str().into());
                metadata.insert("source".to_string(), "web_embedded".into());
                documents.push(Document {
                    id: format!("{}#{}", canonical, image_url),
                    sections: vec![Section::Image {
                        link: Some(image_url.to_string()),
                        image_id: image_url.to_string(),
                        text: processed.text,
                    }],
                    source: DocumentSource::Web,
                    semantic_identifier: format!("{title} - {file_name}"),
                    doc_updated_at: None,
                    primary_owners: None,
                    metadata,
                    external_access: None,
                });
            }

            page_text = append_embedded_image_content(&page_text, &image_texts);
        }

        let page_doc = Document {
            id: canonical.clone(),
            sections: vec![Section::text(Some(canonical.clone()), page_text)],
            source: DocumentSource::Web,
            semantic_identifier: if title.is_empty() { canonical } else { title },
            doc_updated_at: None,
            primary_owners: None,
            metadata: HashMap::new(),
            external_access: None,
        };
        documents.insert(0, page_doc);

        Ok((documents, links))
    }
}

/// Pull the title, cleaned text, same-host links and image URLs from a page.
fn parse_page(body: &str, page_url: &Url) -> (String, String, Vec<Url>, Vec<Url>) {
    let parsed = Html::parse_document(body);

    let title_selector = Selector::parse("title").expect("static selector");
    let title = parsed
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let text = html::strip_html(body);

    let anchor_selector = Selector::parse("a[href]").expect("static selector");
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    for anchor in parsed.select(&anchor_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(mut target) = page_url.join(href) else {
            continue;
        };
        target.set_fragment(None);
        if target.host_str() != page_url.host_str() {
            continue;
        }
        if seen.insert(target.to_string()) {
            links.push(target);
        }
    }

    let img_selector = Selector::parse("img[src]").expect("static selector");
    let mut image_urls = Vec::new();
    let mut seen_images = HashSet::new();
    for img in parsed.select(&img_selector) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        if !is_image_url(src) {
            continue;
        }
        let Ok(absolute) = page_url.join(src) else {
            continue;
        };
        if seen_images.insert(absolute.to_string()) {
            image_urls.push(absolute);
        }
    }

    (title, text, links, image_urls)
}

#[async_trait]
impl LoadConnector for WebConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Web
    }

    /// Breadth-first crawl from the start URL, bounded by max_pages.
    fn load(&self, heartbeat: Arc<dyn IndexingHeartbeat>) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let start = Url::parse(&connector.start_url)
                .map_err(|e| ConnectorError::BadPayload(format!("bad base_url: {e}")))?;

            let mut queue: VecDeque<Url> = VecDeque::from([start]);
            let mut visited: HashSet<String> = HashSet::new();
            let mut batch: Vec<Document> = Vec::new();
            let mut pages_crawled = 0usize;

            while let Some(page_url) = queue.pop_front() {
                if pages_crawled >= connector.max_pages {
                    info!("Web crawl reached page limit ({})", connector.max_pages);
                    break;
                }
                let canonical = canonicalize_url(&page_url);
                if !visited.insert(canonical.clone()) {
                    continue;
                }

                heartbeat_batch(&heartbeat, "web_crawl", 1).await?;

                match connector.process_page(&page_url).await {
                    Ok((documents, links)) => {
                        pages_crawled += 1;
                        for link in links {
                            if !visited.contains(&canonicalize_url(&link)) {
                                queue.push_back(link);
                            }
                        }
                        batch.extend(documents);
                        if batch.len() >= connector.batch_size {
                            yield std::mem::take(&mut batch);
                        }
                    }
                    Err(ConnectorError::Cancelled) => Err(ConnectorError::Cancelled)?,
                    Err(e) => {
                        warn!("Failed to crawl {}: {}", canonical, e);
                    }
                }
            }

            if !batch.is_empty() {
                yield batch;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_url_by_extension() {
        assert!(is_image_url("https://ex.com/a/diagram.png"));
        assert!(is_image_url("https://ex.com/a/photo.JPG?v=2"));
        assert!(!is_image_url("https://ex.com/a/page.html"));
    }

    #[test]
    fn test_is_image_url_by_cdn_pattern() {
        assert!(is_image_url("https://d1.cloudfront.net/images/abc?format=webp"));
        assert!(!is_image_url("https://d1.cloudfront.net/scripts/app.js"));
    }

    #[test]
    fn test_canonicalize_strips_fragment_and_trailing_slash() {
        let url = Url::parse("https://ex.com/docs/page/#section").unwrap();
        assert_eq!(canonicalize_url(&url), "https://ex.com/docs/page");

        let root = Url::parse("https://ex.com/").unwrap();
        assert_eq!(canonicalize_url(&root), "https://ex.com/");
    }

    #[test]
    fn test_parse_page_extracts_links_and_images() {
        let page_url = Url::parse("https://ex.com/docs/start").unwrap();
        let body = r#"
            <html><head><title>Docs</title></head><body>
              <a href="/docs/next">next</a>
              <a href="https://other.com/away">away</a>
              <img src="/img/arch.png">
              <img src="data:image/png;base64,xyz">
            </body></html>
        "#;
        let (title, text, links, images) = parse_page(body, &page_url);
        assert_eq!(title, "Docs");
        assert!(text.contains("next"));
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://ex.com/docs/next");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].as_str(), "https://ex.com/img/arch.png");
    }
}
