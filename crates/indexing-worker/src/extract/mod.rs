pub mod html;
pub mod office;
pub mod pdf;
pub mod unstructured;

use std::collections::HashMap;

use tracing::{debug, warn};

pub use unstructured::UnstructuredClient;

/// An image found inside a parent document during extraction.
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub text: String,
    pub embedded_images: Vec<EmbeddedImage>,
    pub metadata: HashMap<String, String>,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text_only(text: String) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }
}

/// Bytes + name (+ optional PDF password) to text, embedded images and
/// metadata. Recognized-but-unreadable input returns an empty result, never
/// an error: a single bad file must not fail an indexing attempt.
pub struct ContentExtractor {
    unstructured: Option<UnstructuredClient>,
    extract_pdf_images: bool,
}

impl ContentExtractor {
    pub fn new(unstructured: Option<UnstructuredClient>, extract_pdf_images: bool) -> Self {
        Self {
            unstructured,
            extract_pdf_images,
        }
    }

    pub async fn extract(
        &self,
        bytes: &[u8],
        file_name: Option<&str>,
        pdf_password: Option<&str>,
    ) -> ExtractionResult {
        // The external service, when configured, sees the file first
        if let Some(ref client) = self.unstructured {
            match client.extract(bytes, file_name.unwrap_or("unknown")).await {
                Ok(text) if !text.trim().is_empty() => {
                    return ExtractionResult::text_only(text);
                }
                Ok(_) => debug!("Unstructured returned no text, falling back to local parsing"),
                Err(e) => warn!("Unstructured extraction failed, falling back: {}", e),
            }
        }

        let extension = file_name
            .and_then(|name| name.rsplit('.').next())
            .map(|ext| ext.to_ascii_lowercase());

        let name = file_name.unwrap_or("unknown");
        match extension.as_deref() {
            Some("pdf") => pdf::extract_pdf(bytes, name, pdf_password, self.extract_pdf_images),
            Some("docx") => office::extract_docx(bytes, name),
            Some("xlsx") | Some("xls") => office::extract_spreadsheet(bytes, name),
            Some("pptx") => office::extract_pptx(bytes, name),
            Some("rtf") => office::extract_rtf(bytes, name),
            Some("html") | Some("htm") => {
                ExtractionResult::text_only(html::strip_html(&decode_text(bytes)))
            }
            Some("md") | Some("mdx") | Some("txt") | Some("log") | Some("json") | Some("csv")
            | Some("tsv") | Some("xml") | Some("yml") | Some("yaml") | Some("conf") => {
                ExtractionResult::text_only(decode_text(bytes))
            }
            _ => self.extract_unknown(bytes, name, pdf_password),
        }
    }

    /// No usable extension: sniff the content, then fall back to treating it
    /// as text if it decodes cleanly enough.
    fn extract_unknown(
        &self,
        bytes: &[u8],
        name: &str,
        pdf_password: Option<&str>,
    ) -> ExtractionResult {
        if let Some(kind) = infer::get(bytes) {
            match kind.mime_type() {
                "application/pdf" => {
                    return pdf::extract_pdf(bytes, name, pdf_password, self.extract_pdf_images)
                }
                "application/zip" => {
                    // Office containers are all zips; try the common ones
                    let docx = office::extract_docx(bytes, name);
                    if !docx.text.is_empty() {
                        return docx;
                    }
                    let pptx = office::extract_pptx(bytes, name);
                    if !pptx.text.is_empty() {
                        return pptx;
                    }
                    return office::extract_spreadsheet(bytes, name);
                }
                mime if mime.starts_with("image/") => {
                    // Images flow through the image pipeline, not text extraction
                    return ExtractionResult::empty();
                }
                _ => {}
            }
        }

        let text = decode_text(bytes);
        if looks_like_text(&text) {
            ExtractionResult::text_only(text)
        } else {
            warn!("Could not detect a readable format for {}", name);
            ExtractionResult::empty()
        }
    }
}

/// Decode with charset detection; UTF-8 fast path first.
fn decode_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    decoded.into_owned()
}

fn looks_like_text(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let replacement_count = text.chars().filter(|c| *c == '\u{FFFD}').count();
    let control_count = text
        .chars()
        .filter(|c| c.is_control() && !c.is_whitespace())
        .count();
    let total = text.chars().count();
    (replacement_count + control_count) * 10 < total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_text_by_extension() {
        let extractor = ContentExtractor::new(None, false);
        let result = extractor
            .extract(b"line one\nline two", Some("notes.txt"), None)
            .await;
        assert_eq!(result.text, "line one\nline two");
    }

    #[tokio::test]
    async fn test_html_is_stripped() {
        let extractor = ContentExtractor::new(None, false);
        let result = extractor
            .extract(b"<html><body><h1>Title</h1></body></html>", Some("page.html"), None)
            .await;
        assert_eq!(result.text, "Title");
    }

    #[tokio::test]
    async fn test_no_name_falls_back_to_content_detection() {
        let extractor = ContentExtractor::new(None, false);
        let result = extractor.extract(b"just some plain prose", None, None).await;
        assert_eq!(result.text, "just some plain prose");
    }

    #[tokio::test]
    async fn test_binary_junk_returns_empty_not_error() {
        let extractor = ContentExtractor::new(None, false);
        let junk: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let result = extractor.extract(&junk, None, None).await;
        assert_eq!(result.text, "");
        assert!(result.embedded_images.is_empty());
    }
}
