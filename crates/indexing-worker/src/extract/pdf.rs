use lopdf::{Document as PdfDocument, Object};
use tracing::{debug, warn};

use super::{EmbeddedImage, ExtractionResult};

/// Per-page text extraction plus embedded image objects. Encrypted PDFs are
/// decrypted with the supplied password when one is given.
pub fn extract_pdf(
    bytes: &[u8],
    file_name: &str,
    password: Option<&str>,
    extract_images: bool,
) -> ExtractionResult {
    let mut pdf = match PdfDocument::load_mem(bytes) {
        Ok(pdf) => pdf,
        Err(e) => {
            warn!("Unreadable PDF {}: {}", file_name, e);
            return ExtractionResult::empty();
        }
    };

    if pdf.is_encrypted() {
        let password = password.unwrap_or("");
        if let Err(e) = pdf.decrypt(password) {
            warn!("Could not decrypt PDF {}: {}", file_name, e);
            return ExtractionResult::empty();
        }
    }

    let mut pages_text: Vec<String> = Vec::new();
    let page_numbers: Vec<u32> = pdf.get_pages().keys().copied().collect();
    for page_number in &page_numbers {
        match pdf.extract_text(&[*page_number]) {
            Ok(text) => pages_text.push(text),
            Err(e) => {
                debug!("No text on page {} of {}: {}", page_number, file_name, e);
                pages_text.push(String::new());
            }
        }
    }

    let mut embedded_images = Vec::new();
    if extract_images {
        embedded_images = extract_image_objects(&pdf, file_name);
    }

    let mut result = ExtractionResult::empty();
    result.text = pages_text.join("\n");
    result.embedded_images = embedded_images;
    result
        .metadata
        .insert("page_count".to_string(), page_numbers.len().to_string());
    result
}

fn extract_image_objects(pdf: &PdfDocument, file_name: &str) -> Vec<EmbeddedImage> {
    let mut images = Vec::new();

    for (object_id, object) in &pdf.objects {
        let Object::Stream(stream) = object else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            .map(|name| name == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        // DCT-encoded streams are plain JPEG bytes; everything else would
        // need raster decoding, which the image server does not accept
        let is_jpeg = stream
            .dict
            .get(b"Filter")
            .ok()
            .and_then(|f| f.as_name().ok())
            .map(|name| name == b"DCTDecode")
            .unwrap_or(false);
        if !is_jpeg {
            continue;
        }

        images.push(EmbeddedImage {
            bytes: stream.content.clone(),
            file_name: format!("{}_img_{}_{}.jpg", file_name, object_id.0, object_id.1),
        });
    }

    if !images.is_empty() {
        debug!("Extracted {} embedded images from {}", images.len(), file_name);
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_bytes_give_empty_result() {
        let result = extract_pdf(b"definitely not a pdf", "junk.pdf", None, true);
        assert_eq!(result.text, "");
        assert!(result.embedded_images.is_empty());
        assert!(result.metadata.is_empty());
    }
}
