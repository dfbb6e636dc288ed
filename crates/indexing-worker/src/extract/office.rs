use std::io::{Cursor, Read};

use calamine::{Data, Reader};
use quick_xml::events::Event;
use tracing::warn;

use super::ExtractionResult;

/// DOCX body text via docx-rs. Returns empty on anything unreadable.
pub fn extract_docx(bytes: &[u8], file_name: &str) -> ExtractionResult {
    let docx = match docx_rs::read_docx(bytes) {
        Ok(docx) => docx,
        Err(e) => {
            warn!("Unreadable DOCX {}: {}", file_name, e);
            return ExtractionResult::empty();
        }
    };

    let mut paragraphs: Vec<String> = Vec::new();
    for child in &docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            let text = paragraph.raw_text();
            if !text.trim().is_empty() {
                paragraphs.push(text);
            }
        }
    }

    ExtractionResult::text_only(paragraphs.join("\n"))
}

/// Spreadsheets flatten to one line per row, sheets separated by headers.
pub fn extract_spreadsheet(bytes: &[u8], file_name: &str) -> ExtractionResult {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = match calamine::open_workbook_auto_from_rs(cursor) {
        Ok(wb) => wb,
        Err(e) => {
            warn!("Unreadable spreadsheet {}: {}", file_name, e);
            return ExtractionResult::empty();
        }
    };

    let mut out = String::new();
    for sheet_name in workbook.sheet_names().to_owned() {
        let Ok(range) = workbook.worksheet_range(&sheet_name) else {
            continue;
        };
        out.push_str(&format!("## {sheet_name}\n"));
        for row in range.rows() {
            let cells: Vec<String> = row
                .iter()
                .filter(|cell| !matches!(cell, Data::Empty))
                .map(|cell| cell.to_string())
                .collect();
            if !cells.is_empty() {
                out.push_str(&cells.join(", "));
                out.push('\n');
            }
        }
    }

    ExtractionResult::text_only(out)
}

/// PPTX slides are XML parts inside a zip; pull the `a:t` text runs from
/// each `slides/slideN.xml`.
pub fn extract_pptx(bytes: &[u8], file_name: &str) -> ExtractionResult {
    let cursor = Cursor::new(bytes.to_vec());
    let mut archive = match zip::ZipArchive::new(cursor) {
        Ok(archive) => archive,
        Err(e) => {
            warn!("Unreadable PPTX {}: {}", file_name, e);
            return ExtractionResult::empty();
        }
    };

    let mut slide_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .collect();
    slide_names.sort();

    let mut out = String::new();
    for name in slide_names {
        let Ok(mut entry) = archive.by_name(&name) else {
            continue;
        };
        let mut xml = String::new();
        if entry.read_to_string(&mut xml).is_err() {
            continue;
        }

        let mut reader = quick_xml::Reader::from_str(&xml);
        let mut in_text_run = false;
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"a:t" => in_text_run = true,
                Ok(Event::End(ref e)) if e.name().as_ref() == b"a:t" => in_text_run = false,
                Ok(Event::Text(text)) if in_text_run => {
                    if let Ok(unescaped) = text.unescape() {
                        out.push_str(&unescaped);
                        out.push(' ');
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        out.push('\n');
    }

    ExtractionResult::text_only(out.trim().to_string())
}

pub fn extract_rtf(bytes: &[u8], file_name: &str) -> ExtractionResult {
    let Ok(raw) = std::str::from_utf8(bytes) else {
        warn!("RTF {} is not valid UTF-8", file_name);
        return ExtractionResult::empty();
    };
    match rtf_parser::document::RtfDocument::try_from(raw) {
        Ok(document) => ExtractionResult::text_only(document.get_text()),
        Err(e) => {
            warn!("Unreadable RTF {}: {:?}", file_name, e);
            ExtractionResult::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_office_files_give_empty_results() {
        assert_eq!(extract_docx(b"not docx", "a.docx").text, "");
        assert_eq!(extract_spreadsheet(b"not xlsx", "a.xlsx").text, "");
        assert_eq!(extract_pptx(b"not pptx", "a.pptx").text, "");
        assert_eq!(extract_rtf(&[0xFF, 0xFE], "a.rtf").text, "");
    }
}
