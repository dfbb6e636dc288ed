use search_shared::models::{DocAwareChunk, Document};
use search_shared::text::count_tokens;
use text_splitter::{ChunkConfig, TextSplitter};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

/// Large chunks group this many consecutive normal chunks for hierarchical
/// retrieval.
const LARGE_CHUNK_RATIO: usize = 4;
/// Large-chunk ordinals live in their own range so (doc, ordinal) stays
/// unique alongside normal chunks.
pub const LARGE_CHUNK_ID_OFFSET: i32 = 1_000_000;

/// Token-budgeted document chunking. Sections are concatenated until the
/// next one would exceed the budget; a single oversized section goes
/// through the token-sized text splitter.
pub struct Chunker {
    max_chunk_tokens: usize,
    splitter: TextSplitter<CoreBPE>,
    large_chunks_enabled: bool,
}

impl Chunker {
    pub fn new(model_max_tokens: usize, token_buffer: usize, large_chunks_enabled: bool) -> Self {
        let max_chunk_tokens = model_max_tokens.saturating_sub(token_buffer).max(64);
        let tokenizer = cl100k_base().expect("cl100k_base tokenizer is bundled");
        let splitter = TextSplitter::new(ChunkConfig::new(max_chunk_tokens).with_sizer(tokenizer));
        Self {
            max_chunk_tokens,
            splitter,
            large_chunks_enabled,
        }
    }

    pub fn chunk(&self, document: &Document) -> Vec<DocAwareChunk> {
        let mut chunks: Vec<DocAwareChunk> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;
        let mut current_link: Option<String> = None;

        let mut flush =
            |content: &mut String, tokens: &mut usize, link: &mut Option<String>, out: &mut Vec<DocAwareChunk>| {
                if content.trim().is_empty() {
                    content.clear();
                    *tokens = 0;
                    return;
                }
                out.push(self.make_chunk(document, out.len() as i32, content.trim(), *tokens, link.take()));
                content.clear();
                *tokens = 0;
            };

        for section in &document.sections {
            let section_text = section.content();
            if section_text.trim().is_empty() {
                continue;
            }
            let section_tokens = count_tokens(section_text);

            if section_tokens > self.max_chunk_tokens {
                // Oversized section: flush what we have, then split it on
                // semantic boundaries within the token budget
                flush(&mut current, &mut current_tokens, &mut current_link, &mut chunks);
                for piece in self.splitter.chunks(section_text) {
                    let tokens = count_tokens(piece);
                    chunks.push(self.make_chunk(
                        document,
                        chunks.len() as i32,
                        piece,
                        tokens,
                        section.link().map(|l| l.to_string()),
                    ));
                }
                continue;
            }

            if current_tokens + section_tokens > self.max_chunk_tokens {
                flush(&mut current, &mut current_tokens, &mut current_link, &mut chunks);
            }
            if current.is_empty() {
                current_link = section.link().map(|l| l.to_string());
            } else {
                current.push('\n');
            }
            current.push_str(section_text);
            current_tokens += section_tokens;
        }
        flush(&mut current, &mut current_tokens, &mut current_link, &mut chunks);

        if self.large_chunks_enabled && chunks.len() > 1 {
            let large = self.build_large_chunks(document, &chunks);
            debug!(
                "Chunked {} into {} chunks (+{} large)",
                document.id,
                chunks.len(),
                large.len()
            );
            chunks.extend(large);
        }

        chunks
    }

    fn build_large_chunks(
        &self,
        document: &Document,
        normal_chunks: &[DocAwareChunk],
    ) -> Vec<DocAwareChunk> {
        normal_chunks
            .chunks(LARGE_CHUNK_RATIO)
            .enumerate()
            .filter(|(_, group)| group.len() > 1)
            .map(|(large_idx, group)| {
                let content = group
                    .iter()
                    .map(|c| c.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let token_count = group.iter().map(|c| c.token_count).sum();
                let mut chunk = self.make_chunk(
                    document,
                    LARGE_CHUNK_ID_OFFSET + large_idx as i32,
                    &content,
                    token_count,
                    group[0].link.clone(),
                );
                chunk.large_chunk_reference_ids = group.iter().map(|c| c.chunk_id).collect();
                chunk
            })
            .collect()
    }

    fn make_chunk(
        &self,
        document: &Document,
        chunk_id: i32,
        content: &str,
        token_count: usize,
        link: Option<String>,
    ) -> DocAwareChunk {
        DocAwareChunk {
            document_id: document.id.clone(),
            chunk_id,
            content: content.to_string(),
            source: document.source,
            semantic_identifier: document.semantic_identifier.clone(),
            link,
            metadata: document.metadata.clone(),
            doc_updated_at: document.doc_updated_at,
            token_count,
            large_chunk_reference_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::models::{DocumentSource, Section};
    use std::collections::HashMap;

    fn doc(sections: Vec<Section>) -> Document {
        Document {
            id: "doc-1".to_string(),
            sections,
            source: DocumentSource::Web,
            semantic_identifier: "Doc".to_string(),
            doc_updated_at: None,
            primary_owners: None,
            metadata: HashMap::from([("team".to_string(), "eng".into())]),
            external_access: None,
        }
    }

    #[test]
    fn test_sections_pack_until_budget() {
        let chunker = Chunker::new(64, 0, false);
        let sections = vec![
            Section::text(None, "short section one"),
            Section::text(None, "short section two"),
        ];
        let chunks = chunker.chunk(&doc(sections));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("one"));
        assert!(chunks[0].content.contains("two"));
        // Metadata inherited from the document
        assert_eq!(chunks[0].metadata["team"].as_single(), Some("eng"));
    }

    #[test]
    fn test_chunks_respect_token_budget() {
        // 80 minus the 16-token buffer leaves a 64-token budget per chunk
        let chunker = Chunker::new(80, 16, false);
        let long: String = "word ".repeat(600);
        let chunks = chunker.chunk(&doc(vec![Section::text(None, long)]));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 64, "chunk of {} tokens", chunk.token_count);
        }
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let chunker = Chunker::new(32, 4, false);
        let text: String = "alpha beta gamma delta ".repeat(40);
        let first = chunker.chunk(&doc(vec![Section::text(None, text.clone())]));
        let second = chunker.chunk(&doc(vec![Section::text(None, text)]));
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.token_count, b.token_count);
        }
    }

    #[test]
    fn test_oversized_section_loses_no_words() {
        let chunker = Chunker::new(80, 16, false);
        let text: String = (0..300).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&doc(vec![Section::text(None, text)]));
        assert!(chunks.len() > 1);
        let rejoined = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        for i in [0, 150, 299] {
            assert!(rejoined.contains(&format!("word{i}")), "missing word{i}");
        }
    }

    #[test]
    fn test_large_chunks_reference_their_members() {
        let chunker = Chunker::new(64, 0, true);
        let text: String = "one two three four five six seven eight ".repeat(100);
        let chunks = chunker.chunk(&doc(vec![Section::text(None, text)]));

        let large: Vec<_> = chunks
            .iter()
            .filter(|c| !c.large_chunk_reference_ids.is_empty())
            .collect();
        assert!(!large.is_empty());
        for large_chunk in large {
            assert!(large_chunk.chunk_id >= LARGE_CHUNK_ID_OFFSET);
            assert!(large_chunk.large_chunk_reference_ids.len() >= 2);
            for referenced in &large_chunk.large_chunk_reference_ids {
                assert!(chunks.iter().any(|c| c.chunk_id == *referenced));
            }
        }
    }
}
