use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::events::{AnswerEvent, CitationInfo};
use super::LlmDoc;

const TRIPLE_BACKTICK: &str = "```";
/// After this many non-citation characters, citing the same document again
/// is no longer considered a repeat.
const RECENT_CITATION_WINDOW: usize = 5;

// '[[1]]' in group 1; '[1]', '[1, 2]', '[1,2,16]' in group 2
static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\[\[\d+\]\])|(\[\d+(?:, ?\d+)*\])").expect("static regex"));

// '[', '[[', '[1', '[[1', '[1,', '[1, 2' and similar prefixes at the tail
static POSSIBLE_CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\[+(?:\d+,? ?)*$)").expect("static regex"));

// '[text', '[text]', '[text](url' at the tail: an unfinished markdown link
static POSSIBLE_MARKDOWN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\[[^\]]*$|\[[^\]]*\]\([^)]*$)").expect("static regex"));

fn in_code_block(llm_text: &str) -> bool {
    llm_text.matches(TRIPLE_BACKTICK).count() % 2 != 0
}

/// 1-based rank per document id, in list order.
pub fn map_document_id_order(docs: &[LlmDoc]) -> HashMap<String, usize> {
    let mut mapping = HashMap::new();
    for (idx, doc) in docs.iter().enumerate() {
        mapping.entry(doc.document_id.clone()).or_insert(idx + 1);
    }
    mapping
}

/// Stateful token transformer: detects `[n]`/`[n,m]`/`[[n]]` citations in
/// the stream, rewrites them against the display order the user sees, and
/// emits a CitationInfo the first time each document is cited. Holds back
/// tokens that might be the start of a citation or a markdown link so
/// neither gets split across output chunks.
pub struct CitationProcessor {
    context_docs: Vec<LlmDoc>,
    final_order_mapping: HashMap<String, usize>,
    display_order_mapping: HashMap<String, usize>,
    max_citation_num: usize,
    stop_stream: Option<String>,

    llm_out: String,
    curr_segment: String,
    hold: String,

    recent_cited_documents: HashSet<String>,
    cited_documents: HashSet<String>,
    non_citation_count: usize,
}

impl CitationProcessor {
    pub fn new(
        context_docs: Vec<LlmDoc>,
        final_order_mapping: HashMap<String, usize>,
        display_order_mapping: HashMap<String, usize>,
        stop_stream: Option<String>,
    ) -> Self {
        let max_citation_num = context_docs.len();
        Self {
            context_docs,
            final_order_mapping,
            display_order_mapping,
            max_citation_num,
            stop_stream,
            llm_out: String::new(),
            curr_segment: String::new(),
            hold: String::new(),
            recent_cited_documents: HashSet::new(),
            cited_documents: HashSet::new(),
            non_citation_count: 0,
        }
    }

    /// None marks end of stream and flushes whatever is held.
    pub fn process_token(&mut self, token: Option<&str>) -> Vec<AnswerEvent> {
        let mut events = Vec::new();

        let Some(token) = token else {
            if !self.curr_segment.is_empty() {
                events.push(AnswerEvent::AnswerPiece(std::mem::take(
                    &mut self.curr_segment,
                )));
            }
            return events;
        };

        let token = if let Some(ref stop) = self.stop_stream {
            let next_hold = format!("{}{}", self.hold, token);
            if next_hold.contains(stop.as_str()) {
                return events;
            }
            if stop.starts_with(&next_hold) {
                self.hold = next_hold;
                return events;
            }
            self.hold.clear();
            next_hold
        } else {
            token.to_string()
        };

        self.curr_segment.push_str(&token);
        self.llm_out.push_str(&token);

        // Bare code fences get a language tag so downstream renderers do not
        // swallow the first line
        if self.curr_segment.contains('`') && !self.curr_segment.ends_with('`') {
            if let Some(after) = self.curr_segment.split(TRIPLE_BACKTICK).nth(1) {
                if after.starts_with('\n') && in_code_block(&self.llm_out) {
                    self.curr_segment = self
                        .curr_segment
                        .replacen(TRIPLE_BACKTICK, "```plaintext", 1);
                }
            }
        }

        let citation_spans: Vec<(usize, usize, bool)> = CITATION_RE
            .captures_iter(&self.curr_segment)
            .map(|c| {
                let m = c.get(0).expect("group 0 always present");
                (m.start(), m.end(), c.get(1).is_some())
            })
            .collect();
        let possible_citation = POSSIBLE_CITATION_RE.is_match(&self.curr_segment);
        let possible_markdown_link = POSSIBLE_MARKDOWN_LINK_RE.is_match(&self.curr_segment);

        let mut result = String::new();

        if !citation_spans.is_empty() && !in_code_block(&self.llm_out) {
            let segment = std::mem::take(&mut self.curr_segment);
            let mut match_idx = 0usize;

            for (start, end, formatted) in &citation_spans {
                let intermatch = &segment[match_idx..*start];
                self.non_citation_count += intermatch.len();
                match_idx = *end;
                result.push_str(intermatch);

                if self.non_citation_count > RECENT_CITATION_WINDOW {
                    self.recent_cited_documents.clear();
                }

                let (processed, citations) =
                    self.process_citation(&segment[*start..*end], *formatted);
                result.push_str(&processed);
                for citation in citations {
                    events.push(AnswerEvent::Citation(citation));
                }
                self.non_citation_count = 0;
            }

            // Leftover could be the start of the next citation
            self.curr_segment = segment[match_idx..].to_string();
            self.non_citation_count = self.curr_segment.len();
        }

        if !possible_citation && !possible_markdown_link {
            self.non_citation_count += self.curr_segment.len();
            result.push_str(&self.curr_segment);
            self.curr_segment.clear();
        }

        if !result.is_empty() {
            events.push(AnswerEvent::AnswerPiece(result));
        }
        events
    }

    /// One citation string like '[1]', '[1, 13, 6]' or '[[4]]'.
    fn process_citation(&mut self, citation_str: &str, formatted: bool) -> (String, Vec<CitationInfo>) {
        let content = if formatted {
            &citation_str[2..citation_str.len() - 2]
        } else {
            &citation_str[1..citation_str.len() - 1]
        };

        let mut processed = String::new();
        let mut citations = Vec::new();

        for raw_num in content.split(',') {
            let Ok(num) = raw_num.trim().parse::<usize>() else {
                continue;
            };

            // Out-of-range citations stay exactly as the model wrote them
            if num < 1 || num > self.max_citation_num {
                if formatted {
                    processed.push_str(&format!("[[{num}]]"));
                } else {
                    processed.push_str(&format!("[{num}]"));
                }
                continue;
            }

            let doc = &self.context_docs[num - 1];
            let doc_id = doc.document_id.clone();

            // Translate the model-visible rank to the one the user sees
            let displayed_num = match self.display_order_mapping.get(&doc_id) {
                Some(rank) => *rank,
                None => {
                    warn!(
                        "Doc {} missing from display order; using LLM rank",
                        doc_id
                    );
                    self.final_order_mapping.get(&doc_id).copied().unwrap_or(num)
                }
            };

            if self.recent_cited_documents.contains(&doc_id) {
                continue;
            }
            self.recent_cited_documents.insert(doc_id.clone());

            if formatted {
                processed.push_str(citation_str);
            } else {
                let link = doc.link.clone().unwrap_or_default();
                processed.push_str(&format!("[[{displayed_num}]]({link})"));
            }

            if !self.cited_documents.contains(&doc_id) {
                self.cited_documents.insert(doc_id.clone());
                debug!("First citation of {} as [{}]", doc_id, displayed_num);
                citations.push(CitationInfo {
                    citation_num: displayed_num,
                    document_id: doc_id,
                });
            }
        }

        (processed, citations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::models::DocumentSource;

    fn doc(id: &str, link: &str) -> LlmDoc {
        LlmDoc {
            document_id: id.to_string(),
            semantic_identifier: id.to_string(),
            link: if link.is_empty() {
                None
            } else {
                Some(link.to_string())
            },
            source: DocumentSource::Web,
            content: String::new(),
            blurb: String::new(),
            metadata: Default::default(),
            updated_at: None,
        }
    }

    fn processor(docs: Vec<LlmDoc>) -> CitationProcessor {
        let mapping = map_document_id_order(&docs);
        CitationProcessor::new(docs, mapping.clone(), mapping, None)
    }

    fn run(processor: &mut CitationProcessor, tokens: &[&str]) -> (String, Vec<CitationInfo>) {
        let mut text = String::new();
        let mut citations = Vec::new();
        for token in tokens.iter().map(|t| Some(*t)).chain([None]) {
            for event in processor.process_token(token) {
                match event {
                    AnswerEvent::AnswerPiece(piece) => text.push_str(&piece),
                    AnswerEvent::Citation(info) => citations.push(info),
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
        (text, citations)
    }

    #[test]
    fn test_citation_rewrite_with_links_and_invalid_numbers() {
        let mut p = processor(vec![doc("A", "http://a"), doc("B", "")]);
        let (text, citations) = run(&mut p, &["See [1] and [2,2] and [5]."]);

        assert_eq!(text, "See [[1]](http://a) and [[2]]() and [5].");
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].citation_num, 1);
        assert_eq!(citations[0].document_id, "A");
        assert_eq!(citations[1].citation_num, 2);
        assert_eq!(citations[1].document_id, "B");
    }

    #[test]
    fn test_citation_split_across_tokens() {
        let mut p = processor(vec![doc("A", "http://a")]);
        let (text, citations) = run(&mut p, &["result [", "1", "] done"]);
        assert_eq!(text, "result [[1]](http://a) done");
        assert_eq!(citations.len(), 1);
    }

    #[test]
    fn test_text_without_citations_is_preserved_exactly() {
        let mut p = processor(vec![doc("A", "http://a")]);
        let input = "Plain answer, no brackets of the citing kind here.";
        let (text, citations) = run(&mut p, &[input]);
        assert_eq!(text, input);
        assert!(citations.is_empty());
    }

    #[test]
    fn test_repeat_citation_suppressed_then_allowed_again() {
        let mut p = processor(vec![doc("A", "http://a")]);
        // Immediately repeated citation collapses
        let (text, citations) = run(&mut p, &["x [1][1] y"]);
        assert_eq!(text, "x [[1]](http://a) y");
        assert_eq!(citations.len(), 1);

        // After more than five non-citation characters, the same doc may be
        // cited again (but emits no second CitationInfo)
        let mut p = processor(vec![doc("A", "http://a")]);
        let (text, citations) = run(&mut p, &["x [1] because [1] y"]);
        assert_eq!(text, "x [[1]](http://a) because [[1]](http://a) y");
        assert_eq!(citations.len(), 1);
    }

    #[test]
    fn test_display_order_differs_from_llm_order() {
        let docs = vec![doc("A", "http://a"), doc("B", "http://b")];
        let final_mapping = map_document_id_order(&docs);
        // The user sees B first
        let display_mapping =
            HashMap::from([("B".to_string(), 1usize), ("A".to_string(), 2usize)]);
        let mut p = CitationProcessor::new(docs, final_mapping, display_mapping, None);

        let mut text = String::new();
        let mut citations = Vec::new();
        for token in [Some("cite [1] end"), None] {
            for event in p.process_token(token) {
                match event {
                    AnswerEvent::AnswerPiece(piece) => text.push_str(&piece),
                    AnswerEvent::Citation(info) => citations.push(info),
                    _ => {}
                }
            }
        }
        assert_eq!(text, "cite [[2]](http://a) end");
        assert_eq!(citations[0].citation_num, 2);
        assert_eq!(citations[0].document_id, "A");
    }

    #[test]
    fn test_citations_inside_code_blocks_untouched() {
        let mut p = processor(vec![doc("A", "http://a")]);
        let (text, citations) = run(
            &mut p,
            &["```rust\n", "let x = arr[1];\n", "```", " then [1]"],
        );
        assert!(text.contains("arr[1];"));
        assert!(text.contains("[[1]](http://a)"));
        assert_eq!(citations.len(), 1);
    }

    #[test]
    fn test_bare_fence_gets_plaintext_tag() {
        let mut p = processor(vec![]);
        let (text, _) = run(&mut p, &["```\ncode\n", "more\n```"]);
        assert!(text.starts_with("```plaintext\ncode\n"), "got: {text}");
        assert!(text.ends_with("more\n```"));
    }

    #[test]
    fn test_partial_markdown_link_held_until_complete() {
        let mut p = processor(vec![doc("A", "http://a")]);
        let mut streamed_early = String::new();
        for event in p.process_token(Some("see [docs](http://ex")) {
            if let AnswerEvent::AnswerPiece(piece) = event {
                streamed_early.push_str(&piece);
            }
        }
        // The unfinished link must not have been flushed
        assert!(!streamed_early.contains("[docs]"));

        let mut rest = String::new();
        for event in p
            .process_token(Some(".com) done"))
            .into_iter()
            .chain(p.process_token(None))
        {
            if let AnswerEvent::AnswerPiece(piece) = event {
                rest.push_str(&piece);
            }
        }
        assert_eq!(format!("{streamed_early}{rest}"), "see [docs](http://ex.com) done");
    }

    #[test]
    fn test_preformatted_citation_kept_and_counted() {
        let mut p = processor(vec![doc("A", "http://a")]);
        let (text, citations) = run(&mut p, &["see [[1]] end"]);
        assert_eq!(text, "see [[1]] end");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].document_id, "A");
    }

    #[test]
    fn test_stop_stream_token_ends_output() {
        let docs = vec![doc("A", "http://a")];
        let mapping = map_document_id_order(&docs);
        let mut p = CitationProcessor::new(
            docs,
            mapping.clone(),
            mapping,
            Some("<END>".to_string()),
        );
        let mut text = String::new();
        for token in [Some("hello "), Some("<END> world"), None] {
            for event in p.process_token(token) {
                if let AnswerEvent::AnswerPiece(piece) = event {
                    text.push_str(&piece);
                }
            }
        }
        assert_eq!(text, "hello ");
    }
}
