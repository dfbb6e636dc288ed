use search_shared::models::InferenceChunk;
use search_shared::text::{count_tokens, truncate_to_tokens};
use tracing::debug;

/// Drop chunks the relevance filter marked not-relevant. The verdict list
/// is positional; a shorter list keeps the tail (ranker order is trusted
/// when the filter did not cover it).
pub fn drop_irrelevant(chunks: Vec<InferenceChunk>, verdicts: &[bool]) -> Vec<InferenceChunk> {
    chunks
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| verdicts.get(*idx).copied().unwrap_or(true))
        .map(|(_, chunk)| chunk)
        .collect()
}

/// Pack chunks into the context budget. The chunk that crosses the line is
/// truncated rather than dropped; everything after it is cut.
pub fn prune_to_token_budget(chunks: Vec<InferenceChunk>, budget: usize) -> Vec<InferenceChunk> {
    let mut kept = Vec::new();
    let mut used = 0usize;

    for mut chunk in chunks {
        let tokens = count_tokens(&chunk.content);
        if used + tokens <= budget {
            used += tokens;
            kept.push(chunk);
            continue;
        }

        let remaining = budget.saturating_sub(used);
        if remaining > 32 {
            debug!(
                "Truncating trailing chunk {}/{} from {} to {} tokens",
                chunk.document_id, chunk.chunk_id, tokens, remaining
            );
            chunk.content = truncate_to_tokens(&chunk.content, remaining);
            kept.push(chunk);
        }
        break;
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::models::DocumentSource;
    use std::collections::HashMap;

    fn chunk(doc_id: &str, content: &str) -> InferenceChunk {
        InferenceChunk {
            document_id: doc_id.to_string(),
            chunk_id: 0,
            content: content.to_string(),
            source: DocumentSource::Web,
            semantic_identifier: doc_id.to_string(),
            link: None,
            metadata: HashMap::new(),
            doc_updated_at: None,
            large_chunk_reference_ids: Vec::new(),
            score: None,
        }
    }

    #[test]
    fn test_drop_irrelevant_is_positional() {
        let chunks = vec![chunk("A", "x"), chunk("B", "y"), chunk("C", "z")];
        let kept = drop_irrelevant(chunks, &[true, false, true]);
        let ids: Vec<_> = kept.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_budget_truncates_trailing_chunk() {
        let long: String = "token ".repeat(200);
        let chunks = vec![chunk("A", &long), chunk("B", &long), chunk("C", &long)];

        let kept = prune_to_token_budget(chunks, 300);
        // First fits whole, second truncated, third dropped
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].document_id, "A");
        assert_eq!(kept[1].document_id, "B");
        assert!(count_tokens(&kept[1].content) <= 100);

        let total: usize = kept.iter().map(|c| count_tokens(&c.content)).sum();
        assert!(total <= 300);
    }

    #[test]
    fn test_tiny_leftover_budget_drops_instead_of_truncating() {
        let long: String = "token ".repeat(100);
        let chunks = vec![chunk("A", &long), chunk("B", &long)];
        let kept = prune_to_token_budget(chunks, count_tokens(&long) + 5);
        assert_eq!(kept.len(), 1);
    }
}
