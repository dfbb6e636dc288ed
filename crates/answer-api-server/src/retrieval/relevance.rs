use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use search_shared::llm::{retry_with_backoff, LlmClient, LlmLimiter, LlmMessage, RetryPolicy};
use search_shared::models::InferenceChunk;
use tracing::{info, warn};

pub const DEFAULT_RELEVANCE_BATCH_SIZE: usize = 25;

static LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*[:\-]\s*(yes|no)").expect("static regex"));

/// One prompt listing every section in the batch; the model answers
/// `<n>: Yes/No` per line.
pub fn build_batch_prompt(query: &str, sections: &[&InferenceChunk]) -> String {
    let mut lines = vec![
        format!("Query: \"{query}\""),
        "For each section below, reply ONLY with 'Yes' if relevant to the query or 'No' if not relevant.".to_string(),
        "Format your output as: <section_number>: Yes/No".to_string(),
        String::new(),
    ];

    for (idx, section) in sections.iter().enumerate() {
        let title = section.semantic_identifier.replace('\n', " ");
        let metadata_str = if section.metadata.is_empty() {
            String::new()
        } else {
            let mut parts: Vec<String> = section
                .metadata
                .iter()
                .map(|(k, v)| format!("{k} - {}", v.as_joined_str()))
                .collect();
            parts.sort();
            format!("\nMetadata:\n{}", parts.join("\n"))
        };
        lines.push(format!(
            "{}. Title: {title}{metadata_str}Content: {}",
            idx + 1,
            section.content
        ));
    }

    lines.join("\n")
}

/// Parse per-line verdicts. A missing line defaults to relevant: when the
/// model skips a section it is better to trust the ranker than to drop it.
pub fn parse_batch_output(output: &str, section_count: usize) -> Vec<bool> {
    let mut verdicts = vec![true; section_count];

    for captures in LINE_RE.captures_iter(output) {
        let Ok(idx) = captures[1].parse::<usize>() else {
            continue;
        };
        if idx < 1 || idx > section_count {
            continue;
        }
        verdicts[idx - 1] = captures[2].eq_ignore_ascii_case("yes");
    }
    verdicts
}

/// Batched relevance filtering: batches run in parallel under the global
/// LLM semaphore, each call wrapped in rate-limit backoff. A failed batch
/// marks its sections not-relevant.
pub async fn llm_batch_eval_sections(
    query: &str,
    sections: &[InferenceChunk],
    llm: &dyn LlmClient,
    limiter: &LlmLimiter,
    retry: &RetryPolicy,
    batch_size: usize,
) -> Vec<bool> {
    if sections.is_empty() {
        return Vec::new();
    }
    let batch_size = batch_size.max(1);
    let batches: Vec<&[InferenceChunk]> = sections.chunks(batch_size).collect();
    info!(
        "LLM relevance: {} sections in {} batches",
        sections.len(),
        batches.len()
    );

    let futures = batches.iter().map(|batch| async move {
        let refs: Vec<&InferenceChunk> = batch.iter().collect();
        let prompt = build_batch_prompt(query, &refs);

        let _permit = match limiter.acquire("llm_relevance").await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Relevance batch could not acquire LLM permit: {}", e);
                return vec![false; batch.len()];
            }
        };

        let result = retry_with_backoff("llm_relevance", retry, || {
            let messages = vec![LlmMessage::user(prompt.clone())];
            async move { llm.complete(&messages, None, None, None).await }
        })
        .await;

        match result {
            Ok(output) => parse_batch_output(&output, batch.len()),
            Err(e) => {
                warn!("Relevance batch failed, marking sections not relevant: {}", e);
                vec![false; batch.len()]
            }
        }
    });

    join_all(futures).await.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_lines_present() {
        let verdicts = parse_batch_output("1: Yes\n2: No\n3: yes", 3);
        assert_eq!(verdicts, vec![true, false, true]);
    }

    #[test]
    fn test_parse_missing_line_defaults_to_yes() {
        let verdicts = parse_batch_output("1: Yes\n3: yes", 3);
        assert_eq!(verdicts, vec![true, true, true]);
    }

    #[test]
    fn test_parse_tolerates_dash_separator_and_noise() {
        let verdicts = parse_batch_output("Sure!\n1 - No\n2: YES\ntrailing words", 2);
        assert_eq!(verdicts, vec![false, true]);
    }

    #[test]
    fn test_parse_ignores_out_of_range_indexes() {
        let verdicts = parse_batch_output("1: No\n9: No", 2);
        assert_eq!(verdicts, vec![false, true]);
    }

    #[test]
    fn test_empty_output_trusts_the_ranker() {
        assert_eq!(parse_batch_output("", 2), vec![true, true]);
    }
}
