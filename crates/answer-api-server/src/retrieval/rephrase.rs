use std::collections::HashSet;

use search_shared::llm::{LlmClient, LlmMessage};
use search_shared::text::{combine_message_chain, count_punctuation};
use tracing::{debug, warn};

/// Queries at least this long are assumed to be copy-pastes the user wants
/// matched closely, so they are not rephrased.
const SIZE_HEURISTIC: usize = 200;
/// Heavy punctuation means it is probably not natural language.
const PUNCTUATION_HEURISTIC: usize = 10;
const HISTORY_TOKEN_CUTOFF: usize = 1024;

const HISTORY_QUERY_REPHRASE: &str = "\
Given the following conversation and a follow-up input, rephrase the follow-up \
into a SHORT, standalone query (which captures any relevant context from previous messages).
IMPORTANT: EDIT THE QUERY TO BE AS CONCISE AS POSSIBLE. Respond with a short, \
compressed phrase; do NOT answer the question.

Chat History:
{chat_history}

Follow Up Input: {question}
Standalone question (Respond with only the short combined query):";

const LANGUAGE_REPHRASE_PROMPT: &str = "\
Translate the following query into {target_language}. Keep names, product \
terms and identifiers unchanged. Respond with only the translated query.

Query: {query}";

/// Rewrite a short conversational follow-up into a standalone query using
/// the fast LLM. Long or punctuation-heavy queries and history-less turns
/// pass through unchanged, as does any rephrase failure.
pub async fn history_based_query_rephrase(
    query: &str,
    history: &[LlmMessage],
    fast_llm: &dyn LlmClient,
) -> String {
    if history.is_empty() {
        return query.to_string();
    }
    if query.len() >= SIZE_HEURISTIC {
        return query.to_string();
    }
    if count_punctuation(query) >= PUNCTUATION_HEURISTIC {
        return query.to_string();
    }

    let history_str = combine_message_chain(history, HISTORY_TOKEN_CUTOFF);
    let prompt = HISTORY_QUERY_REPHRASE
        .replace("{chat_history}", &history_str)
        .replace("{question}", query);

    match fast_llm
        .complete(&[LlmMessage::user(prompt)], None, None, None)
        .await
    {
        Ok(rephrased) if !rephrased.trim().is_empty() => {
            debug!("Rephrased '{}' -> '{}'", query, rephrased.trim());
            rephrased.trim().to_string()
        }
        Ok(_) => query.to_string(),
        Err(e) => {
            warn!("Query rephrase failed, using original: {}", e);
            query.to_string()
        }
    }
}

/// The query plus its multilingual rephrasings, deduped on simplified text.
/// Expansion is skipped entirely for multi-line queries.
pub async fn expanded_queries(
    query: &str,
    expansion_languages: &[String],
    fast_llm: &dyn LlmClient,
) -> Vec<String> {
    if expansion_languages.is_empty() || query.contains('\n') || query.contains('\r') {
        return vec![query.to_string()];
    }

    let mut queries = vec![query.to_string()];
    let mut simplified: HashSet<String> = HashSet::from([simplify_text(query)]);

    for language in expansion_languages {
        let prompt = LANGUAGE_REPHRASE_PROMPT
            .replace("{target_language}", language)
            .replace("{query}", query);
        match fast_llm
            .complete(&[LlmMessage::user(prompt)], None, None, None)
            .await
        {
            Ok(rephrase) => {
                let rephrase = rephrase.trim().to_string();
                // Near-identical rephrasings would bias the merged results
                if !rephrase.is_empty() && simplified.insert(simplify_text(&rephrase)) {
                    queries.push(rephrase);
                }
            }
            Err(e) => warn!("Multilingual expansion for {} failed: {}", language, e),
        }
    }
    queries
}

fn simplify_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation() && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it", "of",
    "on", "or", "that", "the", "to", "what", "when", "where", "which", "who", "why", "with",
];

/// Keyword extraction for the hybrid query: lowercased tokens minus stop
/// words and punctuation; falls back to all tokens when everything is a
/// stop word.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect();

    let trimmed: Vec<String> = tokens
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .cloned()
        .collect();

    if trimmed.is_empty() {
        tokens
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords_drops_stop_words() {
        assert_eq!(
            extract_keywords("what is the indexing scheduler?"),
            vec!["indexing", "scheduler"]
        );
    }

    #[test]
    fn test_extract_keywords_falls_back_when_all_stop_words() {
        assert_eq!(extract_keywords("what is the"), vec!["what", "is", "the"]);
    }

    #[test]
    fn test_simplify_text_ignores_case_and_punctuation() {
        assert_eq!(simplify_text("Hello, World!"), simplify_text("hello world"));
    }
}
