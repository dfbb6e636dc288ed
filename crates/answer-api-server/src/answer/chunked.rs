use futures::StreamExt;
use search_shared::llm::{LlmClient, LlmMessage};
use search_shared::text::{count_message_tokens, count_tokens};
use tracing::{debug, info, warn};

/// Tokens reserved for the model response and framing.
pub const RESERVED_RESPONSE_TOKENS: usize = 2000;
/// Fraction of the available budget each chunk may use; larger chunks mean
/// fewer round trips.
const CHUNK_BUDGET_FRACTION: f64 = 0.8;
const MIN_CONTENT_TOKENS: usize = 1000;

/// True when the prompt (existing messages + new content + reserve) cannot
/// fit the model window. Checked before building the final prompt so the
/// oversized branch is taken explicitly rather than via a provider error.
pub fn should_use_chunked_processing(
    content: &str,
    max_tokens: usize,
    existing_messages: &[LlmMessage],
) -> bool {
    let content_tokens = count_tokens(content);
    let existing_tokens: usize = existing_messages.iter().map(count_message_tokens).sum();
    let total = content_tokens + existing_tokens + RESERVED_RESPONSE_TOKENS;

    debug!(
        "Token estimate: content={} existing={} total={} max={}",
        content_tokens, existing_tokens, total, max_tokens
    );
    total > max_tokens
}

/// Tokens available for content per chunk, given the fixed messages.
pub fn available_content_tokens(max_tokens: usize, base_messages: &[LlmMessage]) -> usize {
    let used: usize = base_messages.iter().map(count_message_tokens).sum();
    max_tokens
        .saturating_sub(used)
        .saturating_sub(RESERVED_RESPONSE_TOKENS)
        .max(MIN_CONTENT_TOKENS)
}

/// Split on line boundaries so structure survives; a chunk closes when the
/// next line would push it past the budget.
pub fn split_content_into_chunks(content: &str, chunk_token_budget: usize) -> Vec<String> {
    if count_tokens(content) <= chunk_token_budget {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for line in content.split('\n') {
        let line_tokens = count_tokens(line) + 1;
        if current_tokens + line_tokens > chunk_token_budget && !current.is_empty() {
            chunks.push(current.trim().to_string());
            current = String::new();
            current_tokens = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_tokens += line_tokens;
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks
}

fn chunk_prompt(
    chunk: &str,
    chunk_index: usize,
    total_chunks: usize,
    previous_responses: &[String],
    original_query: &str,
) -> String {
    let mut prompt = format!(
        "You are analyzing a large document in chunks.\n\n\
         ORIGINAL QUERY: {original_query}\n\n\
         CHUNK {} OF {total_chunks}:\n{chunk}\n\n",
        chunk_index + 1
    );

    if previous_responses.is_empty() {
        prompt.push_str(
            "INSTRUCTIONS:\n\
             This is the first chunk. Analyze it according to the original query.\n\n\
             RESPONSE FORMAT:\n\
             CURRENT_CHUNK_ANALYSIS: [Your analysis of this chunk]\n",
        );
    } else {
        prompt.push_str("PREVIOUS ANALYSIS FROM EARLIER CHUNKS:\n");
        for (i, response) in previous_responses.iter().enumerate() {
            prompt.push_str(&format!("Chunk {}: {}\n", i + 1, response));
        }
        prompt.push_str(
            "\nINSTRUCTIONS:\n\
             1. Analyze this new chunk in the context of the original query\n\
             2. If this chunk adds, contradicts or modifies the previous analysis, say what changes\n\
             3. If it adds nothing significant, say so\n\n\
             RESPONSE FORMAT:\n\
             MODIFICATIONS_TO_PREVIOUS: [Changes to previous analysis, or \"None\"]\n\
             CURRENT_CHUNK_ANALYSIS: [Your analysis of this chunk]\n",
        );
    }
    prompt
}

fn consolidation_prompt(all_responses: &[String], original_query: &str) -> String {
    let mut prompt = format!(
        "You have analyzed a large document in chunks. Now provide a final consolidated response.\n\n\
         ORIGINAL QUERY: {original_query}\n\n\
         ALL CHUNK ANALYSES:\n"
    );
    for (i, response) in all_responses.iter().enumerate() {
        prompt.push_str(&format!("Chunk {}: {}\n", i + 1, response));
    }
    prompt.push_str(
        "\nINSTRUCTIONS:\n\
         Synthesize the analyses, resolve contradictions, and answer the original query.\n\n\
         FINAL RESPONSE:\n",
    );
    prompt
}

/// Oversized-content fallback: analyze chunk by chunk, accumulating
/// modifications to the previous analysis, then stream one consolidation
/// call verbatim to the caller. With a single chunk this degenerates to the
/// normal streaming path.
pub struct ChunkedContentProcessor<'a> {
    llm: &'a dyn LlmClient,
    max_tokens: usize,
}

impl<'a> ChunkedContentProcessor<'a> {
    pub fn new(llm: &'a dyn LlmClient, max_tokens: usize) -> Self {
        Self { llm, max_tokens }
    }

    pub async fn process(
        &self,
        content: &str,
        original_query: &str,
        base_messages: &[LlmMessage],
        mut emit: impl FnMut(String),
    ) -> Result<(), search_shared::llm::LlmError> {
        let available = available_content_tokens(self.max_tokens, base_messages);
        let chunk_budget = (available as f64 * CHUNK_BUDGET_FRACTION) as usize;

        let chunks = split_content_into_chunks(content, chunk_budget);
        info!(
            "Chunked processing: {} tokens into {} chunks (budget {} each)",
            count_tokens(content),
            chunks.len(),
            chunk_budget
        );

        if chunks.len() == 1 {
            // One chunk after splitting behaves exactly like the normal path
            let mut messages = base_messages.to_vec();
            messages.push(LlmMessage::user(format!(
                "{original_query}\n\n{}",
                chunks[0]
            )));
            return self.stream_final(&messages, &mut emit).await;
        }

        let mut previous_responses: Vec<String> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            debug!("Processing chunk {}/{}", i + 1, chunks.len());
            let prompt = chunk_prompt(chunk, i, chunks.len(), &previous_responses, original_query);

            let mut messages = base_messages.to_vec();
            messages.push(LlmMessage::user(prompt));

            match self.llm.complete(&messages, None, None, None).await {
                Ok(response) => previous_responses.push(response),
                Err(e) => {
                    // One bad chunk should not sink the run; the
                    // consolidation call sees the failure note instead
                    warn!("Chunk {}/{} failed: {}", i + 1, chunks.len(), e);
                    previous_responses.push(format!("Error processing chunk {}: {e}", i + 1));
                }
            }
        }

        let final_prompt = consolidation_prompt(&previous_responses, original_query);
        let mut messages = base_messages.to_vec();
        messages.push(LlmMessage::user(final_prompt));
        self.stream_final(&messages, &mut emit).await
    }

    async fn stream_final(
        &self,
        messages: &[LlmMessage],
        emit: &mut impl FnMut(String),
    ) -> Result<(), search_shared::llm::LlmError> {
        let mut stream = self.llm.stream(messages, None, None, None).await?;
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    emit(content);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_content_is_not_chunked() {
        assert!(!should_use_chunked_processing("short question", 8192, &[]));
    }

    #[test]
    fn test_large_content_triggers_chunking() {
        let content = "lots of pasted text ".repeat(4000);
        assert!(should_use_chunked_processing(&content, 8192, &[]));
    }

    #[test]
    fn test_existing_messages_count_against_budget() {
        let content = "y ".repeat(500);
        // A window sized so the content alone fits with a little room
        let max = count_tokens(&content) + RESERVED_RESPONSE_TOKENS + 50;
        assert!(!should_use_chunked_processing(&content, max, &[]));

        // The same content no longer fits once history eats the headroom
        let history = vec![LlmMessage::user("x ".repeat(2000))];
        assert!(should_use_chunked_processing(&content, max, &history));
    }

    #[test]
    fn test_split_respects_budget_and_loses_nothing() {
        let content = (0..500)
            .map(|i| format!("line number {i} with some words"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_content_into_chunks(&content, 200);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(count_tokens(chunk) <= 220, "chunk overflows budget");
        }
        // Every line survives, in order
        let rejoined = chunks.join("\n");
        for i in [0, 250, 499] {
            assert!(rejoined.contains(&format!("line number {i} ")));
        }
    }

    #[test]
    fn test_chunk_count_matches_budget_arithmetic() {
        // ~120k tokens into an 8k window with 2000 reserved and 80% chunk
        // budget: available ≈ 6000, chunk ≈ 4800, so around 25 chunks; with
        // a 40k-token input it is a third of that. The point is the count
        // tracks total/chunk_budget.
        let line = "alpha beta gamma delta epsilon zeta";
        let line_tokens = count_tokens(line) + 1;
        let total_lines = 2000;
        let content = vec![line; total_lines].join("\n");
        let budget = line_tokens * 100;

        let chunks = split_content_into_chunks(&content, budget);
        let expected = (total_lines as f64 / 100.0).ceil() as usize;
        assert!(
            (chunks.len() as i64 - expected as i64).abs() <= 1,
            "expected ≈{expected}, got {}",
            chunks.len()
        );
    }

    #[test]
    fn test_single_chunk_when_content_fits() {
        let chunks = split_content_into_chunks("fits easily", 500);
        assert_eq!(chunks, vec!["fits easily".to_string()]);
    }

    #[test]
    fn test_first_chunk_prompt_has_no_modifications_section() {
        let prompt = chunk_prompt("body", 0, 3, &[], "what is this?");
        assert!(!prompt.contains("MODIFICATIONS_TO_PREVIOUS"));
        assert!(prompt.contains("CHUNK 1 OF 3"));

        let later = chunk_prompt("body", 1, 3, &["first analysis".to_string()], "q");
        assert!(later.contains("MODIFICATIONS_TO_PREVIOUS"));
        assert!(later.contains("first analysis"));
    }
}
