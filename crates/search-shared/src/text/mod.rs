use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::llm::LlmMessage;

static TOKENIZER: Lazy<CoreBPE> =
    Lazy::new(|| cl100k_base().expect("cl100k_base tokenizer is bundled"));

/// Token count using the shared BPE tokenizer.
pub fn count_tokens(text: &str) -> usize {
    TOKENIZER.encode_with_special_tokens(text).len()
}

/// Truncate text to at most `max_tokens`, cutting on token boundaries.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let tokens = TOKENIZER.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return text.to_string();
    }
    TOKENIZER
        .decode(tokens[..max_tokens].to_vec())
        .unwrap_or_else(|_| text.chars().take(max_tokens * 4).collect())
}

/// Message token count including a small per-message framing overhead.
pub fn count_message_tokens(message: &LlmMessage) -> usize {
    count_tokens(&message.content) + 4
}

/// Render the newest-first tail of a conversation that fits in the token
/// limit, oldest-first in the output.
pub fn combine_message_chain(messages: &[LlmMessage], token_limit: usize) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut used = 0usize;

    for message in messages.iter().rev() {
        let role = match message.role {
            crate::llm::LlmRole::User => "user",
            crate::llm::LlmRole::Assistant => "assistant",
            crate::llm::LlmRole::System => "system",
            crate::llm::LlmRole::Tool => "tool",
        };
        let line = format!("{}: {}", role, message.content);
        let line_tokens = count_tokens(&line);
        if used + line_tokens > token_limit && !kept.is_empty() {
            break;
        }
        used += line_tokens;
        kept.push(line);
    }

    kept.reverse();
    kept.join("\n")
}

/// Count of ASCII punctuation characters, used by the rephrase heuristics.
pub fn count_punctuation(text: &str) -> usize {
    text.chars().filter(|c| c.is_ascii_punctuation()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmMessage;

    #[test]
    fn test_count_tokens_nonzero_for_text() {
        assert!(count_tokens("hello world") > 0);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_truncate_respects_budget() {
        let text = "one two three four five six seven eight nine ten";
        let truncated = truncate_to_tokens(text, 3);
        assert!(count_tokens(&truncated) <= 3);
        assert!(text.starts_with(&truncated));
    }

    #[test]
    fn test_chunker_same_input_same_counts() {
        let text = "deterministic tokenization matters for chunk boundaries";
        assert_eq!(count_tokens(text), count_tokens(text));
    }

    #[test]
    fn test_combine_message_chain_keeps_tail() {
        let messages = vec![
            LlmMessage::user("first question about setup"),
            LlmMessage::assistant("first answer"),
            LlmMessage::user("second question"),
        ];
        let combined = combine_message_chain(&messages, 8);
        // The newest message always survives
        assert!(combined.contains("second question"));
        assert!(!combined.contains("first question"));
    }

    #[test]
    fn test_count_punctuation() {
        assert_eq!(count_punctuation("no punct here"), 0);
        assert_eq!(count_punctuation("a=b&c=d;e"), 4);
    }
}
