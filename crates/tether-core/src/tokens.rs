//! Fallback token estimation
//!
//! Used only when a backend does not report exact counts. One token is taken
//! to be four characters, rounded up, so the empty string costs nothing.

use crate::providers::types::ChatMessage;

/// Estimate the token count of a piece of text: `ceil(chars / 4)`.
pub fn estimate_token_count(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate the prompt side of a request by summing each message's content.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| estimate_token_count(&m.content))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatRole;

    #[test]
    fn test_empty_string_is_zero() {
        assert_eq!(estimate_token_count(""), 0);
    }

    #[test]
    fn test_hello_world() {
        // 13 characters
        assert_eq!(estimate_token_count("Hello, world!"), 4);
    }

    #[test]
    fn test_rounds_up() {
        assert_eq!(estimate_token_count("a"), 1);
        assert_eq!(estimate_token_count("abcd"), 1);
        assert_eq!(estimate_token_count("abcde"), 2);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        // 4 characters, 12 bytes
        assert_eq!(estimate_token_count("日本語だ"), 1);
    }

    #[test]
    fn test_prompt_sum() {
        let messages = vec![
            ChatMessage::new(ChatRole::System, "Be brief."),
            ChatMessage::new(ChatRole::User, "Hello, world!"),
        ];
        // ceil(9/4) + ceil(13/4)
        assert_eq!(estimate_prompt_tokens(&messages), 3 + 4);
        assert_eq!(estimate_prompt_tokens(&[]), 0);
    }
}
