//! Reasoning segmentation - splits model output into thinking and answer
//! segments for models that emit `<think>…</think>` blocks

use serde::{Deserialize, Serialize};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Two-part split of decoded text for a reasoning-tagged model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThinkingSplit {
    /// Content between the thinking delimiters, if an opening tag was seen
    pub thinking: Option<String>,
    /// Content after the closing delimiter; for untagged text, the whole text
    pub answer: Option<String>,
}

impl ThinkingSplit {
    /// True while the model is inside an unclosed thinking segment.
    pub fn is_thinking(&self) -> bool {
        self.thinking.is_some() && self.answer.is_none()
    }
}

/// Split raw decoded text into thinking and answer segments.
///
/// Recomputed on every partial update, so the input is usually a prefix of
/// the final text and the closing tag may not have arrived yet:
/// - no opening tag: the entire text is the answer
/// - opening tag, no closing tag yet: everything after it is thinking
/// - both tags: between them is thinking, after the closing tag is the answer
pub fn split_thinking(text: &str) -> ThinkingSplit {
    if text.is_empty() {
        return ThinkingSplit::default();
    }

    let Some(open) = text.find(THINK_OPEN) else {
        return ThinkingSplit {
            thinking: None,
            answer: Some(text.to_string()),
        };
    };

    let body = &text[open + THINK_OPEN.len()..];
    match body.find(THINK_CLOSE) {
        Some(close) => {
            let answer = &body[close + THINK_CLOSE.len()..];
            ThinkingSplit {
                thinking: Some(body[..close].to_string()),
                answer: if answer.is_empty() {
                    None
                } else {
                    Some(answer.to_string())
                },
            }
        }
        None => ThinkingSplit {
            thinking: Some(body.to_string()),
            answer: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_tags() {
        let split = split_thinking("<think>a</think>b");
        assert_eq!(split.thinking.as_deref(), Some("a"));
        assert_eq!(split.answer.as_deref(), Some("b"));
        assert!(!split.is_thinking());
    }

    #[test]
    fn test_unclosed_tag() {
        let split = split_thinking("<think>a");
        assert_eq!(split.thinking.as_deref(), Some("a"));
        assert_eq!(split.answer, None);
        assert!(split.is_thinking());
    }

    #[test]
    fn test_no_tags() {
        let split = split_thinking("no tags here");
        assert_eq!(split.thinking, None);
        assert_eq!(split.answer.as_deref(), Some("no tags here"));
    }

    #[test]
    fn test_empty() {
        let split = split_thinking("");
        assert_eq!(split.thinking, None);
        assert_eq!(split.answer, None);
    }

    #[test]
    fn test_closed_tag_no_answer_yet() {
        let split = split_thinking("<think>plan</think>");
        assert_eq!(split.thinking.as_deref(), Some("plan"));
        assert_eq!(split.answer, None);
    }

    #[test]
    fn test_leading_text_before_tag() {
        // Some models emit a preamble before the tag; the tag still wins
        let split = split_thinking("ok <think>x</think>done");
        assert_eq!(split.thinking.as_deref(), Some("x"));
        assert_eq!(split.answer.as_deref(), Some("done"));
    }
}
