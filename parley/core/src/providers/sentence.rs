//! Sentence Splitting
//!
//! Generators stream tokens; the delivery queue wants sentence-sized fragments
//! so synthesis of sentence one can overlap generation of sentence two.
//! [`SentenceSplitter`] buffers tokens and releases each sentence as soon as
//! its terminator is seen. [`parse_sentence`] strips `[expression]` tags out
//! of a sentence and turns them into avatar actions.

use super::traits::GeneratorOutput;
use crate::messages::{Actions, DisplayText};

/// Terminators that end a sentence only when followed by whitespace
const LATIN_TERMINATORS: &[char] = &['.', '!', '?', '…'];

/// Terminators that end a sentence on their own
const CJK_TERMINATORS: &[char] = &['。', '！', '？'];

/// Incremental sentence splitter
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    /// Create an empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token, returning every sentence it completed
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first complete sentence, if any
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            let after = idx + c.len_utf8();
            if CJK_TERMINATORS.contains(&c) {
                return Some(after);
            }
            if LATIN_TERMINATORS.contains(&c) {
                match chars.peek() {
                    Some((_, next)) if next.is_whitespace() => return Some(after),
                    _ => {}
                }
            }
        }
        None
    }
}

/// Turn one sentence into a generator output, lifting `[tag]` markers into
/// expression actions
///
/// Only tags made of letters, digits, `_` and `-` count; anything else in
/// brackets is kept as text.
#[must_use]
pub fn parse_sentence(sentence: &str) -> GeneratorOutput {
    let mut text = String::with_capacity(sentence.len());
    let mut actions = Actions::default();
    let mut chars = sentence.chars();

    while let Some(c) = chars.next() {
        if c != '[' {
            text.push(c);
            continue;
        }

        let mut tag = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == ']' {
                closed = true;
                break;
            }
            tag.push(inner);
        }

        let is_expression = closed
            && !tag.is_empty()
            && tag
                .chars()
                .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '-');
        if is_expression {
            actions.expressions.push(tag.to_lowercase());
        } else {
            text.push('[');
            text.push_str(&tag);
            if closed {
                text.push(']');
            }
        }
    }

    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    GeneratorOutput::Sentence {
        display: DisplayText::new(text.clone()),
        tts_text: text,
        actions,
    }
}
