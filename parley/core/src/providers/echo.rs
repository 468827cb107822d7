//! Echo Generator
//!
//! A deterministic generator that repeats the newest line of its input back,
//! one fragment per sentence. Useful for demos without a model server and as
//! the scripted backend of integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::sentence::{parse_sentence, SentenceSplitter};
use super::traits::{ConversationInput, Generator, GeneratorStream};
use crate::error::ProviderError;

/// Repeats the last line it was given
#[derive(Debug)]
pub struct EchoGenerator {
    /// Said when there is nothing to echo
    greeting: String,
    /// Every interrupt reported to this generator, oldest first
    interruptions: Mutex<Vec<String>>,
}

impl EchoGenerator {
    /// Create an echo generator with the given fallback line
    #[must_use]
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            interruptions: Mutex::new(Vec::new()),
        }
    }

    /// Heard texts passed to [`Generator::handle_interrupt`] so far
    #[must_use]
    pub fn interruptions(&self) -> Vec<String> {
        self.interruptions.lock().clone()
    }

    /// The sentences a reply to `text` consists of
    fn reply_sentences(&self, text: &str) -> Vec<String> {
        let line = text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            // Group transcripts prefix each line with the speaker
            .map(|l| l.split_once(": ").map_or(l, |(_, said)| said))
            .filter(|l| !l.is_empty())
            .unwrap_or(self.greeting.as_str());

        let mut splitter = SentenceSplitter::new();
        let mut sentences = splitter.push(line);
        sentences.extend(splitter.finish());
        sentences
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new("Hello! I'm listening.")
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn respond(&self, input: ConversationInput) -> Result<GeneratorStream, ProviderError> {
        let outputs: Vec<_> = self
            .reply_sentences(&input.text)
            .iter()
            .map(|s| Ok(parse_sentence(s)))
            .collect();
        Ok(Box::pin(futures::stream::iter(outputs)))
    }

    async fn handle_interrupt(&self, heard_text: &str) {
        self.interruptions.lock().push(heard_text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(generator: &EchoGenerator, text: &str) -> Vec<String> {
        let stream = generator
            .respond(ConversationInput::text(text, "Human"))
            .await
            .unwrap();
        stream
            .map(|o| o.unwrap().reply_text().to_string())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_echoes_sentences() {
        let generator = EchoGenerator::default();
        let reply = collect(&generator, "Hi there. How are you?").await;
        assert_eq!(reply, vec!["Hi there.", "How are you?"]);
    }

    #[tokio::test]
    async fn test_echoes_last_transcript_line_without_speaker() {
        let generator = EchoGenerator::default();
        let reply = collect(&generator, "Human: hello\nAlice: nice weather").await;
        assert_eq!(reply, vec!["nice weather"]);
    }

    #[tokio::test]
    async fn test_empty_input_uses_greeting() {
        let generator = EchoGenerator::new("Hey.");
        assert_eq!(collect(&generator, "  ").await, vec!["Hey."]);
    }

    #[tokio::test]
    async fn test_records_interrupts() {
        let generator = EchoGenerator::default();
        generator.handle_interrupt("Hi th").await;
        assert_eq!(generator.interruptions(), vec!["Hi th"]);
    }
}
