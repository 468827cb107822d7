//! Provider Traits
//!
//! The three external capabilities a conversation consumes. Each is a narrow
//! async trait so backends can be swapped without touching the core:
//!
//! - [`Recognizer`]: speech samples to text
//! - [`Generator`]: conversation input to a stream of reply sentences
//! - [`Synthesizer`]: sentence text to audio, plus explicit release
//!
//! Backends are picked once, when a session context is built. Nothing past
//! that point branches on which backend is in use.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::events::ImageInput;
use crate::messages::{Actions, DisplayText};

/// What a generator is asked to respond to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationInput {
    /// New text since the generator last spoke (may span several lines)
    pub text: String,
    /// Who the text is attributed to
    pub from_name: String,
    /// Images attached by the user
    pub images: Vec<ImageInput>,
}

impl ConversationInput {
    /// Text-only input
    #[must_use]
    pub fn text(text: impl Into<String>, from_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_name: from_name.into(),
            images: Vec::new(),
        }
    }
}

/// Rendered audio ready to be sent to a client
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedAudio {
    /// Encoded audio bytes (container format is the backend's choice)
    pub bytes: Vec<u8>,
    /// Per-slice volume envelope for lip sync
    pub volumes: Vec<f32>,
    /// Length of one volume slice in milliseconds
    pub slice_length_ms: u32,
}

/// Identifies a synthesized clip until it is released
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioHandle(Uuid);

impl AudioHandle {
    /// Generate a fresh handle
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "audio-{}", self.0)
    }
}

/// Result of one synthesis call
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedAudio {
    /// Handle to pass back to [`Synthesizer::release`]
    pub handle: AudioHandle,
    /// The audio itself
    pub audio: RenderedAudio,
}

/// One item of a generator's reply stream
#[derive(Clone, Debug, PartialEq)]
pub enum GeneratorOutput {
    /// A sentence to synthesize
    Sentence {
        /// Text shown to the user
        display: DisplayText,
        /// Text handed to the synthesizer (may differ from the display text)
        tts_text: String,
        /// Animation actions for this sentence
        actions: Actions,
    },
    /// Audio the generator rendered itself
    Audio {
        /// The audio
        audio: RenderedAudio,
        /// Text shown to the user
        display: DisplayText,
        /// What the audio says
        transcript: String,
        /// Animation actions for this clip
        actions: Actions,
    },
}

impl GeneratorOutput {
    /// A sentence whose spoken and displayed text are the same
    #[must_use]
    pub fn sentence(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Sentence {
            display: DisplayText::new(text.clone()),
            tts_text: text,
            actions: Actions::default(),
        }
    }

    /// The text this output contributes to the reply transcript
    #[must_use]
    pub fn reply_text(&self) -> &str {
        match self {
            Self::Sentence { display, .. } => &display.text,
            Self::Audio { transcript, .. } => transcript,
        }
    }
}

/// Stream of reply outputs
pub type GeneratorStream = BoxStream<'static, Result<GeneratorOutput, ProviderError>>;

/// Speech-to-text capability
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Transcribe mono float samples
    async fn transcribe(&self, samples: &[f32]) -> Result<String, ProviderError>;
}

/// Reply generation capability
///
/// A generator instance belongs to one session and may keep conversation
/// memory across calls.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Start a reply to `input`
    async fn respond(&self, input: ConversationInput) -> Result<GeneratorStream, ProviderError>;

    /// The user cut the reply short after hearing `heard_text`
    async fn handle_interrupt(&self, _heard_text: &str) {}
}

/// Text-to-speech capability
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Render `text` to audio
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, ProviderError>;

    /// Free whatever backs `handle` (temp files, cache slots)
    async fn release(&self, _handle: AudioHandle) {}
}
