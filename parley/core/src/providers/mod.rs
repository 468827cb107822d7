//! External Capabilities
//!
//! Speech recognition, reply generation and speech synthesis sit behind the
//! traits in this module. The core only ever talks to the traits.
//!
//! # Available Backends
//!
//! - **Generator**: `echo` (repeats input, default), `ollama` (local LLM server)
//! - **Recognizer**: `disabled` (text input only)
//! - **Synthesizer**: `mute` (text-only replies)
//! - **Speech classifier**: energy based
//!
//! # Usage
//!
//! ```ignore
//! use parley_core::providers::ProviderFactory;
//!
//! let factory = ProviderFactory::new(&config);
//! let providers = factory.build();
//! let stream = providers.generator.respond(input).await?;
//! ```

mod disabled;
mod echo;
mod ollama;
mod sentence;
mod traits;

use std::sync::Arc;

pub use disabled::{DisabledRecognizer, MuteSynthesizer};
pub use echo::EchoGenerator;
pub use ollama::OllamaGenerator;
pub use sentence::{parse_sentence, SentenceSplitter};
pub use traits::{
    AudioHandle, ConversationInput, Generator, GeneratorOutput, GeneratorStream, Recognizer,
    RenderedAudio, SynthesizedAudio, Synthesizer,
};

use crate::config::{
    GeneratorConfig, GeneratorKind, ParleyConfig, RecognizerConfig, RecognizerKind,
    SynthesizerConfig, SynthesizerKind,
};
use crate::vad::{EnergyClassifier, SpeechClassifier};

/// The capabilities bound to one session
#[derive(Clone)]
pub struct ProviderSet {
    /// Speech to text
    pub recognizer: Arc<dyn Recognizer>,
    /// Reply generation (owns the session's conversation memory)
    pub generator: Arc<dyn Generator>,
    /// Text to speech
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl ProviderSet {
    /// Bundle explicit implementations (used by embedders and tests)
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            recognizer,
            generator,
            synthesizer,
        }
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("recognizer", &self.recognizer.name())
            .field("generator", &self.generator.name())
            .field("synthesizer", &self.synthesizer.name())
            .finish()
    }
}

/// Builds fresh provider bindings for each new session
#[derive(Clone, Debug)]
pub struct ProviderFactory {
    generator: GeneratorConfig,
    recognizer: RecognizerConfig,
    synthesizer: SynthesizerConfig,
}

impl ProviderFactory {
    /// Create a factory from the backend sections of `config`
    #[must_use]
    pub fn new(config: &ParleyConfig) -> Self {
        Self {
            generator: config.generator.clone(),
            recognizer: config.recognizer,
            synthesizer: config.synthesizer,
        }
    }

    /// Instantiate one set of providers
    ///
    /// Generators keep per-session memory, so every call creates a new one.
    #[must_use]
    pub fn build(&self) -> ProviderSet {
        let generator: Arc<dyn Generator> = match self.generator.backend {
            GeneratorKind::Echo => Arc::new(EchoGenerator::new(self.generator.greeting.clone())),
            GeneratorKind::Ollama => Arc::new(OllamaGenerator::from_config(&self.generator)),
        };
        let recognizer: Arc<dyn Recognizer> = match self.recognizer.backend {
            RecognizerKind::Disabled => Arc::new(DisabledRecognizer),
        };
        let synthesizer: Arc<dyn Synthesizer> = match self.synthesizer.backend {
            SynthesizerKind::Mute => Arc::new(MuteSynthesizer),
        };

        ProviderSet::new(recognizer, generator, synthesizer)
    }

    /// Per-frame speech classifier for a session's voice activity detection
    #[must_use]
    pub fn classifier(&self) -> Box<dyn SpeechClassifier> {
        Box::new(EnergyClassifier::default())
    }
}
