//! Switched-off capabilities
//!
//! Stand-ins for a recognizer or synthesizer that is not configured. They fail
//! every call with [`ProviderError::Disabled`], which the rest of the core
//! already knows how to degrade around: a mute synthesizer yields silent
//! payloads (text-only replies), a disabled recognizer reports an error for
//! voice input while text input keeps working.

use async_trait::async_trait;

use super::traits::{Recognizer, SynthesizedAudio, Synthesizer};
use crate::error::ProviderError;

/// Recognizer that rejects all audio
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledRecognizer;

#[async_trait]
impl Recognizer for DisabledRecognizer {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn transcribe(&self, _samples: &[f32]) -> Result<String, ProviderError> {
        Err(ProviderError::Disabled("speech recognition"))
    }
}

/// Synthesizer that never produces audio
#[derive(Clone, Copy, Debug, Default)]
pub struct MuteSynthesizer;

#[async_trait]
impl Synthesizer for MuteSynthesizer {
    fn name(&self) -> &'static str {
        "mute"
    }

    async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio, ProviderError> {
        Err(ProviderError::Disabled("speech synthesis"))
    }
}
