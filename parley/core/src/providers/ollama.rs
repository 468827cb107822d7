//! Ollama Generator
//!
//! Reply generation backed by a local Ollama server.
//!
//! # Ollama API
//!
//! Uses the `/api/chat` endpoint with streaming enabled. The server answers
//! with newline-delimited JSON objects:
//!
//! ```json
//! {"message": {"role": "assistant", "content": "Hel"}, "done": false}
//! {"message": {"role": "assistant", "content": "lo."}, "done": true}
//! ```
//!
//! Tokens are cut into sentences as they arrive, so the first sentence can be
//! synthesized while the model is still writing the second.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::sentence::{parse_sentence, SentenceSplitter};
use super::traits::{ConversationInput, Generator, GeneratorStream};
use crate::config::GeneratorConfig;
use crate::error::ProviderError;

const BACKEND: &str = "ollama";

/// Appended to memory after the user cuts a reply short
const INTERRUPT_MARKER: &str = "[Interrupted by user]";

/// Splits a byte stream into newline-terminated lines
///
/// Bytes are only decoded once a whole line is in, so a multi-byte
/// character cut across two network chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, without newlines
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }
}

/// One turn of chat memory
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/// Ollama-backed generator with per-session chat memory
pub struct OllamaGenerator {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Model name
    model: String,
    /// System prompt sent ahead of the history
    system_prompt: Option<String>,
    /// Sampling temperature
    temperature: f32,
    /// HTTP client
    http_client: reqwest::Client,
    /// Conversation so far, shared with in-flight stream tasks
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl OllamaGenerator {
    /// Create a generator talking to `host:port` with `model`
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            model: model.into(),
            system_prompt: None,
            temperature: 0.7,
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create from the `[generator]` config section
    #[must_use]
    pub fn from_config(config: &GeneratorConfig) -> Self {
        let mut generator = Self::new(config.host.clone(), config.port, config.model.clone());
        generator.system_prompt = config.system_prompt.clone();
        generator.temperature = config.temperature;
        generator
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Memory entry for a user input
    fn user_message(input: &ConversationInput) -> ChatMessage {
        let content = if input.from_name.is_empty() || input.text.contains('\n') {
            // Group deltas already carry a speaker on every line
            input.text.clone()
        } else {
            format!("{}: {}", input.from_name, input.text)
        };
        let images = input
            .images
            .iter()
            .map(|img| {
                // Ollama wants bare base64, not a data URL
                img.data
                    .split_once(";base64,")
                    .map_or(img.data.as_str(), |(_, data)| data)
                    .to_string()
            })
            .collect();
        ChatMessage {
            role: "user",
            content,
            images,
        }
    }

    /// Request body for the given history
    fn build_request(&self, history: &[ChatMessage]) -> serde_json::Value {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(ref system) = self.system_prompt {
            messages.push(ChatMessage::new("system", system.clone()));
        }
        messages.extend_from_slice(history);

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": { "temperature": self.temperature },
        })
    }
}

impl std::fmt::Debug for OllamaGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaGenerator")
            .field("url", &self.base_url())
            .field("model", &self.model)
            .field("history_len", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn respond(&self, input: ConversationInput) -> Result<GeneratorStream, ProviderError> {
        let messages = {
            let mut history = self.history.lock();
            if !input.text.trim().is_empty() || !input.images.is_empty() {
                history.push(Self::user_message(&input));
            }
            history.clone()
        };
        let body = self.build_request(&messages);

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                backend: BACKEND,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Backend {
                backend: BACKEND,
                reason: format!("{status}: {body}"),
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let history = Arc::clone(&self.history);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            let mut full_response = String::new();
            let mut splitter = SentenceSplitter::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::Stream {
                                backend: BACKEND,
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                // Parse newline-delimited JSON
                for line in buffer.push(&bytes) {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let Ok(data) = serde_json::from_slice::<serde_json::Value>(&line) else {
                        warn!(
                            line = %String::from_utf8_lossy(&line),
                            "skipping unparsable ollama line"
                        );
                        continue;
                    };

                    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
                        let _ = tx
                            .send(Err(ProviderError::Backend {
                                backend: BACKEND,
                                reason: error.to_string(),
                            }))
                            .await;
                        return;
                    }

                    if let Some(token) = data
                        .get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str())
                    {
                        full_response.push_str(token);
                        for sentence in splitter.push(token) {
                            if tx.send(Ok(parse_sentence(&sentence))).await.is_err() {
                                // Receiver dropped: the turn was cancelled
                                return;
                            }
                        }
                    }

                    if data
                        .get("done")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                    {
                        break;
                    }
                }
            }

            if let Some(rest) = splitter.finish() {
                if tx.send(Ok(parse_sentence(&rest))).await.is_err() {
                    return;
                }
            }
            if !full_response.is_empty() {
                debug!(chars = full_response.len(), "ollama reply complete");
                history
                    .lock()
                    .push(ChatMessage::new("assistant", full_response));
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn handle_interrupt(&self, heard_text: &str) {
        let mut history = self.history.lock();
        if !heard_text.is_empty() {
            history.push(ChatMessage::new("assistant", heard_text));
        }
        history.push(ChatMessage::new("user", INTERRUPT_MARKER));
    }
}
