//! Turn Pipeline
//!
//! One request/response cycle: announce the turn, turn the input into text,
//! stream the generator's reply through an [`OrderedDeliveryQueue`], then
//! close the turn on the client once playback has finished (or the wait for it
//! timed out).
//!
//! The same steps serve one-on-one conversations and each member's slot in a
//! group rotation; group turns additionally mirror status messages to the
//! other members.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::acks::PlaybackAcks;
use crate::delivery::{DeliveryReport, OrderedDeliveryQueue};
use crate::error::{TransportError, TurnError};
use crate::events::ImageInput;
use crate::messages::{ControlSignal, ServerMessage};
use crate::providers::{ConversationInput, GeneratorOutput};
use crate::scheduler::TaskContext;
use crate::session::{ClientId, SessionContext, SessionRegistry};
use crate::transport::MessageSink;

/// Status line sent before a reply the user did not ask for
pub const PROACTIVE_NOTICE: &str = "AI wants to speak something...";

/// What started a conversation
#[derive(Clone, Debug, PartialEq)]
pub enum TurnInput {
    /// Typed text, possibly with images
    Text {
        /// The message
        text: String,
        /// Attached images
        images: Vec<ImageInput>,
    },
    /// Microphone samples to transcribe
    Audio(Vec<f32>),
    /// The AI speaks without user input
    Proactive,
}

impl TurnInput {
    /// Text-only input
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Images attached to the input
    #[must_use]
    pub fn images(&self) -> Vec<ImageInput> {
        match self {
            Self::Text { images, .. } => images.clone(),
            Self::Audio(_) | Self::Proactive => Vec::new(),
        }
    }
}

/// Runs turns against the session registry
#[derive(Clone, Debug)]
pub struct TurnRunner {
    sessions: SessionRegistry,
    acks: PlaybackAcks,
    playback_timeout: Duration,
}

impl TurnRunner {
    /// Create a runner
    #[must_use]
    pub fn new(sessions: SessionRegistry, acks: PlaybackAcks, playback_timeout: Duration) -> Self {
        Self {
            sessions,
            acks,
            playback_timeout,
        }
    }

    /// Session registry the runner sends through
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Body of a one-on-one conversation
    ///
    /// A failure is reported to the client before it is returned.
    pub async fn run_single(
        self,
        client: ClientId,
        input: TurnInput,
        task: TaskContext,
    ) -> Result<(), TurnError> {
        let result = self.single_turn(&client, input, &task).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                tracing::warn!(client = %client, error = %e, "Conversation failed");
                let _ = self
                    .sessions
                    .send_to(&client, ServerMessage::error(format!("Conversation error: {e}")))
                    .await;
            }
        }
        result
    }

    async fn single_turn(
        &self,
        client: &ClientId,
        input: TurnInput,
        task: &TaskContext,
    ) -> Result<(), TurnError> {
        let context = self.session_context(client)?;
        let images = input.images();

        if input == TurnInput::Proactive {
            self.sessions
                .send_to(client, ServerMessage::full_text(PROACTIVE_NOTICE))
                .await?;
        }
        self.announce(client, &[]).await?;

        let text = self.resolve_input(client, &context, input, &[]).await?;
        tracing::info!(client = %client, input = %text, images = images.len(), "User input");

        let conversation = ConversationInput {
            text,
            from_name: context.character.human_name.clone(),
            images,
        };
        let (reply, report) = self.speak(client, &context, conversation, task).await?;
        self.finalize(client, &[], report).await?;

        let turns = self.sessions.advance_history(client);
        tracing::info!(client = %client, reply = %reply, turns, "Conversation turn completed");
        Ok(())
    }

    /// A registered client's context
    pub(crate) fn session_context(&self, client: &ClientId) -> Result<SessionContext, TurnError> {
        self.sessions
            .context(client)
            .ok_or_else(|| TransportError::Closed(client.clone()).into())
    }

    /// Send `conversation-chain-start` and "Thinking..."
    ///
    /// An empty `group` sends to `speaker` alone; otherwise to every member.
    pub(crate) async fn announce(
        &self,
        speaker: &ClientId,
        group: &[ClientId],
    ) -> Result<(), TurnError> {
        let start = ServerMessage::control(ControlSignal::ConversationChainStart);
        let thinking = ServerMessage::full_text("Thinking...");
        if group.is_empty() {
            self.sessions.send_to(speaker, start).await?;
            self.sessions.send_to(speaker, thinking).await?;
        } else {
            self.sessions.broadcast(group, start, None).await;
            self.sessions.broadcast(group, thinking, None).await;
        }
        Ok(())
    }

    /// Turn the input into conversation text
    ///
    /// Audio is transcribed and the transcription echoed to the speaker. In a
    /// group (`group` not empty) the text is also shown to the other members.
    pub(crate) async fn resolve_input(
        &self,
        speaker: &ClientId,
        context: &SessionContext,
        input: TurnInput,
        group: &[ClientId],
    ) -> Result<String, TurnError> {
        let text = match input {
            TurnInput::Text { text, .. } => text,
            TurnInput::Proactive => return Ok(String::new()),
            TurnInput::Audio(samples) => {
                tracing::info!(client = %speaker, samples = samples.len(), "Transcribing audio input");
                let text = context.providers.recognizer.transcribe(&samples).await?;
                self.sessions
                    .send_to(speaker, ServerMessage::UserInputTranscription { text: text.clone() })
                    .await?;
                text
            }
        };

        if !group.is_empty() {
            self.sessions
                .broadcast(
                    group,
                    ServerMessage::UserInputTranscription { text: text.clone() },
                    Some(speaker),
                )
                .await;
        }
        Ok(text)
    }

    /// Stream the speaker's reply to its own connection
    ///
    /// Returns the reply text and what the delivery queue did.
    pub(crate) async fn speak(
        &self,
        speaker: &ClientId,
        context: &SessionContext,
        input: ConversationInput,
        task: &TaskContext,
    ) -> Result<(String, DeliveryReport), TurnError> {
        let sink: Arc<dyn MessageSink> = Arc::new(self.sessions.clone());
        let mut queue = OrderedDeliveryQueue::new(
            speaker.clone(),
            sink,
            Arc::clone(&context.providers.synthesizer),
            task,
        )
        .with_speaker(context.character.name.clone(), context.character.avatar.clone());

        let mut stream = context.providers.generator.respond(input).await?;
        let mut reply = String::new();

        while let Some(output) = stream.next().await {
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    // Deliver what was already said before giving up
                    queue.finish().await?;
                    return Err(e.into());
                }
            };

            let said = output.reply_text();
            if !said.is_empty() {
                if !reply.is_empty() {
                    reply.push(' ');
                }
                reply.push_str(said);
            }

            match output {
                GeneratorOutput::Sentence {
                    display,
                    tts_text,
                    actions,
                } => {
                    queue.speak(display, tts_text, actions);
                }
                GeneratorOutput::Audio {
                    audio,
                    display,
                    actions,
                    ..
                } => {
                    queue.push_ready(audio, display, actions);
                }
            }
        }

        let report = queue.finish().await?;
        tracing::debug!(
            client = %speaker,
            submitted = report.submitted,
            delivered = report.delivered,
            "Reply delivered"
        );
        Ok((reply, report))
    }

    /// Close the turn on the speaker's client
    ///
    /// When payloads were sent, announce `backend-synth-complete` and wait
    /// (bounded) for the client to finish playing them. `others` receive the
    /// closing messages too.
    pub(crate) async fn finalize(
        &self,
        speaker: &ClientId,
        others: &[ClientId],
        report: DeliveryReport,
    ) -> Result<(), TurnError> {
        if report.had_work() {
            let pending = self.acks.expect(speaker);
            self.sessions
                .send_to(speaker, ServerMessage::BackendSynthComplete)
                .await?;
            if !pending.wait(self.playback_timeout).await {
                tracing::debug!(client = %speaker, "Finalizing turn without playback confirmation");
            }
        }

        for message in [
            ServerMessage::ForceNewMessage,
            ServerMessage::control(ControlSignal::ConversationChainEnd),
        ] {
            self.sessions.send_to(speaker, message.clone()).await?;
            if !others.is_empty() {
                self.sessions.broadcast(others, message, Some(speaker)).await;
            }
        }
        Ok(())
    }
}
