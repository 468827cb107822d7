//! Server Messages
//!
//! Messages sent from the server to connected clients. Every message is a flat
//! JSON object discriminated by its `type` field, for example:
//!
//! ```json
//! {"type": "group-update", "members": ["a", "b"], "is_owner": true}
//! {"type": "control", "text": "conversation-chain-start"}
//! ```
//!
//! Audio payloads carry display text and animation actions alongside the
//! (optional) audio so a client can render a sentence even when synthesis was
//! skipped or failed.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::session::ClientId;

/// Messages from server to client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    // ============================================
    // Conversation Messages
    // ============================================
    /// Plain status text shown in the client's subtitle area
    FullText {
        /// Text to display
        text: String,
    },

    /// Identity and character bound to this connection
    SetModelAndConf {
        /// The id other clients use to invite this one
        client_uid: ClientId,
        /// Character speaking for this session
        character_name: String,
        /// Avatar image reference, if configured
        avatar: Option<String>,
    },

    /// What the recognizer heard
    UserInputTranscription {
        /// Transcribed text
        text: String,
    },

    /// Conversation flow signal
    Control {
        /// Which signal
        text: ControlSignal,
    },

    /// Start a new message bubble on the client
    ForceNewMessage,

    /// Every payload for the current turn has been sent
    BackendSynthComplete,

    /// One sentence of a reply: audio plus display metadata
    Audio(AudioPayload),

    /// Something went wrong serving this client
    Error {
        /// Human readable description
        message: String,
    },

    /// The conversation was interrupted
    InterruptSignal {
        /// Always `conversation-interrupted` when sent by the server
        text: String,
    },

    // ============================================
    // Group Messages
    // ============================================
    /// Current group membership as seen by the receiver
    GroupUpdate {
        /// Every member of the receiver's group (empty when ungrouped)
        members: Vec<ClientId>,
        /// Whether the receiver owns the group
        is_owner: bool,
    },

    /// Outcome of a group operation
    GroupOperationResult {
        /// Whether the operation was applied
        success: bool,
        /// Human readable outcome
        message: String,
    },

    // ============================================
    // Connection Messages
    // ============================================
    /// Reply to a client heartbeat
    HeartbeatAck,
}

impl ServerMessage {
    /// Shorthand for a control signal
    #[must_use]
    pub fn control(signal: ControlSignal) -> Self {
        Self::Control { text: signal }
    }

    /// Shorthand for an error message
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Shorthand for a full-text status line
    #[must_use]
    pub fn full_text(text: impl Into<String>) -> Self {
        Self::FullText { text: text.into() }
    }

    /// Shorthand for a group operation result
    #[must_use]
    pub fn group_result(success: bool, message: impl Into<String>) -> Self {
        Self::GroupOperationResult {
            success,
            message: message.into(),
        }
    }

    /// The interruption notice broadcast after a task is cancelled
    #[must_use]
    pub fn interrupted() -> Self {
        Self::InterruptSignal {
            text: "conversation-interrupted".to_string(),
        }
    }

    /// Serialize to the JSON text sent over the wire
    ///
    /// # Errors
    ///
    /// Only fails if a float in an audio payload is not finite.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Values of the `control` message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlSignal {
    /// The client may open its microphone
    StartMic,
    /// Speech onset detected, stop playback
    Interrupt,
    /// A speech segment was captured, the client should send `mic-audio-end`
    MicAudioEnd,
    /// A reply is starting
    ConversationChainStart,
    /// A reply has finished
    ConversationChainEnd,
}

/// Text shown alongside a reply sentence
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayText {
    /// The sentence as displayed
    pub text: String,
    /// Speaker name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Speaker avatar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl DisplayText {
    /// Display text without speaker attribution
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: None,
            avatar: None,
        }
    }

    /// Attach speaker name and avatar
    #[must_use]
    pub fn with_speaker(mut self, name: impl Into<String>, avatar: Option<String>) -> Self {
        self.name = Some(name.into());
        self.avatar = avatar;
        self
    }
}

/// Animation actions accompanying a sentence
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actions {
    /// Expression names for the avatar
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expressions: Vec<String>,
    /// Pictures to show
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pictures: Vec<String>,
    /// Sound effects to play
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sounds: Vec<String>,
}

impl Actions {
    /// True when no action is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty() && self.pictures.is_empty() && self.sounds.is_empty()
    }
}

/// One sentence of a reply as delivered to the client
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    /// Base64 encoded audio, `None` for a silent payload
    pub audio: Option<String>,
    /// Per-slice volume envelope for lip sync
    #[serde(default)]
    pub volumes: Vec<f32>,
    /// Length of one volume slice in milliseconds
    #[serde(default)]
    pub slice_length: u32,
    /// Text to show while this payload plays
    pub display_text: Option<DisplayText>,
    /// Actions to run while this payload plays
    pub actions: Option<Actions>,
    /// Set when the payload was relayed from another group member
    #[serde(default)]
    pub forwarded: bool,
}

impl AudioPayload {
    /// A payload that carries only display metadata
    #[must_use]
    pub fn silent(display_text: Option<DisplayText>, actions: Option<Actions>) -> Self {
        Self {
            audio: None,
            volumes: Vec::new(),
            slice_length: 0,
            display_text,
            actions: actions.filter(|a| !a.is_empty()),
            forwarded: false,
        }
    }

    /// A payload with rendered audio
    #[must_use]
    pub fn with_audio(
        bytes: &[u8],
        volumes: Vec<f32>,
        slice_length: u32,
        display_text: Option<DisplayText>,
        actions: Option<Actions>,
    ) -> Self {
        Self {
            audio: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            volumes,
            slice_length,
            display_text,
            actions: actions.filter(|a| !a.is_empty()),
            forwarded: false,
        }
    }

    /// Mark as relayed from another member
    #[must_use]
    pub fn forwarded(mut self) -> Self {
        self.forwarded = true;
        self
    }

    /// True when there is no audio to play
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.audio.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_control_wire_shape() {
        let msg = ServerMessage::control(ControlSignal::ConversationChainStart);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "control", "text": "conversation-chain-start"})
        );
    }

    #[test]
    fn test_unit_messages_are_flat() {
        let value = serde_json::to_value(ServerMessage::BackendSynthComplete).unwrap();
        assert_eq!(value, json!({"type": "backend-synth-complete"}));

        let value = serde_json::to_value(ServerMessage::ForceNewMessage).unwrap();
        assert_eq!(value, json!({"type": "force-new-message"}));
    }

    #[test]
    fn test_group_update_wire_shape() {
        let msg = ServerMessage::GroupUpdate {
            members: vec![ClientId::from("a"), ClientId::from("b")],
            is_owner: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "group-update", "members": ["a", "b"], "is_owner": true})
        );
    }

    #[test]
    fn test_silent_audio_payload_shape() {
        let payload = AudioPayload::silent(Some(DisplayText::new("Hi.")), Some(Actions::default()));
        assert!(payload.is_silent());
        // Empty actions collapse to null
        assert!(payload.actions.is_none());

        let value = serde_json::to_value(ServerMessage::Audio(payload)).unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["audio"], serde_json::Value::Null);
        assert_eq!(value["display_text"]["text"], "Hi.");
        assert_eq!(value["forwarded"], false);
    }

    #[test]
    fn test_audio_payload_is_base64() {
        let payload = AudioPayload::with_audio(b"RIFF", vec![0.5], 20, None, None);
        assert_eq!(payload.audio.as_deref(), Some("UklGRg=="));
        assert!(!payload.is_silent());
        assert!(payload.forwarded().forwarded);
    }

    #[test]
    fn test_interrupted_notice() {
        let value = serde_json::to_value(ServerMessage::interrupted()).unwrap();
        assert_eq!(
            value,
            json!({"type": "interrupt-signal", "text": "conversation-interrupted"})
        );
    }
}
