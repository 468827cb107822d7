//! Client Events
//!
//! Messages sent from clients to the server. Clients are thin: they forward
//! what the user typed or said, report playback progress, and request group
//! changes. The hub decides what to do with each event.
//!
//! Decoding is two-step so an unknown `type` can be told apart from a known
//! type with a bad body. Both are protocol errors the caller logs and ignores.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::messages::{Actions, DisplayText};
use crate::session::ClientId;

/// Events from client to server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    // ============================================
    // Conversation Triggers
    // ============================================
    /// User typed a message
    TextInput {
        /// The message
        text: String,
        /// Attached images, passed through to the generator
        #[serde(default)]
        images: Vec<ImageInput>,
    },

    /// Microphone samples to append to the session's audio buffer
    MicAudioData {
        /// Mono float samples in `[-1, 1]`
        audio: Vec<f32>,
    },

    /// Unsegmented microphone samples for server-side voice activity detection
    RawAudioData {
        /// Mono float samples in `[-1, 1]`
        audio: Vec<f32>,
    },

    /// The user finished speaking; converse over the buffered audio
    MicAudioEnd,

    /// Ask the character to speak without user input
    AiSpeakSignal,

    // ============================================
    // Interruption
    // ============================================
    /// Stop the current reply
    InterruptSignal {
        /// What the user heard before interrupting
        #[serde(default)]
        text: String,
    },

    // ============================================
    // Group Operations
    // ============================================
    /// Invite another client into the sender's group
    AddClientToGroup {
        /// Client to invite
        invitee_uid: ClientId,
    },

    /// Remove a client from the sender's group
    RemoveClientFromGroup {
        /// Client to remove
        target_uid: ClientId,
    },

    /// Ask for a fresh `group-update`
    RequestGroupInfo,

    // ============================================
    // Playback Feedback
    // ============================================
    /// Every payload of the turn finished playing
    FrontendPlaybackComplete,

    /// Playback of a payload started; relayed to the rest of the group
    AudioPlayStart {
        /// Text being shown
        #[serde(default)]
        display_text: Option<DisplayText>,
        /// Actions being played
        #[serde(default)]
        actions: Option<Actions>,
    },

    // ============================================
    // Connection
    // ============================================
    /// Keepalive
    Heartbeat,
}

impl ClientEvent {
    /// Every `type` value this server understands
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "text-input",
        "mic-audio-data",
        "raw-audio-data",
        "mic-audio-end",
        "ai-speak-signal",
        "interrupt-signal",
        "add-client-to-group",
        "remove-client-from-group",
        "request-group-info",
        "frontend-playback-complete",
        "audio-play-start",
        "heartbeat",
    ];

    /// Decode one inbound JSON text frame
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the text is not a JSON object with a
    /// known `type`, or the fields do not match that type.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// The wire `type` of this event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextInput { .. } => "text-input",
            Self::MicAudioData { .. } => "mic-audio-data",
            Self::RawAudioData { .. } => "raw-audio-data",
            Self::MicAudioEnd => "mic-audio-end",
            Self::AiSpeakSignal => "ai-speak-signal",
            Self::InterruptSignal { .. } => "interrupt-signal",
            Self::AddClientToGroup { .. } => "add-client-to-group",
            Self::RemoveClientFromGroup { .. } => "remove-client-from-group",
            Self::RequestGroupInfo => "request-group-info",
            Self::FrontendPlaybackComplete => "frontend-playback-complete",
            Self::AudioPlayStart { .. } => "audio-play-start",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// An image attached to a text input
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    /// Where the image came from (camera, screen, clipboard, upload)
    pub source: String,
    /// Data URL or base64 content
    pub data: String,
    /// MIME type of the data
    pub mime_type: String,
}
