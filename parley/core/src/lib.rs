//! Parley Core - Real-Time Conversation Scheduling for AI Personas
//!
//! This crate holds everything between a client's decoded events and the
//! messages sent back: who may talk when, how replies reach the client in
//! order, and how a group of clients takes turns with their characters. It is
//! transport independent; the daemon crate puts it behind WebSockets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Transport (daemon)                         │
//! │            text frame in ──▶            ◀── ServerMessage out     │
//! └───────────────────────────┬──────────────────────────────────────┘
//!                             │ ClientEvent
//! ┌───────────────────────────┼──────────────────────────────────────┐
//! │                      PARLEY CORE                                  │
//! │  ┌────────────────────────┴─────────────────────────────────────┐ │
//! │  │                    ConversationHub                            │ │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────────┐ ┌─────────────┐   │ │
//! │  │  │ Sessions │ │  Groups  │ │  Scheduler   │ │ PlaybackAcks│   │ │
//! │  │  └──────────┘ └──────────┘ └──────┬───────┘ └─────────────┘   │ │
//! │  └───────────────────────────────────┼───────────────────────────┘ │
//! │                     ┌────────────────┴────────────────┐            │
//! │                     ▼                                 ▼            │
//! │               TurnRunner                   GroupTurnCoordinator    │
//! │                     └──────────▶ OrderedDeliveryQueue ◀──┘         │
//! │                                        │                           │
//! │          Recognizer / Generator / Synthesizer (providers)          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ConversationHub`]: Routes client events and owns all registries
//! - [`ConversationScheduler`]: At most one running conversation per key
//! - [`OrderedDeliveryQueue`]: Synthesizes concurrently, delivers in order
//! - [`GroupRegistry`]: Group membership and ownership
//! - [`GroupTurnCoordinator`]: Round-robin turn-taking inside a group
//!
//! # Quick Start
//!
//! ```ignore
//! use parley_core::{ClientId, ConversationHub, ParleyConfig};
//!
//! let hub = ConversationHub::new(ParleyConfig::default());
//! let id = ClientId::generate();
//! let mut outbound = hub.open(id.clone()).expect("fresh id");
//! tokio::spawn(async move {
//!     while let Some(msg) = outbound.recv().await {
//!         // write msg.to_json() to the socket
//!     }
//! });
//! hub.greet(&id).await?;
//! hub.handle_message(&id, r#"{"type": "text-input", "text": "Hello"}"#).await;
//! ```
//!
//! # Module Overview
//!
//! - [`acks`]: Waiting for the client to finish playback
//! - [`config`]: TOML, environment and CLI configuration
//! - [`delivery`]: Ordered per-sentence delivery
//! - [`events`]: Messages from clients
//! - [`group_turn`]: Group conversation state and rotation
//! - [`groups`]: Group membership registry
//! - [`hub`]: Event routing
//! - [`messages`]: Messages to clients
//! - [`providers`]: Recognizer, generator and synthesizer backends
//! - [`scheduler`]: Conversation task ownership and cancellation
//! - [`session`]: Connected clients and their per-session state
//! - [`transport`]: Outbound message sink abstraction
//! - [`turn`]: One reply turn, end to end
//! - [`vad`]: Voice activity segmentation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acks;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod group_turn;
pub mod groups;
pub mod hub;
pub mod messages;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod turn;
pub mod vad;

// Re-exports for convenience
pub use hub::ConversationHub;
pub use events::{ClientEvent, ImageInput};
pub use messages::{Actions, AudioPayload, ControlSignal, DisplayText, ServerMessage};
pub use session::{BroadcastResult, ClientId, Session, SessionContext, SessionRegistry};
pub use transport::MessageSink;

// Error exports
pub use error::{GroupError, ProtocolError, ProviderError, TransportError, TurnError};

// Scheduling exports
pub use acks::{PendingAck, PlaybackAcks};
pub use scheduler::{ConversationScheduler, StartOutcome, TaskContext, TaskKey};

// Conversation exports
pub use delivery::{DeliveryReport, OrderedDeliveryQueue, ReorderBuffer};
pub use turn::{TurnInput, TurnRunner, PROACTIVE_NOTICE};

// Group exports
pub use group_turn::{
    ActiveGroupGuard, ActiveGroupStates, GroupConversationState, GroupTurnCoordinator, MemberTurn,
};
pub use groups::{Group, GroupId, GroupRegistry, MembershipChange};

// Provider exports
pub use providers::{
    Generator, GeneratorOutput, ProviderFactory, ProviderSet, Recognizer, Synthesizer,
};
pub use vad::{EnergyClassifier, SpeechClassifier, VadConfig, VadEvent, VoiceActivitySegmenter};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    ParleyConfig,
};
