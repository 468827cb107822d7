//! Session Registry - Per-Client Connection State
//!
//! Every connected client owns one [`Session`]: its outbound channel, the
//! provider bindings cloned for it at connect time, a raw-audio accumulation
//! buffer, its voice activity segmenter, and a count of completed turns.
//!
//! # Architecture
//!
//! ```text
//!                      SessionRegistry
//!                     ┌───────────────────────────────────┐
//!                     │ HashMap<ClientId, Session>        │
//!                     │   - wrapped in Arc<RwLock<>>      │
//!                     └───────────────┬───────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │  client a   │       │  client b    │       │  client c    │
//!       │ tx, context │       │ tx, context  │       │ tx, context  │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Thread Safety
//!
//! The lock is never held across an `.await`. Sends clone the target senders
//! under a read lock and deliver outside it, so a broadcast works on the
//! membership snapshot it started with.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::CharacterConfig;
use crate::error::TransportError;
use crate::messages::ServerMessage;
use crate::providers::ProviderSet;
use crate::transport::MessageSink;
use crate::vad::{VadEvent, VoiceActivitySegmenter};

/// Unique identifier for a client
///
/// Assigned when the connection is accepted and stable for its lifetime.
/// Clients share it with each other to send group invitations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session configuration and engine bindings
///
/// Cloned from the service defaults when a client connects; backends are
/// chosen here once and never re-selected.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// Character speaking for this session
    pub character: CharacterConfig,
    /// Recognizer, generator and synthesizer for this session
    pub providers: ProviderSet,
}

impl SessionContext {
    /// Bundle a character with its providers
    #[must_use]
    pub fn new(character: CharacterConfig, providers: ProviderSet) -> Self {
        Self {
            character,
            providers,
        }
    }
}

/// State owned by one connected client
pub struct Session {
    /// Client identifier
    pub id: ClientId,
    /// Channel to the client's writer task
    tx: mpsc::Sender<ServerMessage>,
    /// Configuration and engines for this client
    context: SessionContext,
    /// Microphone samples accumulated since the last `mic-audio-end`
    audio: Vec<f32>,
    /// Segmenter for server-side voice activity detection
    vad: VoiceActivitySegmenter,
    /// Completed turns so far
    history_cursor: u64,
    /// When the client connected
    connected_at: Instant,
}

impl Session {
    /// Create a session
    #[must_use]
    pub fn new(
        id: ClientId,
        tx: mpsc::Sender<ServerMessage>,
        context: SessionContext,
        vad: VoiceActivitySegmenter,
    ) -> Self {
        Self {
            id,
            tx,
            context,
            audio: Vec::new(),
            vad,
            history_cursor: 0,
            connected_at: Instant::now(),
        }
    }

    /// Check if the client's channel is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Get the connection uptime in seconds
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("buffered_samples", &self.audio.len())
            .field("history_cursor", &self.history_cursor)
            .field("vad", &self.vad.state())
            .finish_non_exhaustive()
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of clients that received the message
    pub successful: usize,
    /// Number of clients that could not be reached
    pub failed: usize,
    /// IDs of clients that could not be reached
    pub failed_ids: Vec<ClientId>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Registry of connected clients
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    /// Inner map of client ID to session
    inner: Arc<RwLock<HashMap<ClientId, Session>>>,
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session
    ///
    /// Returns false (and keeps the existing session) if the ID is taken.
    pub fn register(&self, session: Session) -> bool {
        let id = session.id.clone();
        let mut inner = self.inner.write();
        if inner.contains_key(&id) {
            tracing::warn!(client = %id, "Duplicate client registration rejected");
            return false;
        }
        inner.insert(id.clone(), session);
        tracing::info!(client = %id, "Session registered");
        true
    }

    /// Unregister a session, returning its context
    pub fn unregister(&self, id: &ClientId) -> Option<SessionContext> {
        let session = self.inner.write().remove(id);
        if let Some(ref session) = session {
            tracing::info!(
                client = %id,
                uptime_secs = session.uptime_secs(),
                turns = session.history_cursor,
                "Session unregistered"
            );
        }
        session.map(|s| s.context)
    }

    /// Get the number of connected clients
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a client is registered
    #[must_use]
    pub fn contains(&self, id: &ClientId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Get the IDs of all connected clients
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Get a client's session context
    #[must_use]
    pub fn context(&self, id: &ClientId) -> Option<SessionContext> {
        self.inner.read().get(id).map(|s| s.context.clone())
    }

    /// Append microphone samples to a client's buffer
    ///
    /// Returns the buffer length afterwards, or `None` for an unknown client.
    pub fn append_audio(&self, id: &ClientId, samples: &[f32]) -> Option<usize> {
        let mut inner = self.inner.write();
        let session = inner.get_mut(id)?;
        session.audio.extend_from_slice(samples);
        Some(session.audio.len())
    }

    /// Take a client's buffered samples, leaving the buffer empty
    pub fn take_audio(&self, id: &ClientId) -> Vec<f32> {
        self.inner
            .write()
            .get_mut(id)
            .map(|s| std::mem::take(&mut s.audio))
            .unwrap_or_default()
    }

    /// Run raw samples through a client's voice activity segmenter
    pub fn feed_raw_audio(&self, id: &ClientId, samples: &[f32]) -> Vec<VadEvent> {
        self.inner
            .write()
            .get_mut(id)
            .map(|s| s.vad.push_samples(samples))
            .unwrap_or_default()
    }

    /// Record a completed turn, returning the new count
    pub fn advance_history(&self, id: &ClientId) -> Option<u64> {
        let mut inner = self.inner.write();
        let session = inner.get_mut(id)?;
        session.history_cursor += 1;
        Some(session.history_cursor)
    }

    /// Completed turns for a client
    #[must_use]
    pub fn history_cursor(&self, id: &ClientId) -> Option<u64> {
        self.inner.read().get(id).map(|s| s.history_cursor)
    }

    /// Send a message to one client
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] if the client is unknown or its channel closed.
    pub async fn send_to(&self, id: &ClientId, message: ServerMessage) -> Result<(), TransportError> {
        // Get the sender outside of the lock to avoid holding it during async
        let tx = {
            let inner = self.inner.read();
            inner.get(id).map(|s| s.tx.clone())
        };

        let Some(tx) = tx else {
            tracing::debug!(client = %id, "Attempted to send to unknown client");
            return Err(TransportError::Closed(id.clone()));
        };
        tx.send(message)
            .await
            .map_err(|_| TransportError::Closed(id.clone()))
    }

    /// Send without waiting for buffer space
    ///
    /// # Errors
    ///
    /// [`TransportError::Full`] when the buffer is full, [`TransportError::Closed`]
    /// when the client is gone.
    pub fn try_send_to(&self, id: &ClientId, message: ServerMessage) -> Result<(), TransportError> {
        let inner = self.inner.read();
        let session = inner
            .get(id)
            .ok_or_else(|| TransportError::Closed(id.clone()))?;
        session.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full(id.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(id.clone()),
        })
    }

    /// Send a message to every listed client except `exclude`
    ///
    /// The target senders are captured before the first send, so membership
    /// changes made while the broadcast runs only affect later broadcasts.
    pub async fn broadcast(
        &self,
        members: &[ClientId],
        message: ServerMessage,
        exclude: Option<&ClientId>,
    ) -> BroadcastResult {
        // Collect handles to avoid holding the lock during async operations
        let targets: Vec<(ClientId, Option<mpsc::Sender<ServerMessage>>)> = {
            let inner = self.inner.read();
            members
                .iter()
                .filter(|m| Some(*m) != exclude)
                .map(|m| (m.clone(), inner.get(m).map(|s| s.tx.clone())))
                .collect()
        };

        let mut result = BroadcastResult::default();
        for (id, tx) in targets {
            let delivered = match tx {
                Some(tx) => tx.send(message.clone()).await.is_ok(),
                None => false,
            };
            if delivered {
                result.successful += 1;
            } else {
                tracing::debug!(client = %id, "Broadcast target unreachable");
                result.failed += 1;
                result.failed_ids.push(id);
            }
        }
        result
    }

    /// Remove sessions whose channels have closed
    ///
    /// Returns the IDs removed.
    pub fn cleanup_disconnected(&self) -> Vec<ClientId> {
        let mut inner = self.inner.write();
        let closed: Vec<ClientId> = inner
            .iter()
            .filter(|(_, s)| !s.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &closed {
            inner.remove(id);
            tracing::info!(client = %id, "Removed disconnected session");
        }
        closed
    }
}

#[async_trait]
impl MessageSink for SessionRegistry {
    async fn send(&self, client: &ClientId, message: ServerMessage) -> Result<(), TransportError> {
        self.send_to(client, message).await
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SessionRegistry")
            .field("count", &inner.len())
            .field("clients", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}
