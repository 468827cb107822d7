//! Playback acknowledgments
//!
//! After the last payload of a turn the server waits for the client to report
//! `frontend-playback-complete` before closing the turn. The waiter is
//! registered before `backend-synth-complete` goes out so a fast client cannot
//! answer before anyone listens.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::session::ClientId;

/// Outstanding playback waiters, one per client
#[derive(Clone, Debug, Default)]
pub struct PlaybackAcks {
    waiters: Arc<DashMap<ClientId, oneshot::Sender<()>>>,
}

/// A registered waiter
#[derive(Debug)]
pub struct PendingAck {
    client: ClientId,
    rx: oneshot::Receiver<()>,
}

impl PendingAck {
    /// Wait for the acknowledgment
    ///
    /// Returns false on timeout, or when a newer waiter replaced this one.
    pub async fn wait(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::debug!(client = %self.client, "Playback waiter superseded");
                false
            }
            Err(_) => {
                tracing::warn!(
                    client = %self.client,
                    timeout_secs = timeout.as_secs(),
                    "No playback completion received, continuing"
                );
                false
            }
        }
    }
}

impl PlaybackAcks {
    /// Create an empty set of waiters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `client`, replacing any earlier one
    pub fn expect(&self, client: &ClientId) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(client.clone(), tx);
        PendingAck {
            client: client.clone(),
            rx,
        }
    }

    /// Fire the client's waiter
    ///
    /// Returns false when nobody was waiting.
    pub fn resolve(&self, client: &ClientId) -> bool {
        match self.waiters.remove(client) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => {
                tracing::debug!(client = %client, "Playback completion without a waiter");
                false
            }
        }
    }

    /// Drop the client's waiter without firing it
    pub fn forget(&self, client: &ClientId) {
        self.waiters.remove(client);
    }

    /// Whether a waiter is registered for `client`
    #[must_use]
    pub fn is_pending(&self, client: &ClientId) -> bool {
        self.waiters.contains_key(client)
    }
}
