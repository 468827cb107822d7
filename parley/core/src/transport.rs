//! Outbound transport seam
//!
//! The core needs exactly one thing from a connection: "send this message to
//! that client". Framing, handshakes and sockets belong to whoever implements
//! [`MessageSink`]; the [`SessionRegistry`](crate::session::SessionRegistry)
//! does it over per-client channels.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::messages::ServerMessage;
use crate::session::ClientId;

/// Delivers messages to individual clients
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one message to one client
    ///
    /// Waits while the client's buffer is full; fails once the client is gone.
    async fn send(&self, client: &ClientId, message: ServerMessage) -> Result<(), TransportError>;
}
