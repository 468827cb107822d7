//! Daemon Server Implementation
//!
//! The server loop of the daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Spawns one handler task per connection, each with its own client ID
//! - Periodically prunes clients whose channel closed underneath them
//! - Shuts down gracefully, interrupting every running conversation
//!
//! ```text
//!                      DaemonServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!       browser A       browser B       browser C
//!       (client-1)      (client-2)      (client-3)
//!           │               │               │
//!           └───────────────┴───────────────┘
//!                           │
//!                    ConversationHub
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Instrument};

use parley_core::{ClientId, ConversationHub};

/// How often clients with a closed channel are cleaned up
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection bookkeeping, separate from the hub's session state
struct ConnectionState {
    /// Remote address
    peer: SocketAddr,
    /// When the connection was accepted
    connected_at: Instant,
    /// Handle to abort the connection task, set right after it is spawned
    abort_handle: Option<tokio::task::AbortHandle>,
}

/// The WebSocket server
pub struct DaemonServer {
    hub: ConversationHub,
    connections: Arc<DashMap<ClientId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a server around `hub`
    pub fn new(hub: ConversationHub) -> Self {
        Self {
            hub,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let bind = self.hub.config().server.bind.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind to {bind}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` resolves
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!(addr = %addr, "Listening for WebSocket connections");

        let hub = self.hub.clone();
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pruned = hub.prune_disconnected().await;
                if !pruned.is_empty() {
                    info!(count = pruned.len(), "Pruned disconnected clients");
                }
            }
        });

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let max_connections = self.hub.config().server.max_connections;
            if self.connections.len() >= max_connections {
                warn!(peer = %peer, max_connections, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let client = ClientId::generate();
            info!(
                client = %client,
                peer = %peer,
                active_connections = self.connections.len() + 1,
                "New connection accepted"
            );

            // Registered before the task exists so the handler's removal always wins
            self.connections.insert(
                client.clone(),
                ConnectionState {
                    peer,
                    connected_at: Instant::now(),
                    abort_handle: None,
                },
            );
            let task = tokio::spawn(
                Self::handle_connection(
                    client.clone(),
                    stream,
                    self.hub.clone(),
                    Arc::clone(&self.connections),
                )
                .instrument(tracing::info_span!("connection", client = %client)),
            );
            if let Some(mut state) = self.connections.get_mut(&client) {
                state.abort_handle = Some(task.abort_handle());
            }
        }

        pruner.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Serve one WebSocket client until it goes away
    async fn handle_connection(
        client: ClientId,
        stream: TcpStream,
        hub: ConversationHub,
        connections: Arc<DashMap<ClientId, ConnectionState>>,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                connections.remove(&client);
                return;
            }
        };

        let Some(mut outbound) = hub.open(client.clone()) else {
            warn!("Client ID already connected, dropping connection");
            connections.remove(&client);
            return;
        };

        let (mut sink, mut source) = ws.split();

        // Writer: session channel to text frames
        let writer = tokio::spawn(
            async move {
                while let Some(message) = outbound.recv().await {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "Write failed, stopping writer");
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        if let Err(e) = hub.greet(&client).await {
            warn!(error = %e, "Failed to greet client");
        }

        // Reader: text frames to the hub
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => hub.handle_message(&client, &text).await,
                Ok(Message::Close(_)) => {
                    info!("Client closed the connection");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    debug!(bytes = data.len(), "Ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    info!(error = %e, "Connection error");
                    break;
                }
            }
        }

        hub.disconnect(&client).await;
        writer.abort();

        if let Some((_, state)) = connections.remove(&client) {
            info!(
                peer = %state.peer,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                active_connections = connections.len(),
                "Connection handler finished"
            );
        }
    }

    /// Interrupt every conversation and abort every connection
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.hub.shutdown().await;

        let clients: Vec<ClientId> = self.connections.iter().map(|r| r.key().clone()).collect();
        for client in clients {
            if let Some((_, state)) = self.connections.remove(&client) {
                debug!(client = %client, peer = %state.peer, "Aborting connection");
                if let Some(handle) = state.abort_handle {
                    handle.abort();
                }
            }
        }

        info!("Shutdown complete");
    }

    /// Number of open connections
    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
