//! WebSocket transport for the relay.
//!
//! Each accepted socket becomes one relay connection. A reader task decodes
//! client frames and forwards them to the relay; a writer task drains the
//! connection's outbox into text frames. When either side finishes, the
//! other is aborted and the relay is told about the disconnect exactly once.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use babble_proto::client::ClientEvent;
use babble_proto::codec;
use babble_proto::event::ChatEvent;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::config::RelayConfig;
use crate::registry::ConnectionId;
use crate::relay::{Relay, RelayClosed, RelayHandle};

/// Default maximum inbound WebSocket frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default number of broadcasts buffered per connection.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 256;

/// Shared server state handed to every socket.
#[derive(Debug, Clone)]
pub struct ServerState {
    relay: RelayHandle,
    send_queue_size: usize,
    max_frame_size: usize,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerState {
    /// Spawns the relay task and builds server state from a resolved config.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            relay: Relay::spawn(config.inbound_queue_size),
            send_queue_size: config.send_queue_size,
            max_frame_size: config.max_frame_size,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Handle to the relay task.
    #[must_use]
    pub const fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    /// Asks every open socket to close and stops accepting new ones.
    pub fn shutdown(&self) {
        tracing::info!("relay server shutting down");
        self.shutdown.send_replace(true);
    }

    /// Resolves once [`ServerState::shutdown`] has been called.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|down| *down).await;
        }
    }
}

/// Builds the axum router serving the relay at `/ws`.
pub fn router(state: ServerState) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}

/// Starts the relay server with default settings on the given address and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, ServerState::from_config(&RelayConfig::default())).await
}

/// Starts the relay server with a pre-configured [`ServerState`].
///
/// The server stops accepting connections once [`ServerState::shutdown`] is
/// called and the returned task finishes when open sockets have closed.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: ServerState,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let shutdown = state.shutdown_signal();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
        tracing::info!("relay server stopped");
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drives one WebSocket from accept to close.
///
/// 1. Register with the relay and get a connection id.
/// 2. Spawn the writer (outbox to socket) and reader (socket to relay).
/// 3. Wait for either to finish, abort the other.
/// 4. Report the disconnect.
pub async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<ChatEvent>>(state.send_queue_size);

    let id = match state.relay.connect(tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "relay unavailable, dropping connection");
            return;
        }
    };
    tracing::info!(conn = %id, "connection accepted");

    let shutdown = state.shutdown_signal();
    let mut write_task = tokio::spawn(async move {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = send_event(&mut ws_sender, &event).await {
                        tracing::warn!(conn = %id, error = %e, "WebSocket write failed");
                        break;
                    }
                }
                () = &mut shutdown => {
                    tracing::debug!(conn = %id, "sending close frame for shutdown");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_relay = state.relay.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(conn = %id, error = %e, "WebSocket read failed");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    if handle_text_frame(id, text.as_str(), &reader_relay)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Close(_) => {
                    tracing::debug!(conn = %id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if let Err(e) = state.relay.disconnect(id).await {
        tracing::warn!(conn = %id, error = %e, "could not report disconnect");
    }
    tracing::info!(conn = %id, "connection finished");
}

/// Decodes one client frame and forwards it to the relay.
///
/// Undecodable frames are logged and skipped.
async fn handle_text_frame(
    id: ConnectionId,
    text: &str,
    relay: &RelayHandle,
) -> Result<(), RelayClosed> {
    match codec::decode_client(text) {
        Ok(ClientEvent::Join { name }) => relay.join(id, name).await,
        Ok(ClientEvent::Message { content }) => relay.message(id, content).await,
        Err(e) => {
            tracing::warn!(conn = %id, error = %e, "failed to decode client event");
            Ok(())
        }
    }
}

/// Encodes and sends a chat event directly on a WebSocket sender.
async fn send_event(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &ChatEvent,
) -> Result<(), String> {
    let text = codec::encode_event(event).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port).
#[cfg(test)]
async fn start_test_server() -> (std::net::SocketAddr, ServerState) {
    let state = ServerState::from_config(&RelayConfig::default());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state.clone())
        .await
        .expect("failed to start test server");
    (addr, state)
}
