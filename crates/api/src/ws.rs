//! One WebSocket connection backing one [`engine::Transport`], wired
//! directly into the process-wide [`engine::Registry`].
//!
//! Grounded on `axum`'s own `ws::WebSocketUpgrade` idiom (already a named
//! workspace dependency for "Web server"); this crate is the first body
//! written against it, so the handler shape follows axum's documented
//! split-socket pattern rather than any teacher precedent.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use engine::{Command, EngineConfig, Event, Registry, Transport};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<EngineConfig>,
    pub client: reqwest::Client,
}

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let transport = WebSocketTransport::spawn(socket);

    transport
        .send(Event::ServerInfo {
            implementation: "fluxdm-server".to_string(),
            features: vec!["chunked".to_string(), "resume".to_string(), "checksum".to_string()],
            chunks_supported: true,
        })
        .await;

    while let Some(command) = transport.recv().await {
        let registry = state.registry.clone();
        let client = state.client.clone();
        let config = state.config.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            registry.dispatch(command, transport, client, config).await;
        });
    }
}

/// A [`Transport`] backed by one live WebSocket: a reader task decodes
/// inbound text frames into [`Command`]s onto an internal channel, `send`
/// serializes outbound [`Event`]s straight onto the socket's sink behind a
/// lock (the Transport contract's single send-lock per connection).
struct WebSocketTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    commands_rx: Mutex<mpsc::UnboundedReceiver<Command>>,
}

impl WebSocketTransport {
    fn spawn(socket: WebSocket) -> Arc<Self> {
        let (sink, mut stream) = socket.split();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket read error, closing connection");
                        break;
                    }
                };

                match message {
                    Message::Text(text) => match serde_json::from_str::<Command>(&text) {
                        Ok(command) => {
                            if commands_tx.send(command).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping malformed command frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Arc::new(Self { sink: Mutex::new(sink), commands_rx: Mutex::new(commands_rx) })
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, event: Event) {
        let text = match serde_json::to_string(&event) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound event");
                return;
            }
        };
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Text(text)).await;
    }

    async fn recv(&self) -> Option<Command> {
        self.commands_rx.lock().await.recv().await
    }
}
