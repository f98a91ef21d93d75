use crate::coordinator::SessionCoordinator;
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::session::ConnectionId;
use crate::transport::{ChannelTransport, Directive};
use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use skyrelay_core::RelayConfig;
use skyrelay_store::OrderStore;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Relay server
pub struct RelayServer {
    config: RelayConfig,
    coordinator: Arc<SessionCoordinator>,
    /// Per-connection event and close queues
    transport: Arc<ChannelTransport>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, store: Arc<dyn OrderStore>) -> Self {
        let transport = Arc::new(ChannelTransport::new());
        let coordinator = Arc::new(SessionCoordinator::new(store, transport.clone()));

        Self {
            config,
            coordinator,
            transport,
        }
    }

    /// Get coordinator reference for inspection
    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        self.coordinator.clone()
    }

    pub async fn start(self) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", addr))?;
        tracing::info!("Relay server listening on {}", addr);

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until the task is dropped
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let coordinator = self.coordinator.clone();
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr.to_string(), coordinator, transport).await
                        {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

// Handle a WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: String,
    coordinator: Arc<SessionCoordinator>,
    transport: Arc<ChannelTransport>,
) -> Result<()> {
    // Upgrade to WebSocket
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;

    let id = ConnectionId::generate();
    let directives = transport.attach(id.clone()).await;
    coordinator.connect(id.clone()).await;
    tracing::info!("A user connected: {} from {}", id, addr);

    let outcome = pump(ws_stream, &id, &coordinator, directives).await;

    // Teardown runs however the loop ended
    transport.detach(&id).await;
    coordinator.disconnect(&id).await;
    tracing::info!("User disconnected: {}", id);

    outcome
}

async fn pump(
    ws_stream: WebSocketStream<TcpStream>,
    id: &ConnectionId,
    coordinator: &Arc<SessionCoordinator>,
    mut directives: mpsc::UnboundedReceiver<Directive>,
) -> Result<()> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split::<Message>();

    loop {
        tokio::select! {
            // Frames from the client
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received frame from {}: {}", id, text.as_str());
                        match serde_json::from_str::<ClientEvent>(text.as_str()) {
                            Ok(event) => coordinator.handle_event(id, event).await,
                            Err(e) => {
                                let error = ProtocolError::new(
                                    ProtocolError::INVALID_REQUEST,
                                    "Malformed event frame",
                                )
                                .with_details(json!({ "reason": e.to_string() }));
                                coordinator.reject(id, error).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // binary and control frames carry no events
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                }
            }

            // Broadcast and unicast events, plus forced close
            directive = directives.recv() => {
                match directive {
                    Some(Directive::Deliver(event)) => send_event(&mut ws_sender, &event).await?,
                    Some(Directive::Close) => {
                        tracing::info!("Closing connection {} on request", id);
                        // The peer may already be gone
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

async fn send_event(ws_sender: &mut WsSink, event: &ServerEvent) -> Result<()> {
    let frame = serde_json::to_string(event)?;
    ws_sender.send(Message::Text(frame.into())).await?;
    Ok(())
}
