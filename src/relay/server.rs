//! HTTP surface: the `/ws` control channel and `/health`.
//!
//! Each WebSocket gets its own [`Dispatcher`]. Outbound events are funneled
//! through a bounded queue into a writer task, so engine tasks never hold the
//! socket.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::{Data, Json};
use poem::{Endpoint, EndpointExt, IntoResponse, Route, get, handler, middleware::Tracing};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::dispatcher::Relay;
use super::protocol::ServerEvent;

/// Outbound events buffered per channel before producers wait
const OUTBOUND_QUEUE: usize = 256;

/// Build the relay's HTTP application.
pub fn app(relay: Arc<Relay>) -> impl Endpoint {
    Route::new()
        .at("/ws", get(control_channel))
        .at("/health", get(health))
        .data(relay)
        .with(Tracing)
}

#[handler]
fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[handler]
fn control_channel(ws: WebSocket, relay: Data<&Arc<Relay>>) -> impl IntoResponse {
    let relay = relay.0.clone();
    ws.on_upgrade(move |socket| serve_channel(socket, relay))
}

/// Serialize an event as one text frame.
fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize outbound event: {}", e);
            None
        }
    }
}

async fn serve_channel(socket: WebSocketStream, relay: Arc<Relay>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let dispatcher = relay.open_channel(tx);
    let closing = CancellationToken::new();

    let writer_closing = closing.clone();
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = writer_closing.cancelled() => {
                    // Flush what is already queued, such as a framing error
                    while let Ok(event) = rx.try_recv() {
                        if let Some(text) = encode(&event) {
                            let _ = ws_sink.send(Message::Text(text)).await;
                        }
                    }
                    break;
                }
            };
            let Some(text) = encode(&event) else { continue };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !dispatcher.handle_text(&text).await {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                dispatcher.reject_frame("binary frames are not supported").await;
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Control channel {} read error: {}", dispatcher.channel_id(), e);
                break;
            }
        }
    }

    dispatcher.close().await;
    closing.cancel();
    if let Err(e) = writer.await {
        debug!("Writer task for channel {} ended abnormally: {}", dispatcher.channel_id(), e);
    }
}
