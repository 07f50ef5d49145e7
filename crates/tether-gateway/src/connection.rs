//! Per-socket task
//!
//! Reads client frames and dispatches them; a separate writer task drains
//! the connection's outbound queue into the socket. Closing the socket (or
//! the registry closing the connection) cancels both halves and any
//! in-flight completion.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::protocol::{ClientMessage, ServerMessage, parse_client_message};
use crate::server::GatewayState;

pub async fn serve_socket(socket: WebSocket, connection_id: String, state: Arc<GatewayState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let handle = match state.registry.register(&connection_id, tx) {
        Ok(handle) => handle,
        Err(err) => {
            warn!("Refused connection '{}': {}", connection_id, err);
            let frame = ServerMessage::error(None, &err);
            let _ = sink.send(Message::Text(frame.to_json().into())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let queue = state.orchestrator.spawn_worker(handle.clone());

    let cancel = handle.cancel_token().clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => {
                        if sink.send(Message::Text(message.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            _ = handle.cancel_token().cancelled() => break,
            frame = stream.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                handle.send(ServerMessage::error(
                    None,
                    &GatewayError::InvalidRequest("binary frames are not supported".into()),
                ));
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Socket error on '{}': {}", handle.id(), e);
                break;
            }
        };

        match parse_client_message(text.as_str()) {
            Ok(ClientMessage::Ping) => {
                handle.send(ServerMessage::Pong);
            }
            Ok(ClientMessage::Authenticate { token }) => {
                if let Err(err) = state.bridge.deliver_token(handle.id(), &token, None).await {
                    debug!("Manual authentication on '{}' failed: {}", handle.id(), err);
                    handle.send(ServerMessage::error(None, &err));
                }
            }
            Ok(ClientMessage::Complete {
                request_id,
                request,
            }) => {
                if let Err(err) = queue.submit(request_id.clone(), request) {
                    handle.send(ServerMessage::error(Some(request_id), &err));
                }
            }
            Err((request_id, err)) => {
                handle.send(ServerMessage::error(request_id, &err));
            }
        }
    }

    state.registry.release(&handle);
    let _ = writer.await;
    info!("Connection '{}' finished", handle.id());
}
