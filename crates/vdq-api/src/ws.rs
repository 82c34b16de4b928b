//! Progress subscription socket.
//!
//! The client registers once with `{"type":"register_client","client_id":"…"}`
//! and then receives every `ProgressMessage` addressed to that id until it
//! disconnects.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use vdq_models::ProgressMessage;

use crate::metrics;
use crate::state::AppState;

static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

const WS_SEND_BUFFER_SIZE: usize = 32;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WS_REGISTER_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CLIENT_ID_LEN: usize = 128;

/// Messages a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterClient {
        #[serde(alias = "clientId")]
        client_id: String,
    },
}

impl ClientMessage {
    /// Parse a registration frame, rejecting blank or oversized ids.
    pub fn parse_registration(text: &str) -> Result<String, String> {
        let message = serde_json::from_str::<ClientMessage>(text)
            .map_err(|e| format!("Invalid message: {}", e))?;
        let ClientMessage::RegisterClient { client_id } = message;

        let client_id = client_id.trim();
        if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
            return Err("client_id must be 1-128 characters".to_string());
        }
        Ok(client_id.to_string())
    }
}

fn message_type(message: &ProgressMessage) -> &'static str {
    match message {
        ProgressMessage::Downloading { .. } => "downloading",
        ProgressMessage::Finished => "finished",
        ProgressMessage::Completed { .. } => "completed",
        ProgressMessage::Failed { .. } => "failed",
    }
}

fn error_frame(message: impl Into<String>) -> Message {
    let body = serde_json::json!({ "type": "error", "message": message.into() });
    Message::Text(body.to_string())
}

/// `GET /ws`.
pub async fn ws_progress(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_ws_active_connections(count);
    metrics::record_ws_connection();

    ws.on_upgrade(|socket| async move {
        handle_progress_socket(socket, state).await;
        let count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_ws_active_connections(count);
    })
}

async fn read_registration(receiver: &mut SplitStream<WebSocket>) -> Result<String, String> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => return ClientMessage::parse_registration(&text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err("Connection closed".to_string()),
            Some(Ok(_)) => return Err("Expected a JSON text frame".to_string()),
            Some(Err(e)) => return Err(e.to_string()),
        }
    }
}

async fn handle_progress_socket(socket: WebSocket, state: AppState) {
    let (ws_sender, mut receiver) = socket.split();

    // Bounded channel so a slow client cannot grow memory without limit
    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);
    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let client_id =
        match tokio::time::timeout(WS_REGISTER_TIMEOUT, read_registration(&mut receiver)).await {
            Ok(Ok(client_id)) => client_id,
            Ok(Err(e)) => {
                debug!("Registration failed: {}", e);
                let _ = tx.send(error_frame(e)).await;
                drop(tx);
                let _ = send_task.await;
                return;
            }
            Err(_) => {
                let _ = tx.send(error_frame("Registration timed out")).await;
                drop(tx);
                let _ = send_task.await;
                return;
            }
        };

    info!(client_id = %client_id, "Client registered");

    match state.progress.subscribe(&client_id).await {
        Ok(mut stream) => {
            let mut heartbeat = interval(WS_HEARTBEAT_INTERVAL);
            let mut last_activity = Instant::now();

            loop {
                tokio::select! {
                    message = stream.next() => {
                        let Some(message) = message else {
                            warn!(client_id = %client_id, "Progress stream ended");
                            break;
                        };
                        last_activity = Instant::now();

                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to encode progress message: {}", e);
                                continue;
                            }
                        };
                        metrics::record_ws_message_sent(message_type(&message));
                        if tx.send(Message::Text(json)).await.is_err() {
                            debug!(client_id = %client_id, "Client gone");
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if last_activity.elapsed() > WS_HEARTBEAT_INTERVAL / 2
                            && tx.send(Message::Ping(Vec::new())).await.is_err()
                        {
                            break;
                        }
                    }
                    client_msg = receiver.next() => {
                        match client_msg {
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => last_activity = Instant::now(),
                        }
                    }
                }
            }
        }
        Err(e) => {
            warn!(client_id = %client_id, "Failed to subscribe to progress: {}", e);
            let _ = tx.send(error_frame("Progress relay unavailable")).await;
        }
    }

    drop(tx);
    let _ = send_task.await;
    info!(client_id = %client_id, "Progress socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registration() {
        assert_eq!(
            ClientMessage::parse_registration(r#"{"type":"register_client","client_id":"abc"}"#),
            Ok("abc".to_string())
        );
        assert_eq!(
            ClientMessage::parse_registration(r#"{"type":"register_client","clientId":" abc "}"#),
            Ok("abc".to_string())
        );
    }

    #[test]
    fn test_parse_registration_rejects_bad_frames() {
        assert!(ClientMessage::parse_registration("not json").is_err());
        let wrong_type = r#"{"type":"subscribe","client_id":"a"}"#;
        let blank_id = r#"{"type":"register_client","client_id":"  "}"#;
        assert!(ClientMessage::parse_registration(wrong_type).is_err());
        assert!(ClientMessage::parse_registration(blank_id).is_err());

        let long = format!(r#"{{"type":"register_client","client_id":"{}"}}"#, "x".repeat(129));
        assert!(ClientMessage::parse_registration(&long).is_err());
    }

    #[test]
    fn test_message_type_matches_wire_tag() {
        let message = ProgressMessage::completed("k.mp4", None);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], message_type(&message));
    }
}
