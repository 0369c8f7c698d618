use std::sync::Arc;

use atelier::commands::chat::{
    accept_chat_if_pending, create_chat_from_request, create_or_get_support_chat, get_thread,
    mark_chat_read,
};
use atelier::commands::message::send_chat_message;
use atelier::models::input::SendMessageInput;
use atelier::models::{ChatThread, SenderRole, UserKey};
use atelier::unread::viewer_role;
use atelier::utils::build_chat_id;
use atelier::{StoreError, WsMessage};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::state::ServerState;

/// Why a client frame was refused
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Not a participant of chat {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Wait for Connect message to authenticate
    let user_key = match wait_for_connect(&mut ws_receiver, state.access_token()).await {
        Ok(key) => key,
        Err(reason) => {
            warn!("Connection closed before authentication: {}", reason);
            let rejection = WsMessage::AuthResponse {
                success: false,
                message: reason,
            };
            if let Ok(json) = serde_json::to_string(&rejection) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!(user_key, "User connected");

    // Create channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let auth_response = WsMessage::AuthResponse {
        success: true,
        message: "Connected to feed server".to_string(),
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!(user_key, error = %e, "Failed to send auth response");
                return;
            }
        }
        Err(e) => {
            error!(user_key, error = %e, "Failed to serialize auth response");
            return;
        }
    }

    // Register before the first snapshot so no change can fall in between
    state.add_client(user_key, tx.clone());
    let snapshot_state = state.clone();
    match tokio::task::spawn_blocking(move || snapshot_state.snapshot_frames(user_key)).await {
        Ok(Ok(frames)) => {
            for frame in frames {
                let _ = tx.send(frame);
            }
        }
        Ok(Err(e)) => error!(user_key, error = %e, "Failed to build initial snapshots"),
        Err(e) => error!(user_key, error = %e, "Snapshot task panicked"),
    }

    // Spawn task to forward frames from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        // Store calls block on SQLite, keep them off the async workers
                        let handler_state = state.clone();
                        let reply = match tokio::task::spawn_blocking(move || {
                            handle_message(&text, user_key, &handler_state)
                        })
                        .await
                        {
                            Ok(reply) => reply,
                            Err(e) => {
                                error!(user_key, error = %e, "Frame handler panicked");
                                break;
                            }
                        };
                        if let Some(reply) = reply {
                            match serde_json::to_string(&reply) {
                                Ok(json) => {
                                    let _ = tx.send(json);
                                }
                                Err(e) => error!(user_key, error = %e, "Failed to serialize reply"),
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(user_key, "User sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(user_key, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        info!(user_key, "WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!(user_key, "Send task finished (likely connection lost)");
                break;
            }
        }
    }

    // Cleanup
    send_task.abort();
    state.remove_client(user_key, &tx);

    info!(user_key, "User disconnected");
}

/// Wait for the Connect message from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    expected_token: Option<&str>,
) -> Result<UserKey, String> {
    // Give client 10 seconds to authenticate
    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(result) = receiver.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::Connect { user_key, token }) => {
                    if let Some(expected) = expected_token {
                        match token.as_deref() {
                            Some(received) if received == expected => {}
                            Some(_) => {
                                warn!(user_key, "Authentication failed: invalid token");
                                return Err("Invalid token".to_string());
                            }
                            None => {
                                warn!(user_key, "Authentication failed: no token provided");
                                return Err("No token provided".to_string());
                            }
                        }
                    }
                    return Ok(user_key);
                }
                Ok(_) => debug!("Ignoring frame before authentication"),
                Err(e) => warn!(error = %e, "Failed to parse Connect message"),
            }
        }
        Err("Connection closed".to_string())
    });

    match timeout.await {
        Ok(result) => result,
        Err(_) => Err("Authentication timeout".to_string()),
    }
}

/// Handle a frame from an authenticated client and build the reply.
///
/// The connection's user key is the only identity that counts: sender ids,
/// roles and client keys claimed in the frame are overwritten or checked
/// against it.
pub fn handle_message(text: &str, user_key: UserKey, state: &ServerState) -> Option<WsMessage> {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(user_key, error = %e, "Failed to parse frame");
            return Some(WsMessage::Error {
                request_id: None,
                message: format!("Malformed frame: {}", e),
            });
        }
    };

    let request_id = msg.request_id();
    let result = match msg {
        WsMessage::FetchThread { request_id, chat_id } => {
            participant_thread(state, user_key, &chat_id)
                .map(|thread| WsMessage::Thread { request_id, thread })
        }
        WsMessage::SendMessage { request_id, input } => {
            send_message(state, user_key, input)
                .map(|chat_id| WsMessage::ChatReady { request_id, chat_id })
        }
        WsMessage::MarkRead { request_id, chat_id } => {
            mark_read(state, user_key, &chat_id)
                .map(|()| WsMessage::ChatReady { request_id, chat_id })
        }
        WsMessage::RequestChat { request_id, mut input } => {
            input.client_user_key = user_key;
            create_chat_from_request(state.db(), input)
                .map(|chat_id| WsMessage::ChatReady { request_id, chat_id })
                .map_err(HandlerError::from)
        }
        WsMessage::SupportChat { request_id } => create_or_get_support_chat(state.db(), user_key)
            .map(|chat_id| WsMessage::ChatReady { request_id, chat_id })
            .map_err(HandlerError::from),
        WsMessage::AcceptChat {
            request_id,
            chat_id,
            artist_id,
            client_user_key,
        } => accept_chat(state, user_key, &chat_id, &artist_id, client_user_key).map(|accepted| {
            WsMessage::Accepted {
                request_id,
                chat_id,
                accepted,
            }
        }),
        WsMessage::Connect { .. } => {
            // Already authenticated, ignore
            return None;
        }
        other => {
            debug!(user_key, frame = ?other, "Ignoring server-only frame from client");
            return None;
        }
    };

    match result {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(user_key, ?request_id, error = %e, "Request refused");
            Some(WsMessage::Error {
                request_id,
                message: e.to_string(),
            })
        }
    }
}

fn participant_thread(
    state: &ServerState,
    user_key: UserKey,
    chat_id: &str,
) -> Result<Option<ChatThread>, HandlerError> {
    match get_thread(state.db(), chat_id)? {
        Some(thread) if !thread.involves(user_key) => {
            Err(HandlerError::Forbidden(chat_id.to_string()))
        }
        thread => Ok(thread),
    }
}

fn send_message(
    state: &ServerState,
    user_key: UserKey,
    mut input: SendMessageInput,
) -> Result<String, HandlerError> {
    input.sender_id = user_key.to_string();

    match participant_thread(state, user_key, &input.chat_id)? {
        Some(thread) => {
            let role = viewer_role(&thread, user_key);
            input.sender_role = role;
            input.artist_id = thread.artist_id;
            input.client_user_key = thread.client_user_key;
            input.artist_user_key = match role {
                SenderRole::Artist => Some(user_key),
                _ => None,
            };
        }
        None => {
            // Only the client can open a conversation by messaging
            let artist_user_key = input.artist_user_key.ok_or_else(|| {
                HandlerError::Invalid("artist_user_key is required to start a chat".to_string())
            })?;
            if input.chat_id != build_chat_id(artist_user_key, user_key) {
                return Err(HandlerError::Invalid(format!(
                    "chat id {} does not belong to artist {} and client {}",
                    input.chat_id, artist_user_key, user_key
                )));
            }
            input.client_user_key = user_key;
            input.sender_role = SenderRole::Client;
        }
    }

    let chat_id = input.chat_id.clone();
    send_chat_message(state.db(), input)?;
    Ok(chat_id)
}

fn mark_read(state: &ServerState, user_key: UserKey, chat_id: &str) -> Result<(), HandlerError> {
    let thread = participant_thread(state, user_key, chat_id)?
        .ok_or_else(|| HandlerError::Store(StoreError::ChatNotFound(chat_id.to_string())))?;
    mark_chat_read(state.db(), chat_id, viewer_role(&thread, user_key))?;
    Ok(())
}

fn accept_chat(
    state: &ServerState,
    user_key: UserKey,
    chat_id: &str,
    artist_id: &str,
    client_user_key: UserKey,
) -> Result<bool, HandlerError> {
    if chat_id != build_chat_id(user_key, client_user_key) {
        return Err(HandlerError::Forbidden(chat_id.to_string()));
    }
    participant_thread(state, user_key, chat_id)?;
    Ok(accept_chat_if_pending(
        state.db(),
        chat_id,
        artist_id,
        Some(user_key),
        client_user_key,
    )?)
}
