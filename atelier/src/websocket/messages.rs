use serde::{Deserialize, Serialize};

use crate::feed::Partition;
use crate::models::input::{ChatRequestInput, SendMessageInput};
use crate::models::{ChatThread, UserKey};

/// WebSocket frames exchanged with the feed server (shared by both ends)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    // Client -> server
    #[serde(rename = "connect")]
    Connect {
        user_key: UserKey,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "fetch_thread")]
    FetchThread { request_id: u64, chat_id: String },
    #[serde(rename = "send_message")]
    SendMessage {
        request_id: u64,
        input: SendMessageInput,
    },
    #[serde(rename = "mark_read")]
    MarkRead { request_id: u64, chat_id: String },
    #[serde(rename = "request_chat")]
    RequestChat {
        request_id: u64,
        input: ChatRequestInput,
    },
    #[serde(rename = "support_chat")]
    SupportChat { request_id: u64 },
    #[serde(rename = "accept_chat")]
    AcceptChat {
        request_id: u64,
        chat_id: String,
        artist_id: String,
        client_user_key: UserKey,
    },

    // Server -> client
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "snapshot")]
    Snapshot {
        partition: Partition,
        threads: Vec<ChatThread>,
    },
    #[serde(rename = "thread")]
    Thread {
        request_id: u64,
        thread: Option<ChatThread>,
    },
    #[serde(rename = "chat_ready")]
    ChatReady { request_id: u64, chat_id: String },
    #[serde(rename = "accepted")]
    Accepted {
        request_id: u64,
        chat_id: String,
        accepted: bool,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        message: String,
    },
}

impl WsMessage {
    /// Id carried by a client request frame.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            WsMessage::FetchThread { request_id, .. }
            | WsMessage::SendMessage { request_id, .. }
            | WsMessage::MarkRead { request_id, .. }
            | WsMessage::RequestChat { request_id, .. }
            | WsMessage::SupportChat { request_id }
            | WsMessage::AcceptChat { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Id of the request this frame answers, if it is a reply.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            WsMessage::Thread { request_id, .. }
            | WsMessage::ChatReady { request_id, .. }
            | WsMessage::Accepted { request_id, .. } => Some(*request_id),
            WsMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}
