use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::messages::WsMessage;
use crate::config::ClientConfig;
use crate::error::FeedError;
use crate::feed::{Partition, ThreadSource, ThreadStream};
use crate::models::input::{ChatRequestInput, SendMessageInput};
use crate::models::{ChatThread, UserKey};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingReplies = DashMap<u64, oneshot::Sender<WsMessage>>;

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

/// Thread source backed by a feed server connection.
///
/// One connection serves a single authenticated user. Partition snapshots
/// pushed by the server are fanned out to every subscriber; when the
/// connection drops, all subscriptions end.
pub struct RemoteThreadSource {
    user_key: UserKey,
    write_tx: mpsc::UnboundedSender<WriteMessage>,
    client_rx: watch::Receiver<Option<Vec<ChatThread>>>,
    artist_rx: watch::Receiver<Option<Vec<ChatThread>>>,
    pending: Arc<PendingReplies>,
    next_request: AtomicU64,
    io_task: JoinHandle<()>,
}

impl RemoteThreadSource {
    /// Connect and authenticate as `user_key`.
    pub async fn connect(config: &ClientConfig, user_key: UserKey) -> Result<Self, FeedError> {
        info!(url = %config.server_url, user_key, "Connecting to feed server");

        let (ws_stream, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let connect_msg = WsMessage::Connect {
            user_key,
            token: config.access_token.clone(),
        };
        let connect_json =
            serde_json::to_string(&connect_msg).map_err(|e| FeedError::Protocol(e.to_string()))?;
        ws_write
            .send(Message::Text(connect_json.into()))
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;

        // Wait for auth response
        let response = tokio::time::timeout(AUTH_TIMEOUT, async {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Ok(text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(FeedError::Connection(e.to_string())),
                }
            }
            Err(FeedError::Closed)
        })
        .await
        .map_err(|_| FeedError::Connection("authentication timed out".to_string()))??;

        match serde_json::from_str::<WsMessage>(&response) {
            Ok(WsMessage::AuthResponse { success: true, message }) => {
                info!(user_key, "Authenticated with feed server: {}", message);
            }
            Ok(WsMessage::AuthResponse { message, .. }) => {
                error!(user_key, "Authentication failed: {}", message);
                return Err(FeedError::Rejected(message));
            }
            Ok(other) => {
                return Err(FeedError::Protocol(format!(
                    "unexpected frame during auth: {:?}",
                    other
                )));
            }
            Err(e) => return Err(FeedError::Protocol(e.to_string())),
        }

        let (client_tx, client_rx) = watch::channel(None);
        let (artist_tx, artist_rx) = watch::channel(None);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteMessage>();
        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());

        let task_pending = pending.clone();
        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = write_rx.recv() => match outgoing {
                        Some(WriteMessage::Data(data)) => {
                            if ws_write.send(Message::Text(data.into())).await.is_err() {
                                error!("Failed to send frame to feed server");
                                break;
                            }
                        }
                        Some(WriteMessage::Close) | None => {
                            if let Err(e) = ws_write.send(Message::Close(None)).await {
                                warn!(error = %e, "Failed to send close frame");
                            }
                            break;
                        }
                    },
                    incoming = ws_read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            dispatch(&text, &client_tx, &artist_tx, &task_pending);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Feed server closed connection");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Feed connection error");
                            break;
                        }
                        _ => {}
                    },
                }
            }

            // Dropping the senders ends every partition stream and fails pending requests
            task_pending.clear();
            info!("Disconnected from feed server");
        });

        Ok(Self {
            user_key,
            write_tx,
            client_rx,
            artist_rx,
            pending,
            next_request: AtomicU64::new(1),
            io_task,
        })
    }

    pub fn user_key(&self) -> UserKey {
        self.user_key
    }

    pub fn is_connected(&self) -> bool {
        !self.io_task.is_finished()
    }

    /// Close the connection gracefully.
    pub fn disconnect(&self) {
        info!(user_key = self.user_key, "Disconnecting from feed server");
        let _ = self.write_tx.send(WriteMessage::Close);
    }

    /// Send a message as the connected user. Returns the chat id.
    pub async fn send_message(&self, input: SendMessageInput) -> Result<String, FeedError> {
        let reply = self
            .request(|request_id| WsMessage::SendMessage { request_id, input })
            .await?;
        expect_chat_ready(reply)
    }

    /// Mark a chat read for the connected user's side.
    pub async fn mark_read(&self, chat_id: &str) -> Result<(), FeedError> {
        let chat_id = chat_id.to_string();
        let reply = self
            .request(|request_id| WsMessage::MarkRead { request_id, chat_id })
            .await?;
        expect_chat_ready(reply).map(|_| ())
    }

    /// Deliver a request form, creating the chat when needed. Returns the chat id.
    pub async fn request_chat(&self, input: ChatRequestInput) -> Result<String, FeedError> {
        let reply = self
            .request(|request_id| WsMessage::RequestChat { request_id, input })
            .await?;
        expect_chat_ready(reply)
    }

    /// Open (or create) the connected user's support chat. Returns the chat id.
    pub async fn support_chat(&self) -> Result<String, FeedError> {
        let reply = self
            .request(|request_id| WsMessage::SupportChat { request_id })
            .await?;
        expect_chat_ready(reply)
    }

    /// Accept a pending chat as its artist. Returns whether the status changed.
    pub async fn accept_chat(
        &self,
        chat_id: &str,
        artist_id: &str,
        client_user_key: UserKey,
    ) -> Result<bool, FeedError> {
        let chat_id = chat_id.to_string();
        let artist_id = artist_id.to_string();
        let reply = self
            .request(|request_id| WsMessage::AcceptChat {
                request_id,
                chat_id,
                artist_id,
                client_user_key,
            })
            .await?;
        match reply {
            WsMessage::Accepted { accepted, .. } => Ok(accepted),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> WsMessage) -> Result<WsMessage, FeedError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&build(request_id))
            .map_err(|e| FeedError::Protocol(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, reply_tx);

        if self.write_tx.send(WriteMessage::Data(frame)).is_err() {
            self.pending.remove(&request_id);
            return Err(FeedError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(WsMessage::Error { message, .. })) => Err(FeedError::Rejected(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FeedError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(FeedError::Connection(format!(
                    "request {} timed out",
                    request_id
                )))
            }
        }
    }

    fn partition_stream(&self, viewer: UserKey, partition: Partition) -> ThreadStream {
        if viewer != self.user_key {
            let connected = self.user_key;
            return Box::pin(futures_util::stream::once(async move {
                Err(FeedError::Rejected(format!(
                    "connection belongs to user {}, not {}",
                    connected, viewer
                )))
            }));
        }

        let mut rx = match partition {
            Partition::Client => self.client_rx.clone(),
            Partition::Artist => self.artist_rx.clone(),
        };

        Box::pin(async_stream::stream! {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(threads) = current {
                    yield Ok(threads);
                }
                if rx.changed().await.is_err() {
                    debug!(viewer, ?partition, "Partition feed closed");
                    break;
                }
            }
        })
    }
}

impl Drop for RemoteThreadSource {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

/// Route one server frame to a partition or a pending request.
fn dispatch(
    text: &str,
    client_tx: &watch::Sender<Option<Vec<ChatThread>>>,
    artist_tx: &watch::Sender<Option<Vec<ChatThread>>>,
    pending: &PendingReplies,
) {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Failed to parse frame from feed server");
            return;
        }
    };

    if let Some(request_id) = msg.reply_to() {
        match pending.remove(&request_id) {
            Some((_, reply_tx)) => {
                let _ = reply_tx.send(msg);
            }
            None => debug!(request_id, "Reply for unknown or expired request"),
        }
        return;
    }

    match msg {
        WsMessage::Snapshot { partition, threads } => {
            debug!(?partition, count = threads.len(), "Partition snapshot received");
            let target = match partition {
                Partition::Client => client_tx,
                Partition::Artist => artist_tx,
            };
            target.send_replace(Some(threads));
        }
        WsMessage::Error { message, .. } => warn!("Feed server error: {}", message),
        other => debug!(frame = ?other, "Ignoring unexpected frame"),
    }
}

fn expect_chat_ready(reply: WsMessage) -> Result<String, FeedError> {
    match reply {
        WsMessage::ChatReady { chat_id, .. } => Ok(chat_id),
        other => Err(unexpected_reply(other)),
    }
}

fn unexpected_reply(reply: WsMessage) -> FeedError {
    FeedError::Protocol(format!("unexpected reply: {:?}", reply))
}

#[async_trait]
impl ThreadSource for RemoteThreadSource {
    fn subscribe_client(&self, viewer: UserKey) -> ThreadStream {
        self.partition_stream(viewer, Partition::Client)
    }

    fn subscribe_artist(&self, viewer: UserKey) -> ThreadStream {
        self.partition_stream(viewer, Partition::Artist)
    }

    async fn fetch_thread(&self, chat_id: &str) -> Result<Option<ChatThread>, FeedError> {
        let chat_id = chat_id.to_string();
        let reply = self
            .request(|request_id| WsMessage::FetchThread { request_id, chat_id })
            .await?;
        match reply {
            WsMessage::Thread { thread, .. } => Ok(thread),
            other => Err(unexpected_reply(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        watch::Sender<Option<Vec<ChatThread>>>,
        watch::Sender<Option<Vec<ChatThread>>>,
        PendingReplies,
    ) {
        let (client_tx, _) = watch::channel(None);
        let (artist_tx, _) = watch::channel(None);
        (client_tx, artist_tx, DashMap::new())
    }

    #[test]
    fn test_dispatch_routes_snapshot_to_partition() {
        let (client_tx, artist_tx, pending) = channels();
        dispatch(
            r#"{"type":"snapshot","partition":"artist","threads":[]}"#,
            &client_tx,
            &artist_tx,
            &pending,
        );
        assert!(client_tx.borrow().is_none());
        assert_eq!(artist_tx.borrow().as_ref().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_request() {
        let (client_tx, artist_tx, pending) = channels();
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.insert(3, reply_tx);

        dispatch(
            r#"{"type":"chat_ready","request_id":3,"chat_id":"dev__5"}"#,
            &client_tx,
            &artist_tx,
            &pending,
        );

        assert!(pending.is_empty());
        let reply = reply_rx.await.unwrap();
        assert_eq!(expect_chat_ready(reply).unwrap(), "dev__5");
    }

    #[test]
    fn test_dispatch_ignores_garbage() {
        let (client_tx, artist_tx, pending) = channels();
        dispatch("not json", &client_tx, &artist_tx, &pending);
        assert!(client_tx.borrow().is_none());
        assert!(artist_tx.borrow().is_none());
    }
}
