use std::sync::Arc;

use atelier::commands::chat::{threads_for_artist, threads_for_client};
use atelier::models::UserKey;
use atelier::{Database, Partition, StoreError, ThreadChange, WsMessage};
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server state: connected clients plus the thread store they read from
pub struct ServerState {
    /// user_key -> list of sender channels (supports multiple connections per user)
    pub clients: DashMap<UserKey, Vec<mpsc::UnboundedSender<String>>>,
    db: Arc<Database>,
    access_token: Option<String>,
}

impl ServerState {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            clients: DashMap::new(),
            db,
            access_token: None,
        }
    }

    /// Require this token in every `connect` frame. Empty tokens disable the check.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Register a new client connection (supports multiple connections per user)
    pub fn add_client(&self, user_key: UserKey, tx: mpsc::UnboundedSender<String>) {
        self.clients
            .entry(user_key)
            .or_insert_with(Vec::new)
            .push(tx);
    }

    /// Unregister one connection of a user, and the user once none are left.
    /// Channels that closed on their own are swept too.
    pub fn remove_client(&self, user_key: UserKey, tx: &mpsc::UnboundedSender<String>) {
        if let Some(mut entry) = self.clients.get_mut(&user_key) {
            entry.retain(|c| !c.same_channel(tx) && !c.is_closed());
            if entry.is_empty() {
                drop(entry);
                self.clients.remove(&user_key);
            }
        }
    }

    /// Send a frame to every connection of a user
    pub fn send_to_user(&self, user_key: UserKey, message: &str) -> bool {
        match self.clients.get(&user_key) {
            Some(channels) => {
                let mut sent = false;
                for tx in channels.iter() {
                    if tx.send(message.to_string()).is_ok() {
                        sent = true;
                    }
                }
                sent
            }
            None => false,
        }
    }

    pub fn is_online(&self, user_key: UserKey) -> bool {
        self.clients
            .get(&user_key)
            .map(|channels| !channels.is_empty())
            .unwrap_or(false)
    }

    pub fn online_users(&self) -> Vec<UserKey> {
        self.clients
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect()
    }

    /// Both partition snapshots of a user, serialized.
    pub fn snapshot_frames(&self, user_key: UserKey) -> Result<Vec<String>, StoreError> {
        let client = WsMessage::Snapshot {
            partition: Partition::Client,
            threads: threads_for_client(&self.db, user_key)?,
        };
        let artist = WsMessage::Snapshot {
            partition: Partition::Artist,
            threads: threads_for_artist(&self.db, user_key)?,
        };
        Ok(vec![
            serde_json::to_string(&client)?,
            serde_json::to_string(&artist)?,
        ])
    }

    /// Push fresh partition snapshots to every connection of a user.
    pub fn push_snapshots(&self, user_key: UserKey) {
        if !self.is_online(user_key) {
            return;
        }
        match self.snapshot_frames(user_key) {
            Ok(frames) => {
                for frame in frames {
                    self.send_to_user(user_key, &frame);
                }
            }
            Err(e) => error!(user_key, error = %e, "Failed to build thread snapshots"),
        }
    }

    fn push_change(&self, change: &ThreadChange) {
        debug!(chat_id = %change.chat_id, "Relaying thread change");
        self.push_snapshots(change.client_user_key);
        if let Some(artist) = change.artist_user_key {
            if artist != change.client_user_key {
                self.push_snapshots(artist);
            }
        }
    }

    /// Forward every committed thread write to both parties' connections.
    pub fn spawn_change_relay(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let mut changes = state.db.subscribe();

        tokio::spawn(async move {
            loop {
                let relay_state = state.clone();
                // Snapshot queries block on SQLite
                let pushed = match changes.recv().await {
                    Ok(change) => {
                        tokio::task::spawn_blocking(move || relay_state.push_change(&change)).await
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change relay lagged, refreshing all online users");
                        tokio::task::spawn_blocking(move || {
                            for user_key in relay_state.online_users() {
                                relay_state.push_snapshots(user_key);
                            }
                        })
                        .await
                    }
                    Err(RecvError::Closed) => {
                        info!("Thread store closed, stopping change relay");
                        break;
                    }
                };
                if let Err(e) = pushed {
                    error!(error = %e, "Snapshot push panicked");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier::commands::chat::create_or_get_support_chat;

    fn state() -> ServerState {
        ServerState::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_remove_client_drops_closed_channels() {
        let state = state();
        let (tx, rx) = mpsc::unbounded_channel();
        let (other_tx, other_rx) = mpsc::unbounded_channel();
        state.add_client(5, tx);
        state.add_client(5, other_tx.clone());

        drop(rx);
        state.remove_client(5, &other_tx);
        assert!(!state.is_online(5));
        assert!(state.online_users().is_empty());
        drop(other_rx);
    }

    #[test]
    fn test_remove_client_unregisters_open_channel() {
        let state = state();
        let (first_tx, _first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        state.add_client(5, first_tx.clone());
        state.add_client(5, second_tx.clone());

        // Receivers are still alive, as with a send task that has not wound down yet
        state.remove_client(5, &first_tx);
        assert!(state.is_online(5));
        assert_eq!(state.clients.get(&5).map(|c| c.len()), Some(1));

        state.remove_client(5, &second_tx);
        assert!(!state.is_online(5));
        assert!(state.clients.get(&5).is_none());
    }

    #[test]
    fn test_empty_access_token_disables_check() {
        let state = state().with_access_token(Some(String::new()));
        assert!(state.access_token().is_none());
    }

    #[tokio::test]
    async fn test_relay_pushes_to_both_parties() {
        let state = Arc::new(state());
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (admin_tx, mut admin_rx) = mpsc::unbounded_channel();
        state.add_client(9, client_tx);
        state.add_client(atelier::utils::SUPPORT_ADMIN_USER_KEY, admin_tx);
        let relay = state.spawn_change_relay();

        create_or_get_support_chat(state.db(), 9).unwrap();

        for rx in [&mut client_rx, &mut admin_rx] {
            let first: WsMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert!(matches!(first, WsMessage::Snapshot { partition: Partition::Client, .. }));
            let second: WsMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert!(matches!(second, WsMessage::Snapshot { partition: Partition::Artist, .. }));
        }

        relay.abort();
    }
}
