use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::UserKey;

/// Capacity of the change channel; slow subscribers re-query after lagging
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Emitted after every committed write that touches a chat thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadChange {
    pub chat_id: String,
    pub client_user_key: UserKey,
    pub artist_user_key: Option<UserKey>,
}

impl ThreadChange {
    /// Whether either party of the changed thread is `user_key`.
    pub fn touches(&self, user_key: UserKey) -> bool {
        self.client_user_key == user_key || self.artist_user_key == Some(user_key)
    }
}

/// SQLite-backed thread store.
///
/// Stands in for the hosted document database: it owns the server clock and
/// pushes a [`ThreadChange`] for each committed thread write.
pub struct Database {
    conn: Mutex<Connection>,
    clock: AtomicI64,
    changes: broadcast::Sender<ThreadChange>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening thread store");
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;

        // Resume the clock after the newest stored write so restarts never go backwards
        let last_write: i64 = conn.query_row(
            "SELECT MAX(
                COALESCE((SELECT MAX(updated_at) FROM chats), 0),
                COALESCE((SELECT MAX(last_message_at) FROM chats), 0),
                COALESCE((SELECT MAX(client_last_read_at) FROM chats), 0),
                COALESCE((SELECT MAX(artist_last_read_at) FROM chats), 0),
                COALESCE((SELECT MAX(created_at) FROM messages), 0)
            )",
            [],
            |row| row.get(0),
        )?;
        debug!(last_write, "Thread store clock initialized");

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            conn: Mutex::new(conn),
            clock: AtomicI64::new(last_write),
            changes,
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Lock the connection for a write and stamp it with the server clock.
    ///
    /// The stamp is taken while the lock is held, so writes commit in
    /// timestamp order and `last_message_at` never moves backwards.
    pub(crate) fn lock_for_write(&self) -> Result<(MutexGuard<'_, Connection>, i64), StoreError> {
        let conn = self.lock()?;
        let now = self.server_timestamp();
        Ok((conn, now))
    }

    /// Server-assigned timestamp in milliseconds.
    ///
    /// Strictly increasing across calls, so a message written after a read
    /// marker always sorts after it even within the same millisecond.
    fn server_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Subscribe to committed thread writes.
    pub fn subscribe(&self) -> broadcast::Receiver<ThreadChange> {
        self.changes.subscribe()
    }

    pub(crate) fn notify(&self, change: ThreadChange) {
        debug!(chat_id = %change.chat_id, "Thread changed");
        // No receivers is fine: nobody is watching yet
        let _ = self.changes.send(change);
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- Chat threads, one per client/artist pair or support desk conversation
        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL,
            client_user_key INTEGER NOT NULL,
            artist_user_key INTEGER,
            status TEXT CHECK(status IN ('pending', 'active')) NOT NULL DEFAULT 'pending',
            last_message TEXT,
            last_message_at INTEGER,
            last_message_sender_role TEXT,
            client_last_read_at INTEGER,
            artist_last_read_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Messages table
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL REFERENCES chats(id),
            sender_id TEXT NOT NULL,
            sender_role TEXT CHECK(sender_role IN ('client', 'artist', 'system')) NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            text TEXT NOT NULL DEFAULT '',
            payload TEXT,
            created_at INTEGER NOT NULL
        );

        -- Reviews and the per-artist ratings counter
        CREATE TABLE IF NOT EXISTS reviews (
            id TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL,
            user_key INTEGER NOT NULL,
            rating INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artist_ratings (
            artist_id TEXT PRIMARY KEY,
            ratings INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_chats_client ON chats(client_user_key);
        CREATE INDEX IF NOT EXISTS idx_chats_artist ON chats(artist_user_key);
        CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id);
        CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
        CREATE INDEX IF NOT EXISTS idx_reviews_artist_id ON reviews(artist_id);
        ",
    )?;
    Ok(())
}
