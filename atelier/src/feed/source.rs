use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::commands::chat::{get_thread, threads_for_artist, threads_for_client};
use crate::db::Database;
use crate::error::FeedError;
use crate::models::{ChatThread, UserKey};

/// Which side of the viewer's chats a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Chats where the viewer is the client
    Client,
    /// Chats where the viewer is the artist
    Artist,
}

/// Live partition updates. Each item is the full current partition.
pub type ThreadStream = Pin<Box<dyn Stream<Item = Result<Vec<ChatThread>, FeedError>> + Send>>;

/// Where the chat feed gets its threads from.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    /// Subscribe to chats where `viewer` is the client.
    fn subscribe_client(&self, viewer: UserKey) -> ThreadStream;

    /// Subscribe to chats where `viewer` is the artist.
    fn subscribe_artist(&self, viewer: UserKey) -> ThreadStream;

    /// One-shot lookup of a single thread.
    async fn fetch_thread(&self, chat_id: &str) -> Result<Option<ChatThread>, FeedError>;
}

/// Thread source reading straight from a local [`Database`].
#[derive(Clone)]
pub struct LocalThreadSource {
    db: Arc<Database>,
}

impl LocalThreadSource {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn partition_stream(&self, viewer: UserKey, partition: Partition) -> ThreadStream {
        let db = self.db.clone();
        // Subscribe before the first query so no write can slip between the two
        let mut changes = db.subscribe();

        Box::pin(async_stream::stream! {
            yield query_partition(&db, viewer, partition);

            loop {
                match changes.recv().await {
                    Ok(change) if change.touches(viewer) => {
                        yield query_partition(&db, viewer, partition);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(viewer, ?partition, skipped, "Change feed lagged, re-querying");
                        yield query_partition(&db, viewer, partition);
                    }
                    Err(RecvError::Closed) => {
                        debug!(viewer, ?partition, "Change feed closed");
                        break;
                    }
                }
            }
        })
    }
}

fn query_partition(
    db: &Database,
    viewer: UserKey,
    partition: Partition,
) -> Result<Vec<ChatThread>, FeedError> {
    let threads = match partition {
        Partition::Client => threads_for_client(db, viewer)?,
        Partition::Artist => threads_for_artist(db, viewer)?,
    };
    Ok(threads)
}

#[async_trait]
impl ThreadSource for LocalThreadSource {
    fn subscribe_client(&self, viewer: UserKey) -> ThreadStream {
        self.partition_stream(viewer, Partition::Client)
    }

    fn subscribe_artist(&self, viewer: UserKey) -> ThreadStream {
        self.partition_stream(viewer, Partition::Artist)
    }

    async fn fetch_thread(&self, chat_id: &str) -> Result<Option<ChatThread>, FeedError> {
        Ok(get_thread(&self.db, chat_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::chat::create_or_get_support_chat;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_local_stream_yields_initial_partition() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        create_or_get_support_chat(&db, 8).unwrap();
        let source = LocalThreadSource::new(db);

        let mut stream = source.subscribe_client(8);
        let first = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "dev__8");
    }

    #[tokio::test]
    async fn test_local_stream_ignores_unrelated_changes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let source = LocalThreadSource::new(db.clone());

        let mut stream = source.subscribe_client(8);
        let initial = stream.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        create_or_get_support_chat(&db, 9).unwrap();
        assert!(timeout(Duration::from_millis(100), stream.next()).await.is_err());

        create_or_get_support_chat(&db, 8).unwrap();
        let updated = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(updated.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing_thread_is_none() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let source = LocalThreadSource::new(db);
        assert!(source.fetch_thread("dev__1").await.unwrap().is_none());
    }
}
