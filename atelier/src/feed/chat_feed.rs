use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::source::ThreadSource;
use crate::models::{ChatThread, UserKey};
use crate::unread::{compute_unread, merge_partitions, UnreadSignal};
use crate::utils::support_chat_id;

/// What the chat feed currently shows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedSnapshot {
    /// Bumped every time the viewer changes.
    pub session: u64,
    pub viewer: Option<UserKey>,
    /// Merged and deduplicated threads, most recent activity first.
    pub threads: Vec<ChatThread>,
    pub signal: UnreadSignal,
}

struct FeedSession {
    viewer: UserKey,
    task: JoinHandle<()>,
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Live, deduplicated view of the viewer's chats plus the unread badge.
///
/// Keeps one background task per viewer session. The task is aborted when the
/// viewer changes or the feed is dropped, and every publication is fenced by
/// the session number so a stale task can never overwrite a newer viewer.
pub struct ChatFeed {
    source: Arc<dyn ThreadSource>,
    open_thread: watch::Receiver<Option<String>>,
    snapshot_tx: Arc<watch::Sender<FeedSnapshot>>,
    session: Option<FeedSession>,
    next_session: u64,
}

impl ChatFeed {
    /// `open_thread` is the "currently viewed chat" marker, usually
    /// [`NavigationController::open_thread`](crate::navigation::NavigationController::open_thread).
    pub fn new(source: Arc<dyn ThreadSource>, open_thread: watch::Receiver<Option<String>>) -> Self {
        let (snapshot_tx, _) = watch::channel(FeedSnapshot::default());
        Self {
            source,
            open_thread,
            snapshot_tx: Arc::new(snapshot_tx),
            session: None,
            next_session: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn signal(&self) -> UnreadSignal {
        self.snapshot_tx.borrow().signal.clone()
    }

    pub fn viewer(&self) -> Option<UserKey> {
        self.session.as_ref().map(|s| s.viewer)
    }

    /// Switch the signed-in viewer.
    ///
    /// Tears down the previous viewer's subscriptions before anything else.
    /// Must be called from within a tokio runtime when `viewer` is `Some`.
    pub fn set_viewer(&mut self, viewer: Option<UserKey>) {
        if self.viewer() == viewer {
            return;
        }

        if let Some(previous) = self.session.take() {
            info!(viewer = previous.viewer, "Closing chat feed session");
        }

        self.next_session += 1;
        let session = self.next_session;
        self.snapshot_tx.send_replace(FeedSnapshot {
            session,
            viewer,
            ..Default::default()
        });

        let Some(viewer) = viewer else {
            return;
        };

        info!(viewer, session, "Opening chat feed session");
        let task = tokio::spawn(run_session(
            self.source.clone(),
            viewer,
            session,
            self.open_thread.clone(),
            self.snapshot_tx.clone(),
        ));
        self.session = Some(FeedSession { viewer, task });
    }

    /// Sign out: drop all subscriptions and publish an empty feed.
    pub fn stop(&mut self) {
        self.set_viewer(None);
    }
}

#[derive(Default)]
struct Partitions {
    client: Vec<ChatThread>,
    artist: Vec<ChatThread>,
    /// Support thread found by lookup, shown with the client partition
    support: Option<ChatThread>,
}

type SupportLookup = BoxFuture<'static, Option<ChatThread>>;

async fn run_session(
    source: Arc<dyn ThreadSource>,
    viewer: UserKey,
    session: u64,
    mut open_thread: watch::Receiver<Option<String>>,
    snapshot_tx: Arc<watch::Sender<FeedSnapshot>>,
) {
    let mut client_updates = source.subscribe_client(viewer);
    let mut artist_updates = source.subscribe_artist(viewer);
    let support_id = support_chat_id(viewer);

    let mut partitions = Partitions::default();
    let mut support_lookup: Option<SupportLookup> = None;
    let mut client_live = true;
    let mut artist_live = true;
    let mut marker_live = true;

    while client_live || artist_live {
        tokio::select! {
            update = client_updates.next(), if client_live => match update {
                Some(Ok(threads)) => {
                    // A newer partition replaces any lookup still in flight
                    support_lookup = if threads.iter().any(|t| t.id == support_id) {
                        partitions.support = None;
                        None
                    } else {
                        Some(lookup_support_thread(source.clone(), support_id.clone()))
                    };
                    partitions.client = threads;
                }
                Some(Err(e)) => {
                    warn!(viewer, error = %e, "Client chat subscription failed");
                    partitions.client.clear();
                    partitions.support = None;
                    support_lookup = None;
                }
                None => {
                    debug!(viewer, "Client chat subscription ended");
                    client_live = false;
                    partitions.client.clear();
                    partitions.support = None;
                    support_lookup = None;
                }
            },
            found = await_lookup(&mut support_lookup), if support_lookup.is_some() => {
                support_lookup = None;
                partitions.support = found;
            },
            update = artist_updates.next(), if artist_live => match update {
                Some(Ok(threads)) => partitions.artist = threads,
                Some(Err(e)) => {
                    warn!(viewer, error = %e, "Artist chat subscription failed");
                    partitions.artist.clear();
                }
                None => {
                    debug!(viewer, "Artist chat subscription ended");
                    artist_live = false;
                    partitions.artist.clear();
                }
            },
            changed = open_thread.changed(), if marker_live => {
                if changed.is_err() {
                    // Marker owner is gone; keep the last value
                    marker_live = false;
                }
            }
        }

        let open = open_thread.borrow().clone();
        if !publish(&snapshot_tx, session, viewer, &partitions, open.as_deref()) {
            debug!(viewer, session, "Chat feed session superseded");
            return;
        }
    }

    debug!(viewer, session, "Chat feed session finished");
}

/// Look up the viewer's support thread. Failures hide it.
fn lookup_support_thread(source: Arc<dyn ThreadSource>, support_id: String) -> SupportLookup {
    async move {
        match source.fetch_thread(&support_id).await {
            Ok(thread) => thread,
            Err(e) => {
                debug!(support_id = %support_id, error = %e, "Support chat lookup failed, skipping");
                None
            }
        }
    }
    .boxed()
}

async fn await_lookup(lookup: &mut Option<SupportLookup>) -> Option<ChatThread> {
    match lookup {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

/// Publish a fresh snapshot unless a newer session took over.
///
/// Returns `false` when the session is stale.
fn publish(
    snapshot_tx: &watch::Sender<FeedSnapshot>,
    session: u64,
    viewer: UserKey,
    partitions: &Partitions,
    open_thread: Option<&str>,
) -> bool {
    let mut client = partitions.client.clone();
    if let Some(support) = &partitions.support {
        if !client.iter().any(|t| t.id == support.id) {
            client.push(support.clone());
        }
    }
    let mut threads: Vec<ChatThread> = merge_partitions(&client, &partitions.artist)
        .into_values()
        .collect();
    threads.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.id.cmp(&b.id))
    });
    let signal = compute_unread(threads.iter(), Some(viewer), open_thread);

    let mut current = true;
    snapshot_tx.send_if_modified(|snapshot| {
        if snapshot.session != session {
            current = false;
            return false;
        }
        if snapshot.threads == threads && snapshot.signal == signal {
            return false;
        }
        snapshot.viewer = Some(viewer);
        snapshot.threads = threads;
        snapshot.signal = signal;
        true
    });
    current
}
