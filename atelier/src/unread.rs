//! Unread reconciliation across the viewer's client-side and artist-side chats.
//!
//! Everything here is a pure function of the thread set, the viewer and the
//! currently open thread. The live [`ChatFeed`](crate::feed::ChatFeed) re-runs
//! it whenever one of those inputs changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{ChatThread, SenderRole, UserKey};

/// Variant of the chat tab icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatIcon {
    #[default]
    Idle,
    Unread,
}

impl ChatIcon {
    pub fn for_count(count: u32) -> Self {
        if count > 0 {
            ChatIcon::Unread
        } else {
            ChatIcon::Idle
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatIcon::Idle => "icon-chat-bubble-grey",
            ChatIcon::Unread => "icon-chat-bubble-red",
        }
    }
}

/// Read state of one thread from the viewer's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReadState {
    pub thread_id: String,
    /// The viewer's role in this thread, `Client` or `Artist`.
    pub role: SenderRole,
    pub last_read_at: i64,
    pub last_message_at: i64,
    pub unread: bool,
}

/// Badge input derived from the merged thread set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UnreadSignal {
    pub count: u32,
    pub icon: ChatIcon,
    /// Per-thread state, most recent activity first.
    pub threads: Vec<ThreadReadState>,
}

/// Union both partitions keyed by thread id. Later entries win, so a thread
/// present in both partitions is kept once with its artist-side copy.
pub fn merge_partitions(
    client: &[ChatThread],
    artist: &[ChatThread],
) -> HashMap<String, ChatThread> {
    let mut merged = HashMap::with_capacity(client.len() + artist.len());
    for thread in client.iter().chain(artist.iter()) {
        merged.insert(thread.id.clone(), thread.clone());
    }
    merged
}

/// Client when the viewer is the thread's client, artist otherwise.
pub fn viewer_role(thread: &ChatThread, viewer: UserKey) -> SenderRole {
    if thread.client_user_key == viewer {
        SenderRole::Client
    } else {
        SenderRole::Artist
    }
}

/// The viewer's own read marker, zero when never read or not a party.
pub fn viewer_last_read(thread: &ChatThread, viewer: UserKey) -> i64 {
    let read = if thread.client_user_key == viewer {
        thread.client_last_read_at
    } else if thread.artist_user_key == Some(viewer) {
        thread.artist_last_read_at
    } else {
        None
    };
    read.unwrap_or(0)
}

/// Whether `thread` holds a counterpart message the viewer has not read.
///
/// The open thread never counts: its read marker is being written but has not
/// come back through the live subscription yet.
pub fn is_unread(thread: &ChatThread, viewer: UserKey, open_thread: Option<&str>) -> bool {
    if open_thread == Some(thread.id.as_str()) {
        return false;
    }

    let last_message_at = thread.last_activity();
    if last_message_at == 0 {
        return false;
    }

    let role = viewer_role(thread, viewer);
    match thread.last_message_sender_role {
        Some(SenderRole::System) | None => return false,
        Some(sender) if sender == role => return false,
        Some(_) => {}
    }

    last_message_at > viewer_last_read(thread, viewer)
}

/// Derive the unread signal for `viewer`. No viewer means an empty signal.
pub fn compute_unread<'a, I>(threads: I, viewer: Option<UserKey>, open_thread: Option<&str>) -> UnreadSignal
where
    I: IntoIterator<Item = &'a ChatThread>,
{
    let Some(viewer) = viewer else {
        return UnreadSignal::default();
    };

    let mut states: Vec<ThreadReadState> = threads
        .into_iter()
        .map(|thread| ThreadReadState {
            thread_id: thread.id.clone(),
            role: viewer_role(thread, viewer),
            last_read_at: viewer_last_read(thread, viewer),
            last_message_at: thread.last_activity(),
            unread: is_unread(thread, viewer, open_thread),
        })
        .collect();

    states.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.thread_id.cmp(&b.thread_id))
    });

    let count = states.iter().filter(|s| s.unread).count() as u32;

    UnreadSignal {
        count,
        icon: ChatIcon::for_count(count),
        threads: states,
    }
}
