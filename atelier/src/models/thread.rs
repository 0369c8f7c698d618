use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric identity handed out by the host platform login bridge.
pub type UserKey = i64;

/// Which side of a conversation authored something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Client,
    Artist,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Client => "client",
            SenderRole::Artist => "artist",
            SenderRole::System => "system",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(SenderRole::Client),
            "artist" => Ok(SenderRole::Artist),
            "system" => Ok(SenderRole::System),
            other => Err(format!("unknown sender role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Pending,
    Active,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Pending => "pending",
            ThreadStatus::Active => "active",
        }
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ThreadStatus::Pending),
            "active" => Ok(ThreadStatus::Active),
            other => Err(format!("unknown thread status: {}", other)),
        }
    }
}

/// One conversation between a client and an artist (or the support desk).
///
/// Timestamps are server-assigned milliseconds. Missing timestamps are read
/// as zero by everything that compares them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: String,
    pub artist_id: String,
    pub client_user_key: UserKey,
    #[serde(default)]
    pub artist_user_key: Option<UserKey>,
    #[serde(default)]
    pub status: ThreadStatus,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<i64>,
    #[serde(default)]
    pub last_message_sender_role: Option<SenderRole>,
    #[serde(default)]
    pub client_last_read_at: Option<i64>,
    #[serde(default)]
    pub artist_last_read_at: Option<i64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ChatThread {
    /// Last message time, zero when the thread has no activity.
    pub fn last_activity(&self) -> i64 {
        self.last_message_at.unwrap_or(0).max(0)
    }

    /// Whether `user_key` is one of the two parties of this thread.
    pub fn involves(&self, user_key: UserKey) -> bool {
        self.client_user_key == user_key || self.artist_user_key == Some(user_key)
    }
}
