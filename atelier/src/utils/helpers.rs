use crate::models::UserKey;

/// User key of the operator answering support chats
pub const SUPPORT_ADMIN_USER_KEY: UserKey = 316659802;

/// Artist id recorded on support chats
pub const SUPPORT_ARTIST_ID: &str = "admin";

pub const SUPPORT_CHAT_PREFIX: &str = "dev__";

/// Generate a deterministic chat ID from an artist/client pair.
/// Both parties resolve to the same ID regardless of who initiates.
pub fn build_chat_id(artist_user_key: UserKey, client_user_key: UserKey) -> String {
    format!("{}__{}", artist_user_key, client_user_key)
}

/// Chat ID of a client's support conversation
pub fn support_chat_id(client_user_key: UserKey) -> String {
    format!("{}{}", SUPPORT_CHAT_PREFIX, client_user_key)
}

pub fn is_support_chat_id(chat_id: &str) -> bool {
    chat_id.starts_with(SUPPORT_CHAT_PREFIX)
}
