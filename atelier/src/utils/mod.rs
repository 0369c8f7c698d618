mod helpers;

pub use helpers::{
    build_chat_id, is_support_chat_id, support_chat_id, SUPPORT_ADMIN_USER_KEY,
    SUPPORT_ARTIST_ID, SUPPORT_CHAT_PREFIX,
};
