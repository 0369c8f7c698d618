mod chat_feed;
mod source;

pub use chat_feed::{ChatFeed, FeedSnapshot};
pub use source::{LocalThreadSource, Partition, ThreadSource, ThreadStream};
