//! Atelier chat core
//!
//! Thread store, unread reconciliation, live chat feed and navigation state
//! for the commission marketplace mini-app. The feed server in
//! `atelier-server` builds on the same store and wire protocol.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod models;
pub mod navigation;
pub mod unread;
pub mod utils;
pub mod websocket;

pub use config::ClientConfig;
pub use db::{Database, ThreadChange};
pub use error::{FeedError, StoreError};
pub use feed::{ChatFeed, FeedSnapshot, LocalThreadSource, Partition, ThreadSource};
pub use navigation::{NavCommand, NavigationController};
pub use unread::{compute_unread, ChatIcon, UnreadSignal};
pub use websocket::{RemoteThreadSource, WsMessage};
