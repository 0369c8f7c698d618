mod client;
mod messages;

pub use client::RemoteThreadSource;
pub use messages::WsMessage;
