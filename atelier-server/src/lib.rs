//! Atelier feed server library
//!
//! This module exposes the server components for use in integration tests.

mod config;
mod connection;
mod state;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

pub use atelier::WsMessage;
pub use config::ServerConfig;
pub use connection::{handle_connection, handle_message, HandlerError};
pub use state::ServerState;

/// Accept WebSocket connections forever.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New connection from {}", peer_addr);

                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => handle_connection(ws_stream, state).await,
                        Err(e) => error!("WebSocket handshake failed for {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
