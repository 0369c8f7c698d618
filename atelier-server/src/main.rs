use std::sync::Arc;

use atelier::Database;
use atelier_server::{serve, ServerConfig, ServerState};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    let db = match &config.db_path {
        Some(path) => Database::open(path),
        None => {
            info!("No ATELIER_DB_PATH set, keeping threads in memory");
            Database::open_in_memory()
        }
    };
    let db = match db {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to open thread store: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(ServerState::new(db).with_access_token(config.access_token.clone()));
    let _relay = state.spawn_change_relay();

    // Bind TCP listener
    let listener = match TcpListener::bind(&config.addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };

    info!("Atelier feed server listening on {}", config.addr);
    serve(listener, state).await;
}
