use std::path::PathBuf;

const DEFAULT_ADDR: &str = "0.0.0.0:9001";

/// Feed server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String,
    /// SQLite file; `None` keeps the store in memory
    pub db_path: Option<PathBuf>,
    pub access_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: None,
            access_token: None,
        }
    }
}

impl ServerConfig {
    /// Read settings from the environment, loading `.env` first if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let addr = std::env::var("ATELIER_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let db_path = std::env::var("ATELIER_DB_PATH")
            .ok()
            .filter(|p| !p.is_empty() && p != ":memory:")
            .map(PathBuf::from);
        let access_token = std::env::var("ATELIER_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Self {
            addr,
            db_path,
            access_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keeps_store_in_memory() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert!(config.db_path.is_none());
        assert!(config.access_token.is_none());
    }
}
