use tracing::info;

/// Feed server URL used when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:9001";

/// Connection settings for [`RemoteThreadSource`](crate::websocket::RemoteThreadSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub access_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            access_token: None,
        }
    }
}

impl ClientConfig {
    /// Read settings from the environment, loading `.env` first if present.
    ///
    /// Server URL priority: build-time env -> runtime env -> default.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let build_time_url = option_env!("ATELIER_SERVER_URL");
        let runtime_url = std::env::var("ATELIER_SERVER_URL").ok();

        info!(
            build_time = ?build_time_url,
            runtime = ?runtime_url,
            "Feed server URL sources"
        );

        let server_url = build_time_url
            .map(String::from)
            .or(runtime_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let access_token = std::env::var("ATELIER_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Self {
            server_url,
            access_token,
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}
