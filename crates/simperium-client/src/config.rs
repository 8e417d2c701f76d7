//! Client configuration
//!
//! `SimperiumConfig` carries the app credentials and the service endpoints.
//! It can be built in code with the `with_*` methods or loaded from a TOML
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, Result};

pub const DEFAULT_AUTH_URL: &str = "https://auth.simperium.com/1";
pub const DEFAULT_SOCKET_URL: &str = "https://api.simperium.com/sock/1";
pub const DEFAULT_LIBRARY: &str = "rust";
pub const DEFAULT_OBJECT_CACHE_SIZE: u64 = 32;

/// Configuration for a Simperium client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimperiumConfig {
    /// Simperium app id
    pub app_id: String,
    /// App secret, sent as the API key for auth requests
    pub app_secret: String,
    /// Base URL of the auth service
    pub auth_url: String,
    /// Base URL of the websocket service
    pub socket_url: String,
    /// Directory for persisted state; in-memory stores are used when unset
    pub data_dir: Option<PathBuf>,
    /// Library name reported in the init command and session id
    pub library: String,
    /// Optional auth provider sent when creating users
    pub auth_provider: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Idle time before a heartbeat is sent
    pub heartbeat_interval_ms: u64,
    /// Delay between resends of an unacknowledged change
    pub retry_delay_ms: u64,
    /// Age after which backup copies may be cleared
    pub backup_clear_delay_ms: u64,
    /// Diff lists element by element instead of replacing them
    pub array_diff: bool,
    /// Recently read objects kept in memory per bucket
    pub object_cache_size: u64,
}

impl Default for SimperiumConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            data_dir: None,
            library: DEFAULT_LIBRARY.to_string(),
            auth_provider: None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
            heartbeat_interval_ms: 20000,
            retry_delay_ms: 5000,
            backup_clear_delay_ms: 5000,
            array_diff: false,
            object_cache_size: DEFAULT_OBJECT_CACHE_SIZE,
        }
    }
}

impl SimperiumConfig {
    /// Create a config for an app
    pub fn new(app_id: &str, app_secret: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            ..Default::default()
        }
    }

    /// Load a config from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| ClientError::Other(e.into()))
    }

    /// Persist state under the given directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Override the service endpoints
    pub fn with_endpoints(mut self, auth_url: &str, socket_url: &str) -> Self {
        self.auth_url = auth_url.trim_end_matches('/').to_string();
        self.socket_url = socket_url.trim_end_matches('/').to_string();
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_retry_delay(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_array_diff(mut self, enabled: bool) -> Self {
        self.array_diff = enabled;
        self
    }

    pub fn with_object_cache_size(mut self, size: u64) -> Self {
        self.object_cache_size = size;
        self
    }

    pub fn with_auth_provider(mut self, provider: &str) -> Self {
        self.auth_provider = Some(provider.to_string());
        self
    }

    pub fn with_library(mut self, library: &str) -> Self {
        self.library = library.to_string();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn backup_clear_delay(&self) -> Duration {
        Duration::from_millis(self.backup_clear_delay_ms)
    }

    /// URL of an auth endpoint, e.g. `authorize/`
    pub fn auth_endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.auth_url.trim_end_matches('/'), self.app_id, path)
    }

    /// Websocket URL for the app with an http(s) scheme mapped to ws(s)
    pub fn websocket_url(&self) -> Result<Url> {
        let raw = format!(
            "{}/{}/websocket",
            self.socket_url.trim_end_matches('/'),
            self.app_id
        );
        let mut url = Url::parse(&raw).map_err(|e| ClientError::Other(e.into()))?;
        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| ClientError::WebSocket(format!("cannot use scheme {scheme} for {raw}")))?;
        }
        Ok(url)
    }
}
