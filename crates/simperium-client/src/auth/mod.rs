//! User creation and authorization against the Simperium auth service

mod store;

pub use store::{FileUserStore, MemoryUserStore, UserStore};

use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SimperiumConfig;
use crate::user::Credentials;

pub const CREATE_PATH: &str = "create/";
pub const AUTHORIZE_PATH: &str = "authorize/?auth_verify=true";
pub const API_KEY_HEADER: &str = "X-Simperium-API-Key";

pub const GENERIC_FAILURE_MESSAGE: &str = "Invalid username or password";
pub const EXISTING_USER_FAILURE_MESSAGE: &str = "Account already exists";
pub const COMPROMISED_PASSWORD_MESSAGE: &str = "Password has been compromised";
const INVALID_LOGIN_BODY: &str = "invalid login";

/// Why an auth request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidAccount,
    ExistingAccount,
    CompromisedPassword,
}

impl Display for AuthFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthFailure::InvalidAccount => "INVALID_ACCOUNT",
            AuthFailure::ExistingAccount => "EXISTING_ACCOUNT",
            AuthFailure::CompromisedPassword => "COMPROMISED_PASSWORD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    pub failure: AuthFailure,
    pub message: String,
    /// HTTP status, when a response was received
    pub status: Option<u16>,
}

impl AuthError {
    pub fn new(failure: AuthFailure, message: &str) -> Self {
        Self {
            failure,
            message: message.to_string(),
            status: None,
        }
    }

    /// Generic failure for transport errors and unreadable responses
    pub fn generic() -> Self {
        Self::new(AuthFailure::InvalidAccount, GENERIC_FAILURE_MESSAGE)
    }

    /// Maps an HTTP status and response body to a failure.
    ///
    /// A 401 means either bad credentials or a compromised password; the
    /// body tells them apart.
    pub fn from_status(status: u16, body: &str) -> Self {
        let mut error = match status {
            409 => Self::new(AuthFailure::ExistingAccount, EXISTING_USER_FAILURE_MESSAGE),
            401 if body.trim() == INVALID_LOGIN_BODY => Self::generic(),
            401 => Self::new(AuthFailure::CompromisedPassword, COMPROMISED_PASSWORD_MESSAGE),
            _ => Self::generic(),
        };
        error.status = Some(status);
        error
    }
}

/// Username and password sent to the auth service
#[derive(Debug, Clone, Serialize)]
pub struct UserDetails {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl UserDetails {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            provider: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponseBody {
    userid: Option<String>,
    access_token: Option<String>,
}

/// Service that turns a username and password into an access token
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn create_user(&self, details: UserDetails) -> Result<Credentials, AuthError>;

    async fn authorize_user(&self, details: UserDetails) -> Result<Credentials, AuthError>;
}

/// HTTP client for `auth.simperium.com`
pub struct AuthClient {
    client: Client,
    config: SimperiumConfig,
}

impl AuthClient {
    pub fn new(config: SimperiumConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self { client, config })
    }

    async fn send_request(&self, path: &str, details: &UserDetails) -> Result<Credentials, AuthError> {
        let url = self.config.auth_endpoint(path);
        debug!("Auth request to {}", url);

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.config.app_secret)
            .json(details)
            .send()
            .await
            .map_err(|e| {
                warn!("Auth request failed: {}", e);
                AuthError::generic()
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status != StatusCode::OK {
            debug!("Auth request rejected with {}: {}", status, body);
            return Err(AuthError::from_status(status.as_u16(), &body));
        }

        let parsed: AuthResponseBody = serde_json::from_str(&body).map_err(|e| {
            warn!("Invalid auth response body: {}", e);
            AuthError::generic()
        })?;

        match (parsed.userid, parsed.access_token) {
            (Some(user_id), Some(token)) if !token.is_empty() => {
                Ok(Credentials::new(&details.username, &user_id, &token))
            }
            _ => Err(AuthError::generic()),
        }
    }
}

#[async_trait]
impl AuthProvider for AuthClient {
    async fn create_user(&self, mut details: UserDetails) -> Result<Credentials, AuthError> {
        if details.provider.is_none() {
            details.provider = self.config.auth_provider.clone();
        }
        self.send_request(CREATE_PATH, &details).await
    }

    async fn authorize_user(&self, details: UserDetails) -> Result<Credentials, AuthError> {
        self.send_request(AUTHORIZE_PATH, &details).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_for_status() {
        let err = AuthError::from_status(409, "");
        assert_eq!(err.failure, AuthFailure::ExistingAccount);
        assert_eq!(err.to_string(), "Account already exists");

        let err = AuthError::from_status(401, "invalid login");
        assert_eq!(err.failure, AuthFailure::InvalidAccount);
        assert_eq!(err.to_string(), "Invalid username or password");

        let err = AuthError::from_status(401, "password compromised");
        assert_eq!(err.failure, AuthFailure::CompromisedPassword);
        assert_eq!(err.to_string(), "Password has been compromised");

        let err = AuthError::from_status(500, "boom");
        assert_eq!(err.failure, AuthFailure::InvalidAccount);
        assert_eq!(err.status, Some(500));
    }

    #[test]
    fn test_user_details_serialization() {
        let details = UserDetails::new("a@example.com", "secret");
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["username"], "a@example.com");
        assert!(value.get("provider").is_none());
    }
}
