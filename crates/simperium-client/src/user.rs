//! Signed in user and its authorization status

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Authorization state of the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Authorized,
    NotAuthorized,
    Unknown,
}

impl Display for UserStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UserStatus::Authorized => "AUTHORIZED",
            UserStatus::NotAuthorized => "NOT_AUTHORIZED",
            UserStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Credentials persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(email: &str, user_id: &str, access_token: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            user_id: Some(user_id.to_string()),
            access_token: Some(access_token.to_string()),
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|token| !token.is_empty())
    }
}

/// Receives user status transitions
pub trait UserStatusListener: Send + Sync {
    fn on_user_status_change(&self, status: UserStatus);
}

impl<F> UserStatusListener for F
where
    F: Fn(UserStatus) + Send + Sync,
{
    fn on_user_status_change(&self, status: UserStatus) {
        self(status)
    }
}

struct UserState {
    credentials: Credentials,
    status: UserStatus,
}

/// The user the client syncs on behalf of.
///
/// Listeners are only notified when the status actually changes.
pub struct User {
    state: RwLock<UserState>,
    listeners: RwLock<Vec<Arc<dyn UserStatusListener>>>,
}

impl Default for User {
    fn default() -> Self {
        Self::new()
    }
}

impl User {
    pub fn new() -> Self {
        Self::with_credentials(Credentials::default())
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            state: RwLock::new(UserState {
                credentials,
                status: UserStatus::Unknown,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_status_listener(&self, listener: Arc<dyn UserStatusListener>) {
        self.listeners.write().push(listener);
    }

    pub fn status(&self) -> UserStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: UserStatus) {
        {
            let mut state = self.state.write();
            if state.status == status {
                return;
            }
            debug!("User status changed {} -> {}", state.status, status);
            state.status = status;
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_user_status_change(status);
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.state.read().credentials.clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.state.write().credentials = credentials;
    }

    pub fn email(&self) -> Option<String> {
        self.state.read().credentials.email.clone()
    }

    pub fn set_email(&self, email: &str) {
        self.state.write().credentials.email = Some(email.to_string());
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.read().credentials.user_id.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().credentials.access_token.clone()
    }

    pub fn set_access_token(&self, token: &str) {
        self.state.write().credentials.access_token = Some(token.to_string());
    }

    pub fn has_access_token(&self) -> bool {
        self.state.read().credentials.has_access_token()
    }

    /// Whether the user must sign in before syncing
    pub fn needs_authorization(&self) -> bool {
        let state = self.state.read();
        state.status == UserStatus::NotAuthorized || !state.credentials.has_access_token()
    }

    /// Drops the token and marks the user not authorized
    pub fn deauthorize(&self) {
        {
            let mut state = self.state.write();
            state.credentials.access_token = None;
            state.credentials.user_id = None;
        }
        self.set_status(UserStatus::NotAuthorized);
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("User")
            .field("email", &state.credentials.email)
            .field("user_id", &state.credentials.user_id)
            .field("status", &state.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_listener_only_fires_on_change() {
        let user = User::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        user.add_status_listener(Arc::new(move |_status: UserStatus| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        user.set_status(UserStatus::Authorized);
        user.set_status(UserStatus::Authorized);
        user.set_status(UserStatus::NotAuthorized);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(user.status(), UserStatus::NotAuthorized);
    }

    #[test]
    fn test_needs_authorization() {
        let user = User::new();
        assert!(user.needs_authorization());

        user.set_credentials(Credentials::new("a@example.com", "42", "token"));
        assert!(!user.needs_authorization());

        user.deauthorize();
        assert!(user.needs_authorization());
        assert_eq!(user.email().as_deref(), Some("a@example.com"));
        assert!(user.access_token().is_none());
    }

    #[test]
    fn test_empty_token_is_not_a_token() {
        let credentials = Credentials {
            access_token: Some(String::new()),
            ..Default::default()
        };
        assert!(!credentials.has_access_token());
    }
}
