//! Entry point tying together the user, storage, auth and the websocket

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use simperium_api::JsonDiff;
use tracing::{info, warn};

use crate::auth::{AuthClient, AuthProvider, FileUserStore, MemoryUserStore, UserDetails, UserStore};
use crate::bucket::{Bucket, BucketSchema};
use crate::config::SimperiumConfig;
use crate::error::Result;
use crate::session;
use crate::storage::{
    FileGhostStore, FileQueueSerializer, FileStorage, GhostStore, MemoryGhostStore, MemoryQueueSerializer,
    MemoryStorage, QueueSerializer, StorageProvider,
};
use crate::user::{Credentials, User, UserStatus};
use crate::websocket::{ConnectionProvider, ConnectionStatus, WebSocketManager, WebSocketProvider};

/// Stores backing a client
pub struct Stores {
    pub user_store: Arc<dyn UserStore>,
    pub ghost_store: Arc<dyn GhostStore>,
    pub storage: Arc<dyn StorageProvider>,
    pub queue_serializer: Arc<dyn QueueSerializer>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            user_store: Arc::new(MemoryUserStore::new()),
            ghost_store: Arc::new(MemoryGhostStore::new()),
            storage: Arc::new(MemoryStorage::new()),
            queue_serializer: Arc::new(MemoryQueueSerializer::new()),
        }
    }

    /// JSON files under the configured data directory, memory otherwise
    pub fn from_config(config: &SimperiumConfig) -> Result<Self> {
        let Some(dir) = config.data_dir.as_deref() else {
            return Ok(Self::memory());
        };
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            user_store: Arc::new(FileUserStore::new(dir)),
            ghost_store: Arc::new(FileGhostStore::open(dir)?),
            storage: Arc::new(FileStorage::new(dir)),
            queue_serializer: Arc::new(FileQueueSerializer::open(dir)),
        })
    }
}

/// Simperium client for one app
pub struct Simperium {
    config: SimperiumConfig,
    user: Arc<User>,
    user_store: Arc<dyn UserStore>,
    auth: Arc<dyn AuthProvider>,
    ghost_store: Arc<dyn GhostStore>,
    storage: Arc<dyn StorageProvider>,
    manager: WebSocketManager,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl Simperium {
    /// Creates a client with websocket and HTTP auth. Must be called from
    /// within a tokio runtime.
    pub fn new(config: SimperiumConfig) -> Result<Self> {
        let stores = Stores::from_config(&config)?;
        let auth = Arc::new(AuthClient::new(config.clone())?);
        let provider = Arc::new(WebSocketProvider::new(Duration::from_millis(config.connect_timeout_ms)));
        Self::with_providers(config, stores, auth, provider)
    }

    pub fn with_providers(
        config: SimperiumConfig,
        stores: Stores,
        auth: Arc<dyn AuthProvider>,
        connection_provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self> {
        let session_id = session::load_or_create(config.data_dir.as_deref(), &config.library);
        info!("Simperium session {} for app {}", session_id, config.app_id);

        let credentials = stores.user_store.restore().unwrap_or_else(|e| {
            warn!("Unable to restore user: {}", e);
            Credentials::default()
        });
        let user = Arc::new(User::with_credentials(credentials));
        if user.has_access_token() {
            user.set_status(UserStatus::Authorized);
        } else {
            user.set_status(UserStatus::NotAuthorized);
        }

        let manager = WebSocketManager::new(
            config.clone(),
            &session_id,
            stores.queue_serializer,
            connection_provider,
        )?;

        user.add_status_listener(Arc::new(UserStatusHandler {
            user: Arc::downgrade(&user),
            user_store: Arc::clone(&stores.user_store),
            manager: manager.clone(),
        }));

        Ok(Self {
            config,
            user,
            user_store: stores.user_store,
            auth,
            ghost_store: stores.ghost_store,
            storage: stores.storage,
            manager,
            buckets: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SimperiumConfig {
        &self.config
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    pub fn session_id(&self) -> &str {
        self.manager.session_id()
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn needs_authorization(&self) -> bool {
        self.user.needs_authorization()
    }

    // ============== Buckets ==============

    pub fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        self.bucket_with_schema(name, BucketSchema::new())
    }

    /// Returns the bucket, creating it and its channel on first use. The
    /// schema is ignored for existing buckets.
    pub fn bucket_with_schema(&self, name: &str, schema: BucketSchema) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.get(name) {
            return Ok(Arc::clone(bucket.value()));
        }

        let store = self.storage.create_store(name, &schema)?;
        let differ = JsonDiff::new().with_array_diff(self.config.array_diff);
        let bucket = Bucket::new(
            name,
            schema,
            Arc::clone(&self.user),
            store,
            Arc::clone(&self.ghost_store),
            differ,
        )?
        .with_backup_clear_delay(self.config.backup_clear_delay())
        .with_object_cache_size(self.config.object_cache_size);
        let bucket = Arc::new(bucket);

        let bucket = match self.buckets.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => Arc::clone(entry.insert(bucket).value()),
        };
        self.manager.build_channel(Arc::clone(&bucket))?;
        Ok(bucket)
    }

    // ============== Users ==============

    pub async fn create_user(&self, email: &str, password: &str) -> Result<Arc<User>> {
        let credentials = self.auth.create_user(UserDetails::new(email, password)).await?;
        self.authorized(credentials)
    }

    pub async fn authorize_user(&self, email: &str, password: &str) -> Result<Arc<User>> {
        let credentials = self.auth.authorize_user(UserDetails::new(email, password)).await?;
        self.authorized(credentials)
    }

    fn authorized(&self, credentials: Credentials) -> Result<Arc<User>> {
        info!("User {} authorized", credentials.email.as_deref().unwrap_or_default());
        self.user.set_credentials(credentials);
        if self.user.status() == UserStatus::Authorized {
            self.user_store.save(&self.user.credentials())?;
            self.manager.connect();
        } else {
            self.user.set_status(UserStatus::Authorized);
        }
        Ok(Arc::clone(&self.user))
    }

    /// Signs the user out and disconnects
    pub fn deauthorize_user(&self) {
        self.user.deauthorize();
    }

    // ============== Connection ==============

    pub fn connect(&self) {
        if self.user.has_access_token() {
            self.manager.connect();
        }
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.manager.is_connecting()
    }

    pub fn is_disconnected(&self) -> bool {
        self.manager.is_disconnected()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.manager.is_disconnecting()
    }

    /// Remote log level requested by the server
    pub fn log_level(&self) -> i32 {
        self.manager.log_level()
    }
}

/// Saves or clears the user and connects or disconnects on status changes
struct UserStatusHandler {
    user: Weak<User>,
    user_store: Arc<dyn UserStore>,
    manager: WebSocketManager,
}

impl crate::user::UserStatusListener for UserStatusHandler {
    fn on_user_status_change(&self, status: UserStatus) {
        match status {
            UserStatus::Authorized => {
                if let Some(user) = self.user.upgrade()
                    && let Err(e) = self.user_store.save(&user.credentials())
                {
                    warn!("Unable to save user: {}", e);
                }
                self.manager.connect();
            }
            UserStatus::NotAuthorized => {
                if let Err(e) = self.user_store.deauthorize() {
                    warn!("Unable to clear saved user: {}", e);
                }
                self.manager.disconnect();
            }
            UserStatus::Unknown => {}
        }
    }
}

impl std::fmt::Debug for Simperium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simperium")
            .field("app_id", &self.config.app_id)
            .field("session_id", &self.session_id())
            .field("status", &self.manager.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, AuthFailure};
    use crate::websocket::Connection;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use url::Url;

    struct FakeAuth;

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn create_user(&self, details: UserDetails) -> std::result::Result<Credentials, AuthError> {
            Err(AuthError::new(AuthFailure::ExistingAccount, &details.username))
        }

        async fn authorize_user(&self, details: UserDetails) -> std::result::Result<Credentials, AuthError> {
            Ok(Credentials::new(&details.username, "42", "fresh-token"))
        }
    }

    /// Hands out connections and keeps the server ends
    #[derive(Default)]
    struct FakeServer {
        connections: Mutex<Vec<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>>,
    }

    #[async_trait]
    impl ConnectionProvider for FakeServer {
        async fn connect(&self, _url: &Url, _session_id: &str) -> Result<Connection> {
            let (sender, from_client) = mpsc::unbounded_channel();
            let (to_client, receiver) = mpsc::unbounded_channel();
            self.connections.lock().push((from_client, to_client));
            Ok(Connection { sender, receiver })
        }
    }

    fn client(stores: Stores, server: Arc<FakeServer>) -> Simperium {
        let config = SimperiumConfig::new("test-app", "secret");
        Simperium::with_providers(config, stores, Arc::new(FakeAuth), server).unwrap()
    }

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_new_client_needs_authorization() {
        let simperium = client(Stores::memory(), Arc::new(FakeServer::default()));
        assert!(simperium.needs_authorization());
        assert_eq!(simperium.user().status(), UserStatus::NotAuthorized);
        assert!(simperium.session_id().starts_with("rust-"));
        assert!(simperium.is_disconnected());
    }

    #[tokio::test]
    async fn test_restored_user_is_authorized() {
        let stores = Stores::memory();
        stores.user_store.save(&Credentials::new("a@example.com", "42", "token")).unwrap();

        let simperium = client(stores, Arc::new(FakeServer::default()));
        assert!(!simperium.needs_authorization());
        assert_eq!(simperium.user().status(), UserStatus::Authorized);
        assert_eq!(simperium.user().email().as_deref(), Some("a@example.com"));
    }

    #[tokio::test]
    async fn test_bucket_is_shared() {
        let simperium = client(Stores::memory(), Arc::new(FakeServer::default()));
        let first = simperium.bucket("notes").unwrap();
        let second = simperium.bucket("notes").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(matches!(
            simperium.bucket("bad name"),
            Err(crate::error::ClientError::BucketNameInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_authorize_saves_user_and_connects() {
        let server = Arc::new(FakeServer::default());
        let stores = Stores::memory();
        let user_store = Arc::clone(&stores.user_store);
        let simperium = client(stores, Arc::clone(&server));
        simperium.bucket("notes").unwrap();

        let user = simperium.authorize_user("a@example.com", "password").await.unwrap();
        assert_eq!(user.access_token().as_deref(), Some("fresh-token"));
        assert_eq!(user_store.restore().unwrap().access_token.as_deref(), Some("fresh-token"));

        assert!(wait_for(|| simperium.is_connected()).await);
        assert_eq!(server.connections.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_create_user_failure() {
        let simperium = client(Stores::memory(), Arc::new(FakeServer::default()));
        let err = simperium.create_user("a@example.com", "password").await.unwrap_err();
        match err {
            crate::error::ClientError::Auth(auth) => assert_eq!(auth.failure, AuthFailure::ExistingAccount),
            other => panic!("unexpected error {other}"),
        }
        assert!(simperium.needs_authorization());
    }

    #[tokio::test]
    async fn test_deauthorize_clears_saved_user() {
        let stores = Stores::memory();
        stores.user_store.save(&Credentials::new("a@example.com", "42", "token")).unwrap();
        let user_store = Arc::clone(&stores.user_store);
        let simperium = client(stores, Arc::new(FakeServer::default()));
        simperium.bucket("notes").unwrap();
        assert!(wait_for(|| simperium.is_connected()).await);

        simperium.deauthorize_user();
        assert!(simperium.needs_authorization());
        assert!(!user_store.restore().unwrap().has_access_token());
        assert!(wait_for(|| !simperium.is_connected()).await);
    }

    #[tokio::test]
    async fn test_file_stores_persist_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimperiumConfig::new("test-app", "secret").with_data_dir(dir.path());

        let first = Simperium::with_providers(
            config.clone(),
            Stores::from_config(&config).unwrap(),
            Arc::new(FakeAuth),
            Arc::new(FakeServer::default()),
        )
        .unwrap();
        let session_id = first.session_id().to_string();
        drop(first);

        let second = Simperium::with_providers(
            config.clone(),
            Stores::from_config(&config).unwrap(),
            Arc::new(FakeAuth),
            Arc::new(FakeServer::default()),
        )
        .unwrap();
        assert_eq!(second.session_id(), session_id);
    }
}
