//! Persistence of the signed in user's credentials

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::user::Credentials;

/// Saves and restores the user's email and access token between runs
pub trait UserStore: Send + Sync {
    fn save(&self, credentials: &Credentials) -> Result<()>;

    fn restore(&self) -> Result<Credentials>;

    /// Forgets the saved token and email
    fn deauthorize(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryUserStore {
    credentials: Mutex<Credentials>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn save(&self, credentials: &Credentials) -> Result<()> {
        *self.credentials.lock() = credentials.clone();
        Ok(())
    }

    fn restore(&self) -> Result<Credentials> {
        Ok(self.credentials.lock().clone())
    }

    fn deauthorize(&self) -> Result<()> {
        *self.credentials.lock() = Credentials::default();
        Ok(())
    }
}

/// Stores credentials as JSON in `user.json`
pub struct FileUserStore {
    path: PathBuf,
}

impl FileUserStore {
    pub const FILE_NAME: &'static str = "user.json";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(Self::FILE_NAME),
        }
    }
}

impl UserStore for FileUserStore {
    fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(credentials)?)?;
        Ok(())
    }

    fn restore(&self) -> Result<Credentials> {
        if !self.path.exists() {
            return Ok(Credentials::default());
        }
        let content = std::fs::read(&self.path)?;
        match serde_json::from_slice(&content) {
            Ok(credentials) => Ok(credentials),
            Err(e) => {
                warn!("Ignoring unreadable user file {}: {}", self.path.display(), e);
                Ok(Credentials::default())
            }
        }
    }

    fn deauthorize(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryUserStore::new();
        store.save(&Credentials::new("a@example.com", "1", "token")).unwrap();
        assert_eq!(store.restore().unwrap().access_token.as_deref(), Some("token"));
        store.deauthorize().unwrap();
        assert_eq!(store.restore().unwrap(), Credentials::default());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::new(dir.path());
        assert_eq!(store.restore().unwrap(), Credentials::default());

        store.save(&Credentials::new("a@example.com", "1", "token")).unwrap();
        let restored = FileUserStore::new(dir.path()).restore().unwrap();
        assert_eq!(restored.email.as_deref(), Some("a@example.com"));
        assert_eq!(restored.access_token.as_deref(), Some("token"));

        store.deauthorize().unwrap();
        assert!(!dir.path().join(FileUserStore::FILE_NAME).exists());
    }
}
