//! Credential storage for the gateway session.
//!
//! The session client reads a credential right before each handshake and
//! writes a freshly issued device token right after a successful one; there
//! are no concurrent writers. The trait keeps the platform keychain (or
//! whatever secure store the host provides) behind an injectable seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Key under which the user-supplied bearer credential is stored.
pub const BEARER_TOKEN_KEY: &str = "gateway.bearer-token";
/// Key under which the gateway-issued device token is stored. A device token
/// supersedes the bearer credential on subsequent handshakes.
pub const DEVICE_TOKEN_KEY: &str = "gateway.device-token";

/// A secure key-value store for tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store, used in tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// JSON-file-backed store.
///
/// Every operation re-reads the file so the store on disk stays the single
/// point of truth; the session client's access pattern (read before
/// handshake, write after) makes contention a non-issue.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt credential file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err).context("reading credential file"),
        }
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .context("writing credential file")
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get(BEARER_TOKEN_KEY).await.unwrap(), None);

        store.set(BEARER_TOKEN_KEY, "tok-1").await.unwrap();
        assert_eq!(
            store.get(BEARER_TOKEN_KEY).await.unwrap(),
            Some("tok-1".to_string())
        );

        store.delete(BEARER_TOKEN_KEY).await.unwrap();
        assert_eq!(store.get(BEARER_TOKEN_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::new(&path);
        store.set(DEVICE_TOKEN_KEY, "dt-abc").await.unwrap();
        drop(store);

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(
            reopened.get(DEVICE_TOKEN_KEY).await.unwrap(),
            Some("dt-abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nope.json"));
        assert_eq!(store.get(BEARER_TOKEN_KEY).await.unwrap(), None);
        // Deleting from an absent file is a no-op, not an error.
        store.delete(BEARER_TOKEN_KEY).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_replaces_value_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));

        store.set(DEVICE_TOKEN_KEY, "old").await.unwrap();
        store.set(DEVICE_TOKEN_KEY, "new").await.unwrap();
        assert_eq!(
            store.get(DEVICE_TOKEN_KEY).await.unwrap(),
            Some("new".to_string())
        );
    }
}
