//! Durable key-value storage interface and session token store.
//!
//! The core never talks to platform storage directly: the embedding
//! application supplies a [`KeyValueStorage`] implementation (secure
//! enclave, keychain, SQLite, ...). [`MemoryStorage`] backs tests and
//! ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;

/// Storage key for the bearer access token.
pub const KEY_ACCESS_TOKEN: &str = "auth.access_token";
/// Storage key for the refresh token.
pub const KEY_REFRESH_TOKEN: &str = "auth.refresh_token";
/// Storage key for the cached user identity.
pub const KEY_USER_ID: &str = "auth.user_id";

/// Durable key-value storage supplied by the embedding application.
///
/// Must be available before the request pipeline issues its first call.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Reads a value, returning `None` when the key is absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value, overwriting any existing entry.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-memory [`KeyValueStorage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().await.remove(key);
        Ok(())
    }
}

/// Narrow view over [`KeyValueStorage`] for the session credential set.
///
/// The bearer token, refresh token, and cached user id are only ever read
/// and written through this type, so session teardown cannot miss a key.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn KeyValueStorage>,
}

impl TokenStore {
    /// Creates a token store over the given storage backend.
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Returns the current bearer access token, if a session exists.
    pub async fn access_token(&self) -> Option<String> {
        self.storage.get_item(KEY_ACCESS_TOKEN).await.ok().flatten()
    }

    /// Returns the current refresh token, if a session exists.
    pub async fn refresh_token(&self) -> Option<String> {
        self.storage
            .get_item(KEY_REFRESH_TOKEN)
            .await
            .ok()
            .flatten()
    }

    /// Returns the cached user id, if known.
    pub async fn user_id(&self) -> Option<String> {
        self.storage.get_item(KEY_USER_ID).await.ok().flatten()
    }

    /// Persists a full session (both tokens and the user identity).
    pub async fn store_session(
        &self,
        access_token: &str,
        refresh_token: &str,
        user_id: &str,
    ) -> Result<()> {
        self.storage.set_item(KEY_ACCESS_TOKEN, access_token).await?;
        self.storage
            .set_item(KEY_REFRESH_TOKEN, refresh_token)
            .await?;
        self.storage.set_item(KEY_USER_ID, user_id).await?;
        debug!(user_id, "Session credentials stored");
        Ok(())
    }

    /// Replaces the token pair after a successful refresh, keeping the
    /// cached identity.
    pub async fn store_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        self.storage.set_item(KEY_ACCESS_TOKEN, access_token).await?;
        self.storage
            .set_item(KEY_REFRESH_TOKEN, refresh_token)
            .await
    }

    /// Purges every session credential. Used on logout and on refresh
    /// failure (session teardown).
    pub async fn clear_session(&self) -> Result<()> {
        self.storage.remove_item(KEY_ACCESS_TOKEN).await?;
        self.storage.remove_item(KEY_REFRESH_TOKEN).await?;
        self.storage.remove_item(KEY_USER_ID).await?;
        debug!("Session credentials cleared");
        Ok(())
    }

    /// Checks whether a stored credential exists.
    pub async fn has_session(&self) -> bool {
        self.access_token().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_item("k").await.unwrap(), None);

        storage.set_item("k", "v").await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), Some("v".to_string()));

        storage.remove_item("k").await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), None);

        // Removing an absent key is fine
        storage.remove_item("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_token_store_session_lifecycle() {
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        assert!(!store.has_session().await);

        store.store_session("at-1", "rt-1", "user-9").await.unwrap();
        assert_eq!(store.access_token().await, Some("at-1".to_string()));
        assert_eq!(store.user_id().await, Some("user-9".to_string()));

        store.store_tokens("at-2", "rt-2").await.unwrap();
        assert_eq!(store.access_token().await, Some("at-2".to_string()));
        // Identity survives a token refresh
        assert_eq!(store.user_id().await, Some("user-9".to_string()));

        store.clear_session().await.unwrap();
        assert!(!store.has_session().await);
        assert_eq!(store.user_id().await, None);
    }
}
