//! Durable registration storage boundary.
//!
//! The coordinator consumes storage as an external capability; embedders
//! plug in a durable backend. [`InMemoryStorage`] is the reference
//! implementation used by tests and embedders without persistence.

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::registration::RegistrationId;
use crate::version::VersionId;

/// Storage backend errors.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend: {0}")]
    Backend(String),
}

/// A persisted registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRegistration {
    /// Registration id, for correlation with the live arena.
    pub registration_id: RegistrationId,

    /// Scope pattern (a URL prefix, optionally ending in `*`).
    pub scope: String,

    /// Script URL of the stored version.
    pub script_url: String,

    /// Version the record was written for.
    pub version_id: VersionId,

    /// SHA-256 of the script bytes, used to detect unchanged updates.
    pub script_hash: [u8; 32],
}

/// Durable registration persistence contract.
#[async_trait]
pub trait StorageFacade: Send + Sync {
    /// Look up the record stored for an exact scope.
    async fn find_by_scope(&self, scope: &str) -> Result<Option<StoredRegistration>, StorageError>;

    /// Find the record whose scope is the longest prefix match for a
    /// document URL.
    async fn find_by_document(
        &self,
        url: &str,
    ) -> Result<Option<StoredRegistration>, StorageError>;

    /// Insert or replace the record for its scope.
    async fn store(&self, record: StoredRegistration) -> Result<(), StorageError>;

    /// Delete the record for a registration.
    async fn delete(&self, registration_id: RegistrationId) -> Result<(), StorageError>;
}

/// Check whether a scope pattern controls a document URL. A trailing `*`
/// wildcards the rest; otherwise the scope is a plain prefix.
pub fn scope_matches(scope: &str, url: &str) -> bool {
    match scope.strip_suffix('*') {
        Some(prefix) => url.starts_with(prefix),
        None => url.starts_with(scope),
    }
}

/// In-memory storage facade, keyed by scope.
#[derive(Default)]
pub struct InMemoryStorage {
    records: RwLock<HashMap<String, StoredRegistration>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Check if no records are stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StorageFacade for InMemoryStorage {
    async fn find_by_scope(&self, scope: &str) -> Result<Option<StoredRegistration>, StorageError> {
        Ok(self.records.read().await.get(scope).cloned())
    }

    async fn find_by_document(
        &self,
        url: &str,
    ) -> Result<Option<StoredRegistration>, StorageError> {
        let records = self.records.read().await;
        let best = records
            .values()
            .filter(|r| scope_matches(&r.scope, url))
            .max_by_key(|r| r.scope.trim_end_matches('*').len())
            .cloned();
        Ok(best)
    }

    async fn store(&self, record: StoredRegistration) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.scope.clone(), record);
        Ok(())
    }

    async fn delete(&self, registration_id: RegistrationId) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .retain(|_, r| r.registration_id != registration_id);
        Ok(())
    }
}
