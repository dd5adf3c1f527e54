//! Storage collaborator boundary.
//!
//! The scheduler only ever holds [`PayloadId`]s; bytes are resolved through a
//! [`PayloadStore`] at execution time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::ids::PayloadId;

/// Resolves and persists opaque task payloads and results.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn get(&self, id: &PayloadId) -> Result<Bytes, StorageError>;

    async fn put(&self, bytes: Bytes) -> Result<PayloadId, StorageError>;
}

#[async_trait]
impl<T: PayloadStore + ?Sized> PayloadStore for Arc<T> {
    async fn get(&self, id: &PayloadId) -> Result<Bytes, StorageError> {
        (**self).get(id).await
    }

    async fn put(&self, bytes: Bytes) -> Result<PayloadId, StorageError> {
        (**self).put(bytes).await
    }
}

/// Content address of a byte string (hex SHA-256).
pub fn content_id(bytes: &[u8]) -> PayloadId {
    let digest = Sha256::digest(bytes);
    PayloadId(format!("{digest:x}"))
}

/// Content-addressed in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<PayloadId, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl PayloadStore for MemoryStore {
    async fn get(&self, id: &PayloadId) -> Result<Bytes, StorageError> {
        self.blobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn put(&self, bytes: Bytes) -> Result<PayloadId, StorageError> {
        let id = content_id(&bytes);
        self.blobs.write().await.entry(id.clone()).or_insert(bytes);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        let id = store.put(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn equal_content_shares_id() {
        let store = MemoryStore::new();
        let a = store.put(Bytes::from_static(b"same")).await.unwrap();
        let b = store.put(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_payload_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get(&PayloadId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn content_id_is_sha256_hex() {
        let id = content_id(b"");
        assert_eq!(
            id.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            content_id(b"hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
