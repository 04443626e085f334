//! The blob-store contract consumed by the lifecycle core, plus an
//! in-memory implementation.

use crate::{
    errors::{StorageError, StorageResult},
    models::blob::{BlobHead, BlobObject, ListOptions, ListPage, PutOptions, payload_etag},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use std::{collections::BTreeMap, ops::Bound};
use tokio::sync::RwLock;

pub const MAX_LIST_LIMIT: usize = 1000;

/// Key-value blob storage with get/head/put/delete/list.
///
/// There are no transactions and no rename primitive; moves are composed by
/// callers from `get`, `put` and `delete`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<BlobObject>>;

    async fn head(&self, key: &str) -> StorageResult<Option<BlobHead>>;

    async fn put(&self, key: &str, body: Bytes, opts: PutOptions) -> StorageResult<()>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn delete_many(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Lexicographic listing under `prefix`, resumed after `cursor`.
    async fn list(&self, opts: ListOptions) -> StorageResult<ListPage>;

    /// Cheap liveness check used by readiness.
    async fn ping(&self) -> StorageResult<()> {
        self.list(ListOptions {
            prefix: None,
            cursor: None,
            limit: 1,
        })
        .await
        .map(|_| ())
    }
}

/// Continuation cursors are the base64 of the last key returned.
pub fn encode_cursor(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

pub fn decode_cursor(cursor: &str) -> StorageResult<String> {
    general_purpose::STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| StorageError::InvalidCursor(cursor.to_string()))
}

pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}

/// Process-local blob store. Backs tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, BlobObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    #[cfg(test)]
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> StorageResult<Option<BlobObject>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<BlobHead>> {
        Ok(self.objects.read().await.get(key).map(BlobHead::from))
    }

    async fn put(&self, key: &str, body: Bytes, opts: PutOptions) -> StorageResult<()> {
        let object = BlobObject {
            key: key.to_string(),
            size: body.len() as u64,
            etag: payload_etag(&body),
            body,
            http_metadata: opts.http_metadata.unwrap_or_default(),
            custom_metadata: opts.custom_metadata.unwrap_or_default(),
            uploaded: Utc::now(),
        };
        self.objects.write().await.insert(key.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> StorageResult<ListPage> {
        let limit = clamp_limit(opts.limit);
        let prefix = opts.prefix.unwrap_or_default();
        let after = opts.cursor.as_deref().map(decode_cursor).transpose()?;
        let lower = match &after {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Included(prefix.clone()),
        };

        let objects = self.objects.read().await;
        let mut heads: Vec<BlobHead> = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .take(limit + 1)
            .map(|(_, obj)| BlobHead::from(obj))
            .collect();

        let truncated = heads.len() > limit;
        heads.truncate(limit);
        let cursor = if truncated {
            heads.last().map(|head| encode_cursor(&head.key))
        } else {
            None
        };

        Ok(ListPage {
            objects: heads,
            truncated,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(keys: &[&str]) -> MemoryBlobStore {
        let store = MemoryBlobStore::new();
        for key in keys {
            store
                .put(key, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn list_pages_under_prefix() {
        let store = seeded(&["a/1.png", "a/2.png", "a/3.png", "b/1.png"]).await;

        let first = store
            .list(ListOptions {
                prefix: Some("a/".into()),
                cursor: None,
                limit: 2,
            })
            .await
            .unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a/1.png", "a/2.png"]);
        assert!(first.truncated);

        let second = store
            .list(ListOptions {
                prefix: Some("a/".into()),
                cursor: first.cursor,
                limit: 2,
            })
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a/3.png"]);
        assert!(!second.truncated);
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn zero_limit_is_clamped_to_one() {
        let store = seeded(&["a.png", "b.png"]).await;
        let page = store
            .list(ListOptions {
                prefix: None,
                cursor: None,
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert!(page.truncated);
    }

    #[tokio::test]
    async fn put_records_metadata_and_size() {
        let store = MemoryBlobStore::new();
        store
            .put("cat.png", Bytes::from_static(b"meow"), PutOptions::json())
            .await
            .unwrap();
        let head = store.head("cat.png").await.unwrap().unwrap();
        assert_eq!(head.size, 4);
        assert_eq!(head.http_metadata.content_type.as_deref(), Some("application/json"));
        store.delete("cat.png").await.unwrap();
        assert!(store.get("cat.png").await.unwrap().is_none());
        store.delete("cat.png").await.unwrap();
    }

    #[tokio::test]
    async fn delete_tolerates_missing_keys() {
        let store = seeded(&["a.png", "b.png", "c.png"]).await;
        for key in ["a.png", "ghost.png", "c.png"] {
            store.delete(key).await.unwrap();
        }
        assert_eq!(store.keys().await, ["b.png"]);
        assert_eq!(store.len().await, 1);
        store.delete("b.png").await.unwrap();
        assert!(store.is_empty().await);
    }
}
