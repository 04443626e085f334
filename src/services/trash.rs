//! Moves objects between their live key and a trash key, and back.
//!
//! Every move is put-then-delete. A failure between the two steps leaves the
//! object at both keys, never at neither.

use crate::{
    errors::{CoreError, CoreResult},
    models::blob::{BlobObject, CustomMetadata, PutOptions},
    services::{
        blob_store::BlobStore,
        keys::{
            KeyRejection, clean_key, counter_variant, deleted_variant, ensure_safe_object_key,
            is_trash_key, original_key_from_trash, restored_variant, trash_key_for,
        },
        meta_store::iso_timestamp,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Custom attribute holding the live key an object was trashed from.
pub const ORIGINAL_KEY_ATTR: &str = "trash-original-key";
/// Custom attribute holding when the object was trashed.
pub const DELETED_AT_ATTR: &str = "trash-deleted-at";

const MAX_COUNTER_ATTEMPTS: u32 = 100;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrashOutcome {
    /// The key was already in the trash and has been removed for good.
    Deleted { key: String },
    Missing { key: String },
    Moved { from: String, to: String },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RestoreOutcome {
    NotTrash { key: String },
    Missing { key: String },
    Restored {
        from: String,
        to: String,
        original: String,
    },
}

#[derive(Clone)]
pub struct TrashEngine {
    store: Arc<dyn BlobStore>,
}

impl TrashEngine {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn move_to_trash(&self, key: &str) -> CoreResult<TrashOutcome> {
        self.move_to_trash_at(key, Utc::now()).await
    }

    /// Soft-delete `key`, or delete it permanently if it is already trashed.
    pub async fn move_to_trash_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<TrashOutcome> {
        if is_trash_key(key) {
            self.store.delete(key).await?;
            debug!("permanently deleted {}", key);
            return Ok(TrashOutcome::Deleted {
                key: key.to_string(),
            });
        }

        let Some(source) = self.store.get(key).await? else {
            return Ok(TrashOutcome::Missing {
                key: key.to_string(),
            });
        };

        let target = self
            .free_key(trash_key_for(key), |taken| deleted_variant(taken, now))
            .await?;

        let mut custom = source.custom_metadata.clone();
        custom.insert(ORIGINAL_KEY_ATTR.to_string(), key.to_string());
        custom.insert(DELETED_AT_ATTR.to_string(), iso_timestamp(now));
        self.write_copy(&target, &source, custom).await?;
        self.store.delete(key).await?;

        debug!("trashed {} -> {}", key, target);
        Ok(TrashOutcome::Moved {
            from: key.to_string(),
            to: target,
        })
    }

    pub async fn restore_from_trash(&self, key: &str) -> CoreResult<RestoreOutcome> {
        self.restore_from_trash_at(key, Utc::now()).await
    }

    /// Bring a trashed object back to its original key (or a
    /// `__restored_<ts>` variant of it when that key is taken).
    pub async fn restore_from_trash_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<RestoreOutcome> {
        if !is_trash_key(key) {
            return Ok(RestoreOutcome::NotTrash {
                key: key.to_string(),
            });
        }

        let Some(source) = self.store.get(key).await? else {
            return Ok(RestoreOutcome::Missing {
                key: key.to_string(),
            });
        };

        let original = source
            .custom_metadata
            .get(ORIGINAL_KEY_ATTR)
            .map(|raw| clean_key(raw))
            .filter(|k| !k.is_empty())
            .or_else(|| original_key_from_trash(key))
            .unwrap_or_default();
        let original = ensure_safe_object_key(&original)
            .map_err(|reason| CoreError::invalid_key(original.clone(), reason))?;
        if is_trash_key(&original) {
            return Err(CoreError::invalid_key(original, KeyRejection::Reserved));
        }

        let target = self
            .free_key(original.clone(), |taken| restored_variant(taken, now))
            .await?;

        let mut custom = source.custom_metadata.clone();
        custom.remove(ORIGINAL_KEY_ATTR);
        custom.remove(DELETED_AT_ATTR);
        self.write_copy(&target, &source, custom).await?;
        self.store.delete(key).await?;

        debug!("restored {} -> {}", key, target);
        Ok(RestoreOutcome::Restored {
            from: key.to_string(),
            to: target,
            original,
        })
    }

    /// Permanently delete trashed keys in one store call. Keys outside the
    /// trash are refused before anything is deleted.
    pub async fn purge(&self, keys: &[String]) -> CoreResult<()> {
        if let Some(live) = keys.iter().find(|key| !is_trash_key(key)) {
            return Err(CoreError::invalid_key(live.clone(), KeyRejection::NotTrash));
        }
        self.store.delete_many(keys).await?;
        debug!("purged {} trashed objects", keys.len());
        Ok(())
    }

    /// Move `from` to `to` keeping content type and custom metadata.
    ///
    /// Does not check `to`; callers decide whether overwriting is allowed.
    pub async fn relocate(&self, from: &str, to: &str) -> CoreResult<()> {
        let Some(source) = self.store.get(from).await? else {
            return Err(CoreError::NotFound(from.to_string()));
        };
        self.write_copy(to, &source, source.custom_metadata.clone())
            .await?;
        self.store.delete(from).await?;
        debug!("relocated {} -> {}", from, to);
        Ok(())
    }

    async fn write_copy(
        &self,
        target: &str,
        source: &BlobObject,
        custom: CustomMetadata,
    ) -> CoreResult<()> {
        self.store
            .put(
                target,
                source.body.clone(),
                PutOptions {
                    http_metadata: Some(source.http_metadata.clone()),
                    custom_metadata: Some(custom),
                },
            )
            .await?;
        Ok(())
    }

    /// `preferred` if free, else its timestamped variant, else a numbered
    /// variant of that.
    async fn free_key<F>(&self, preferred: String, stamped: F) -> CoreResult<String>
    where
        F: FnOnce(&str) -> String,
    {
        if self.store.head(&preferred).await?.is_none() {
            return Ok(preferred);
        }
        let candidate = stamped(&preferred);
        warn!("{} is taken, trying {}", preferred, candidate);
        if self.store.head(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        for attempt in 2..=MAX_COUNTER_ATTEMPTS {
            let numbered = counter_variant(&candidate, attempt);
            if self.store.head(&numbered).await?.is_none() {
                return Ok(numbered);
            }
        }
        Err(CoreError::TargetExists(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::blob::HttpMetadata, services::blob_store::MemoryBlobStore};
    use bytes::Bytes;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn engine() -> (Arc<MemoryBlobStore>, TrashEngine) {
        let blobs = Arc::new(MemoryBlobStore::new());
        (blobs.clone(), TrashEngine::new(blobs))
    }

    async fn put_png(blobs: &MemoryBlobStore, key: &str, body: &'static [u8]) {
        let mut custom = CustomMetadata::new();
        custom.insert("uploader".into(), "admin".into());
        blobs
            .put(
                key,
                Bytes::from_static(body),
                PutOptions {
                    http_metadata: Some(HttpMetadata {
                        content_type: Some("image/png".into()),
                    }),
                    custom_metadata: Some(custom),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn trash_then_restore_is_identity() {
        let (blobs, trash) = engine();
        put_png(&blobs, "photos/cat.png", b"cat").await;

        let moved = trash.move_to_trash_at("photos/cat.png", now()).await.unwrap();
        let TrashOutcome::Moved { to, .. } = moved else {
            panic!("expected move, got {moved:?}");
        };
        assert_eq!(to, "trash/cat.png");
        assert!(blobs.get("photos/cat.png").await.unwrap().is_none());

        let trashed = blobs.get(&to).await.unwrap().unwrap();
        assert_eq!(trashed.custom_metadata[ORIGINAL_KEY_ATTR], "photos/cat.png");
        assert_eq!(trashed.custom_metadata[DELETED_AT_ATTR], "2026-05-01T12:00:00.000Z");
        assert_eq!(trashed.http_metadata.content_type.as_deref(), Some("image/png"));

        let restored = trash.restore_from_trash_at(&to, now()).await.unwrap();
        assert_eq!(
            restored,
            RestoreOutcome::Restored {
                from: "trash/cat.png".into(),
                to: "photos/cat.png".into(),
                original: "photos/cat.png".into(),
            }
        );
        let back = blobs.get("photos/cat.png").await.unwrap().unwrap();
        assert_eq!(&back.body[..], b"cat");
        assert!(!back.custom_metadata.contains_key(ORIGINAL_KEY_ATTR));
        assert!(!back.custom_metadata.contains_key(DELETED_AT_ATTR));
        assert_eq!(back.custom_metadata["uploader"], "admin");
        assert!(blobs.get("trash/cat.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn colliding_trash_names_stay_distinct() {
        let (blobs, trash) = engine();
        put_png(&blobs, "a/cat.png", b"first").await;
        put_png(&blobs, "b/cat.png", b"second").await;
        put_png(&blobs, "c/cat.png", b"third").await;

        let mut targets = Vec::new();
        for key in ["a/cat.png", "b/cat.png", "c/cat.png"] {
            match trash.move_to_trash_at(key, now()).await.unwrap() {
                TrashOutcome::Moved { to, .. } => targets.push(to),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            targets,
            [
                "trash/cat.png",
                "trash/cat__deleted_20260501T120000000Z.png",
                "trash/cat__deleted_20260501T120000000Z_2.png",
            ]
        );
        let bodies: Vec<_> = futures::future::join_all(targets.iter().map(|t| blobs.get(t)))
            .await
            .into_iter()
            .map(|obj| obj.unwrap().unwrap().body)
            .collect();
        assert_eq!(bodies, [&b"first"[..], &b"second"[..], &b"third"[..]]);
    }

    #[tokio::test]
    async fn trash_key_is_deleted_permanently() {
        let (blobs, trash) = engine();
        put_png(&blobs, "trash/old.png", b"old").await;
        let outcome = trash.move_to_trash("trash/old.png").await.unwrap();
        assert_eq!(outcome, TrashOutcome::Deleted { key: "trash/old.png".into() });
        assert!(blobs.is_empty().await);
    }

    #[tokio::test]
    async fn missing_and_not_trash_outcomes() {
        let (_, trash) = engine();
        assert_eq!(
            trash.move_to_trash("nope.png").await.unwrap(),
            TrashOutcome::Missing { key: "nope.png".into() }
        );
        assert_eq!(
            trash.restore_from_trash("photos/cat.png").await.unwrap(),
            RestoreOutcome::NotTrash { key: "photos/cat.png".into() }
        );
        assert_eq!(
            trash.restore_from_trash("trash/gone.png").await.unwrap(),
            RestoreOutcome::Missing { key: "trash/gone.png".into() }
        );
    }

    #[tokio::test]
    async fn restore_collision_gets_restored_suffix() {
        let (blobs, trash) = engine();
        put_png(&blobs, "photos/cat.png", b"old").await;
        trash.move_to_trash_at("photos/cat.png", now()).await.unwrap();
        put_png(&blobs, "photos/cat.png", b"new").await;

        let outcome = trash.restore_from_trash_at("trash/cat.png", now()).await.unwrap();
        let RestoreOutcome::Restored { to, original, .. } = outcome else {
            panic!("expected restore");
        };
        assert_eq!(original, "photos/cat.png");
        assert_eq!(to, "photos/cat__restored_20260501T120000000Z.png");
        assert_eq!(&blobs.get("photos/cat.png").await.unwrap().unwrap().body[..], b"new");
        assert_eq!(&blobs.get(&to).await.unwrap().unwrap().body[..], b"old");
    }

    #[tokio::test]
    async fn restore_without_attribute_derives_original_from_key() {
        let (blobs, trash) = engine();
        blobs
            .put(
                "trash/dog__deleted_20260101T000000000Z.jpg",
                Bytes::from_static(b"dog"),
                PutOptions::default(),
            )
            .await
            .unwrap();
        let outcome = trash
            .restore_from_trash("trash/dog__deleted_20260101T000000000Z.jpg")
            .await
            .unwrap();
        let RestoreOutcome::Restored { to, .. } = outcome else {
            panic!("expected restore");
        };
        assert_eq!(to, "dog.jpg");
    }

    #[tokio::test]
    async fn restore_refuses_tampered_original_key() {
        let (blobs, trash) = engine();
        let mut custom = CustomMetadata::new();
        custom.insert(ORIGINAL_KEY_ATTR.into(), ".config/image-meta.json".into());
        blobs
            .put(
                "trash/evil.json",
                Bytes::from_static(b"{}"),
                PutOptions {
                    http_metadata: None,
                    custom_metadata: Some(custom),
                },
            )
            .await
            .unwrap();
        let err = trash.restore_from_trash("trash/evil.json").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey { .. }));
        assert!(blobs.get("trash/evil.json").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn relocate_preserves_metadata() {
        let (blobs, trash) = engine();
        put_png(&blobs, "a.png", b"a").await;
        trash.relocate("a.png", "trips/a.png").await.unwrap();
        let moved = blobs.get("trips/a.png").await.unwrap().unwrap();
        assert_eq!(moved.http_metadata.content_type.as_deref(), Some("image/png"));
        assert_eq!(moved.custom_metadata["uploader"], "admin");
        assert!(blobs.get("a.png").await.unwrap().is_none());

        let err = trash.relocate("a.png", "b.png").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn exhausted_collision_counter_is_target_exists() {
        let (blobs, trash) = engine();
        put_png(&blobs, "cat.png", b"live").await;
        let stamped = deleted_variant("trash/cat.png", now());
        let mut taken = vec!["trash/cat.png".to_string(), stamped.clone()];
        taken.extend((2..=MAX_COUNTER_ATTEMPTS).map(|n| counter_variant(&stamped, n)));
        for key in &taken {
            put_png(&blobs, key, b"old").await;
        }

        let err = trash.move_to_trash_at("cat.png", now()).await.unwrap_err();

        assert!(matches!(&err, CoreError::TargetExists(key) if *key == stamped));
        assert!(!err.is_retryable());
        assert_eq!(&blobs.get("cat.png").await.unwrap().unwrap().body[..], b"live");
        assert_eq!(blobs.len().await, taken.len() + 1);
    }

    #[tokio::test]
    async fn purge_refuses_live_keys() {
        let (blobs, trash) = engine();
        put_png(&blobs, "trash/a.png", b"a").await;
        put_png(&blobs, "b.png", b"b").await;

        let err = trash
            .purge(&["trash/a.png".into(), "b.png".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey { .. }));
        assert_eq!(blobs.len().await, 2);

        trash.purge(&["trash/a.png".into(), "trash/gone.png".into()]).await.unwrap();
        assert_eq!(blobs.keys().await, ["b.png"]);
    }
}
