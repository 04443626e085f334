//! src/services/disk_store.rs
//!
//! DiskBlobStore: a `BlobStore` backed by SQLite for the object index and
//! local disk for payloads. Payloads are sharded beneath
//! `base_path/{shard}/{shard}/{key}`; the index row carries content type,
//! custom metadata (JSON text), size, md5 etag and upload time.

use crate::{
    errors::{StorageError, StorageResult},
    models::blob::{
        BlobHead, BlobObject, CustomMetadata, HttpMetadata, ListOptions, ListPage, PutOptions,
        payload_etag,
    },
    services::blob_store::{BlobStore, clamp_limit, decode_cursor, encode_cursor},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow, Debug)]
struct ObjectRow {
    key: String,
    content_type: Option<String>,
    custom_metadata: String,
    size_bytes: i64,
    etag: String,
    uploaded_at: DateTime<Utc>,
}

impl ObjectRow {
    fn into_head(self) -> BlobHead {
        let custom_metadata: CustomMetadata = serde_json::from_str(&self.custom_metadata)
            .unwrap_or_else(|err| {
                warn!("discarding unreadable custom metadata for {}: {}", self.key, err);
                CustomMetadata::new()
            });
        BlobHead {
            key: self.key,
            size: self.size_bytes.max(0) as u64,
            etag: self.etag,
            uploaded: self.uploaded_at,
            http_metadata: HttpMetadata {
                content_type: self.content_type,
            },
            custom_metadata,
        }
    }
}

#[derive(Clone)]
pub struct DiskBlobStore {
    /// Shared SQLite connection pool used for the object index.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl DiskBlobStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn init_schema(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Reject keys that could escape `base_path` on disk.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_row(&self, key: &str) -> StorageResult<Option<ObjectRow>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT key, content_type, custom_metadata, size_bytes, etag, uploaded_at
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Write the payload to a temp file beside its final location and fsync
    /// it. The caller decides when the staged file replaces the live one.
    async fn stage_payload(&self, file_path: &Path, body: &[u8]) -> StorageResult<PathBuf> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written: io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(tmp_path)
    }

    /// Move the live payload aside and rename `staged` into its place.
    /// Returns where the previous payload went, if there was one.
    async fn swap_in_payload(
        &self,
        staged: &Path,
        file_path: &Path,
    ) -> StorageResult<Option<PathBuf>> {
        let aside = file_path.with_file_name(format!(".prev-{}", Uuid::new_v4()));
        let previous = match fs::rename(file_path, &aside).await {
            Ok(()) => Some(aside),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(StorageError::Io(err)),
        };
        if let Err(err) = fs::rename(staged, file_path).await {
            if let Some(previous) = &previous {
                let _ = fs::rename(previous, file_path).await;
            }
            return Err(StorageError::Io(err));
        }
        Ok(previous)
    }

    /// Undo [`Self::swap_in_payload`] after the index update failed.
    async fn restore_previous_payload(&self, file_path: &Path, previous: Option<PathBuf>) {
        let restored = match &previous {
            Some(previous) => fs::rename(previous, file_path).await,
            None => fs::remove_file(file_path).await,
        };
        if let Err(err) = restored {
            warn!("could not roll back payload at {}: {}", file_path.display(), err);
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn get(&self, key: &str) -> StorageResult<Option<BlobObject>> {
        self.ensure_key_safe(key)?;
        let Some(row) = self.fetch_row(key).await? else {
            return Ok(None);
        };

        let file_path = self.object_path(key);
        let body = match fs::read(&file_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("index row for {} has no payload at {}", key, file_path.display());
                return Ok(None);
            }
            Err(err) => return Err(StorageError::Io(err)),
        };

        let head = row.into_head();
        Ok(Some(BlobObject {
            key: head.key,
            body,
            http_metadata: head.http_metadata,
            custom_metadata: head.custom_metadata,
            size: head.size,
            etag: head.etag,
            uploaded: head.uploaded,
        }))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<BlobHead>> {
        self.ensure_key_safe(key)?;
        Ok(self.fetch_row(key).await?.map(ObjectRow::into_head))
    }

    /// Overwrites any existing object at `key`.
    ///
    /// The index row is written inside a transaction and the new payload is
    /// swapped in before commit. Until the commit succeeds the previous
    /// payload is kept aside, so a failed overwrite leaves the old object
    /// readable.
    async fn put(&self, key: &str, body: Bytes, opts: PutOptions) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let custom = serde_json::to_string(&opts.custom_metadata.unwrap_or_default())?;
        let content_type = opts.http_metadata.and_then(|m| m.content_type);
        let etag = payload_etag(&body);

        let staged = self.stage_payload(&file_path, &body).await?;
        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let _ = fs::remove_file(&staged).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (key, content_type, custom_metadata, size_bytes, etag, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                custom_metadata = excluded.custom_metadata,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(key)
        .bind(content_type)
        .bind(custom)
        .bind(body.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;
        if let Err(err) = upsert {
            let _ = fs::remove_file(&staged).await;
            return Err(StorageError::Sqlx(err));
        }

        let previous = match self.swap_in_payload(&staged, &file_path).await {
            Ok(previous) => previous,
            Err(err) => {
                let _ = fs::remove_file(&staged).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            self.restore_previous_payload(&file_path, previous).await;
            return Err(StorageError::Sqlx(err));
        }
        if let Some(previous) = previous {
            if let Err(err) = fs::remove_file(&previous).await {
                debug!("left stale payload {}: {}", previous.display(), err);
            }
        }

        debug!("stored {} ({} bytes, etag {})", key, body.len(), etag);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> StorageResult<ListPage> {
        let limit = clamp_limit(opts.limit);
        let fetch_limit = limit + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, content_type, custom_metadata, size_bytes, etag, uploaded_at \
             FROM objects WHERE 1 = 1",
        );

        if let Some(prefix) = opts.prefix.as_deref().filter(|p| !p.is_empty()) {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.to_string());
        }

        if let Some(cursor) = opts.cursor.as_deref() {
            builder.push(" AND key > ");
            builder.push_bind(decode_cursor(cursor)?);
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        let truncated = rows.len() == fetch_limit;
        if truncated {
            rows.pop();
        }
        let cursor = if truncated {
            rows.last().map(|row| encode_cursor(&row.key))
        } else {
            None
        };

        Ok(ListPage {
            objects: rows.into_iter().map(ObjectRow::into_head).collect(),
            truncated,
            cursor,
        })
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::metadata::{ImageEntry, ImageMeta},
        services::meta_store::MetaStore,
    };
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;

    const REFUSE_UPDATES: &str = "CREATE TRIGGER refuse_updates BEFORE UPDATE ON objects \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END";
    const ALLOW_UPDATES: &str = "DROP TRIGGER refuse_updates";

    async fn disk_store(dir: &Path) -> DiskBlobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = DiskBlobStore::new(Arc::new(pool), dir);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn put_get_roundtrip_preserves_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;

        let mut custom = BTreeMap::new();
        custom.insert("trash-original-key".to_string(), "photos/cat.png".to_string());
        store
            .put(
                "trash/cat.png",
                Bytes::from_static(b"png-bytes"),
                PutOptions {
                    http_metadata: Some(HttpMetadata {
                        content_type: Some("image/png".into()),
                    }),
                    custom_metadata: Some(custom.clone()),
                },
            )
            .await
            .unwrap();

        let obj = store.get("trash/cat.png").await.unwrap().unwrap();
        assert_eq!(&obj.body[..], b"png-bytes");
        assert_eq!(obj.size, 9);
        assert_eq!(obj.http_metadata.content_type.as_deref(), Some("image/png"));
        assert_eq!(obj.custom_metadata, custom);
        assert_eq!(obj.etag, payload_etag(b"png-bytes"));
        assert_eq!(store.head("trash/cat.png").await.unwrap().unwrap().etag, obj.etag);
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_previous_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;
        store
            .put("doc.json", Bytes::from_static(b"old"), PutOptions::json())
            .await
            .unwrap();

        sqlx::query(REFUSE_UPDATES).execute(&*store.db).await.unwrap();
        let err = store
            .put("doc.json", Bytes::from_static(b"new"), PutOptions::json())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlx(_)));

        let obj = store.get("doc.json").await.unwrap().unwrap();
        assert_eq!(&obj.body[..], b"old");
        assert_eq!(obj.etag, payload_etag(b"old"));
        let parent = store.object_path("doc.json").parent().unwrap().to_path_buf();
        assert_eq!(std::fs::read_dir(parent).unwrap().count(), 1);

        sqlx::query(ALLOW_UPDATES).execute(&*store.db).await.unwrap();
        store
            .put("doc.json", Bytes::from_static(b"new"), PutOptions::json())
            .await
            .unwrap();
        let obj = store.get("doc.json").await.unwrap().unwrap();
        assert_eq!(&obj.body[..], b"new");
    }

    #[tokio::test]
    async fn metadata_document_survives_failed_save() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(disk_store(tmp.path()).await);
        let meta = MetaStore::new(store.clone());
        for key in ["a.png", "b.png", "c.png"] {
            meta.update::<ImageMeta, _>(|m| {
                m.set(
                    key,
                    ImageEntry {
                        tags: vec!["red".into()],
                        favorite: false,
                    },
                )
            })
            .await
            .unwrap();
        }

        sqlx::query(REFUSE_UPDATES).execute(&*store.db).await.unwrap();
        let err = meta
            .update::<ImageMeta, _>(|m| m.images.remove("a.png").is_some())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        sqlx::query(ALLOW_UPDATES).execute(&*store.db).await.unwrap();

        let doc = meta.get_image_meta().await.unwrap();
        assert_eq!(doc.version, 4);
        assert_eq!(doc.payload.images.len(), 3);
    }

    #[tokio::test]
    async fn malformed_cursor_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;
        let err = store
            .list(ListOptions {
                prefix: None,
                cursor: Some("!!!not-base64".into()),
                limit: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn delete_removes_row_and_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;
        store
            .put("a/b.png", Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
        let path = store.object_path("a/b.png");
        assert!(path.exists());

        store.delete("a/b.png").await.unwrap();
        assert!(!path.exists());
        assert!(store.head("a/b.png").await.unwrap().is_none());
        // second delete is a no-op
        store.delete("a/b.png").await.unwrap();
    }

    #[tokio::test]
    async fn list_respects_prefix_and_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;
        for key in ["p_1/a.png", "p_1/b.png", "p_1/c.png", "p21/x.png"] {
            store
                .put(key, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }

        let page = store
            .list(ListOptions {
                prefix: Some("p_1/".into()),
                cursor: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.truncated);

        let rest = store
            .list(ListOptions {
                prefix: Some("p_1/".into()),
                cursor: page.cursor,
                limit: 2,
            })
            .await
            .unwrap();
        let keys: Vec<_> = rest.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p_1/c.png"]);
        assert!(!rest.truncated);
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = disk_store(tmp.path()).await;
        let err = store
            .put("../escape", Bytes::new(), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidObjectKey));
    }
}
