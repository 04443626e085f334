//! Typed access to the metadata documents with an optimistic version guard.
//!
//! `save` re-reads the stored version right before writing and refuses to
//! write a document whose in-memory version has fallen behind. The store has
//! no compare-and-swap, so a narrow window between the guard read and the
//! write remains; within this process the window is closed by a per-document
//! lock that `save` and `update` hold across read-guard-write.

use crate::{
    errors::{CoreError, CoreResult, StorageError},
    models::{
        blob::{BlobHead, ListOptions, ListPage, PutOptions},
        metadata::{
            DocumentPayload, FolderMetaDoc, HashMetaDoc, ImageMetaDoc, MaintenanceMeta,
            MaintenanceMetaDoc, ShareMetaDoc, Versioned,
        },
    },
    services::blob_store::{BlobStore, MAX_LIST_LIMIT, clamp_limit},
};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone)]
pub struct MetaStore {
    store: Arc<dyn BlobStore>,
    locks: Arc<Mutex<HashMap<&'static str, Arc<Mutex<()>>>>>,
}

impl MetaStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_document(&self, key: &'static str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Read and normalize a document. Absent or unparsable blobs yield the
    /// empty document at version 1.
    pub async fn load<P: DocumentPayload>(&self) -> CoreResult<Versioned<P>> {
        match self.store.get(P::KEY).await? {
            Some(obj) => Ok(Versioned::from_slice(&obj.body)),
            None => Ok(Versioned::empty()),
        }
    }

    /// Write `doc` through the version guard. On success `doc` carries the
    /// new version and `updatedAt`.
    pub async fn save<P: DocumentPayload>(&self, doc: &mut Versioned<P>) -> CoreResult<()> {
        let _guard = self.lock_document(P::KEY).await;
        self.save_locked(doc).await
    }

    async fn save_locked<P: DocumentPayload>(&self, doc: &mut Versioned<P>) -> CoreResult<()> {
        let current = self.load::<P>().await?.version;
        if doc.version < current {
            warn!(
                "rejecting write to {}: held version {}, stored version {}",
                P::KEY,
                doc.version,
                current
            );
            return Err(CoreError::VersionConflict {
                document: P::KEY.to_string(),
                held: doc.version,
                current,
            });
        }

        let mut staged = doc.clone();
        staged.version = current + 1;
        staged.updated_at = iso_timestamp(Utc::now());
        let body = serde_json::to_vec(&staged).map_err(StorageError::from)?;
        self.store
            .put(P::KEY, Bytes::from(body), PutOptions::json())
            .await?;

        debug!("saved {} at version {}", P::KEY, staged.version);
        *doc = staged;
        Ok(())
    }

    /// Read-modify-write under the document lock. `apply` returns whether it
    /// changed anything; unchanged documents are not written.
    pub async fn update<P, F>(&self, apply: F) -> CoreResult<bool>
    where
        P: DocumentPayload,
        F: FnOnce(&mut P) -> bool,
    {
        let _guard = self.lock_document(P::KEY).await;
        let mut doc = self.load::<P>().await?;
        if !apply(&mut doc.payload) {
            return Ok(false);
        }
        self.save_locked(&mut doc).await?;
        Ok(true)
    }

    pub async fn get_image_meta(&self) -> CoreResult<ImageMetaDoc> {
        self.load().await
    }

    pub async fn save_image_meta(&self, doc: &mut ImageMetaDoc) -> CoreResult<()> {
        self.save(doc).await
    }

    pub async fn get_hash_meta(&self) -> CoreResult<HashMetaDoc> {
        self.load().await
    }

    pub async fn save_hash_meta(&self, doc: &mut HashMetaDoc) -> CoreResult<()> {
        self.save(doc).await
    }

    pub async fn get_share_meta(&self) -> CoreResult<ShareMetaDoc> {
        self.load().await
    }

    pub async fn save_share_meta(&self, doc: &mut ShareMetaDoc) -> CoreResult<()> {
        self.save(doc).await
    }

    pub async fn get_folder_meta(&self) -> CoreResult<FolderMetaDoc> {
        self.load().await
    }

    pub async fn save_folder_meta(&self, doc: &mut FolderMetaDoc) -> CoreResult<()> {
        self.save(doc).await
    }

    pub async fn get_maintenance_meta(&self) -> CoreResult<MaintenanceMetaDoc> {
        self.load().await
    }

    pub async fn save_maintenance_meta(&self, doc: &mut MaintenanceMetaDoc) -> CoreResult<()> {
        self.save(doc).await
    }

    /// Stamp `job` as having run now.
    pub async fn record_job_run(&self, job: &str) -> CoreResult<String> {
        let stamp = iso_timestamp(Utc::now());
        let value = stamp.clone();
        self.update::<MaintenanceMeta, _>(|meta| {
            meta.jobs.insert(job.to_string(), value);
            true
        })
        .await?;
        Ok(stamp)
    }

    pub async fn last_job_run(&self, job: &str) -> CoreResult<Option<String>> {
        Ok(self.get_maintenance_meta().await?.payload.jobs.get(job).cloned())
    }

    /// Page through everything under `prefix`.
    pub async fn list_all_objects(&self, prefix: &str) -> CoreResult<Vec<BlobHead>> {
        let mut objects = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list(ListOptions {
                    prefix: Some(prefix.to_string()),
                    cursor,
                    limit: MAX_LIST_LIMIT,
                })
                .await?;
            objects.extend(page.objects);
            match page.cursor {
                Some(next) if page.truncated => cursor = Some(next),
                _ => break,
            }
        }
        Ok(objects)
    }

    /// One page under `prefix`; `limit` is clamped to `[1, 1000]`.
    pub async fn list_objects_page(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> CoreResult<ListPage> {
        let page = self
            .store
            .list(ListOptions {
                prefix: Some(prefix.to_string()),
                cursor,
                limit: clamp_limit(limit),
            })
            .await?;
        Ok(page)
    }
}
