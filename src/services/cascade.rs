//! Cascade coordinator: runs a batch of object-store actions and then
//! carries the resulting key changes into every metadata document that
//! references those keys.
//!
//! Object-store state is authoritative. Once an item's blob has moved, a
//! failure to update a metadata document is reported as a
//! [`CascadeWarning`] on the result and logged; it never turns the item
//! into a failure and nothing is rolled back.
//!
//! Each affected document is read and written once per batch, after all
//! item actions have finished, and only if something in it changed.

use crate::{
    config::CoreContext,
    errors::CoreError,
    models::{
        metadata::{
            DocumentPayload, FolderMeta, HashMeta, ImageEntry, ImageMeta, KeyedIndex, ShareMeta,
            clean_tags,
        },
        operation::{CascadeWarning, OperationReport},
    },
    services::{
        keys::{
            base_name, clean_key, ensure_safe_object_key, is_trash_key, is_valid_folder_path,
            join_key,
        },
        tracker::BatchTracker,
        trash::{RestoreOutcome, TrashOutcome},
    },
};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// A key change produced by a successful item action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    Moved { from: String, to: String },
    Removed { key: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameItem {
    pub from: String,
    pub to: String,
}

/// Tag edits applied by [`retag_objects`]: `replace`, then `remove`, then
/// `add`, then `favorite`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetagOptions {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    pub replace: Option<Vec<String>>,
    pub favorite: Option<bool>,
}

impl RetagOptions {
    fn apply(&self, entry: &mut ImageEntry) {
        if let Some(replace) = &self.replace {
            entry.tags = clean_tags(replace);
        }
        let remove = clean_tags(&self.remove);
        entry.tags.retain(|tag| !remove.contains(tag));
        for tag in clean_tags(&self.add) {
            if !entry.tags.contains(&tag) {
                entry.tags.push(tag);
            }
        }
        if let Some(favorite) = self.favorite {
            entry.favorite = favorite;
        }
    }
}

/// Validate and deduplicate input keys. Invalid and repeated keys are
/// recorded as skipped; the cleaned survivors are returned in input order.
fn validate_keys(tracker: &mut BatchTracker, keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut valid = Vec::with_capacity(keys.len());
    for raw in keys {
        match ensure_safe_object_key(raw) {
            Err(reason) => tracker.add_skipped(raw, Some(&reason.to_string())),
            Ok(key) if !seen.insert(key.clone()) => {
                tracker.add_skipped(raw, Some("duplicate key"))
            }
            Ok(key) => valid.push(key),
        }
    }
    valid
}

/// Apply `changes` to one keyed document in a single read-modify-write.
async fn cascade_document<P>(
    ctx: &CoreContext,
    changes: &[KeyChange],
) -> Option<CascadeWarning>
where
    P: DocumentPayload + KeyedIndex,
{
    let result = ctx
        .meta
        .update::<P, _>(|payload| {
            let mut changed = false;
            for change in changes {
                changed |= match change {
                    KeyChange::Moved { from, to } => payload.migrate_key(from, to),
                    KeyChange::Removed { key } => payload.remove_key(key),
                };
            }
            changed
        })
        .await;
    result.err().map(|err| degrade(P::KEY, &err))
}

/// Invalid keys are the caller's to correct and count as skipped; every
/// other error fails the item.
fn record_error(tracker: &mut BatchTracker, key: &str, err: CoreError) {
    match err {
        CoreError::InvalidKey { .. } => tracker.add_skipped(key, Some(&err.to_string())),
        err => tracker.add_failed(key, &err, err.is_retryable()),
    }
}

fn degrade(document: &str, err: &CoreError) -> CascadeWarning {
    warn!("metadata cascade to {} degraded: {}", document, err);
    CascadeWarning {
        document: document.to_string(),
        error: err.to_string(),
        retryable: err.is_retryable(),
    }
}

/// Carry key changes into image, hash and share metadata.
///
/// Image and hash entries move with their key and are dropped on
/// permanent delete. Share item lists are re-pointed old→new so a share
/// keeps following its files. The three documents are independent and are
/// updated concurrently.
pub async fn apply_key_changes(
    ctx: &CoreContext,
    changes: &[KeyChange],
) -> Vec<CascadeWarning> {
    if changes.is_empty() {
        return Vec::new();
    }
    let (images, hashes, shares) = futures::join!(
        cascade_document::<ImageMeta>(ctx, changes),
        cascade_document::<HashMeta>(ctx, changes),
        cascade_document::<ShareMeta>(ctx, changes),
    );
    [images, hashes, shares].into_iter().flatten().collect()
}

fn finish(
    operation: &str,
    tracker: BatchTracker,
    counts: &[(&'static str, usize)],
    warnings: Vec<CascadeWarning>,
) -> OperationReport {
    let result = tracker.result();
    info!(
        "{} {} finished: {} ok, {} failed, {} skipped, {} metadata warnings in {}ms",
        operation,
        result.operation_id,
        result.succeeded,
        result.failed,
        result.skipped,
        warnings.len(),
        result.duration_ms
    );
    OperationReport {
        result,
        counts: counts.iter().copied().collect::<BTreeMap<_, _>>(),
        warnings,
    }
}

/// Move live objects to the trash; keys already in the trash are deleted
/// permanently, all in one store call after the live keys are handled.
pub async fn delete_objects(ctx: &CoreContext, keys: &[String]) -> OperationReport {
    let mut tracker = BatchTracker::new(None);
    let mut changes = Vec::new();
    let mut purge = Vec::new();
    let (mut trashed, mut deleted) = (0, 0);

    for key in validate_keys(&mut tracker, keys) {
        tracker.begin(&key);
        if is_trash_key(&key) {
            purge.push(key);
            continue;
        }
        match ctx.trash.move_to_trash(&key).await {
            Ok(TrashOutcome::Moved { from, to }) => {
                tracker.add_success(
                    &key,
                    Some(json!({ "action": "moved", "from": from, "to": to })),
                );
                changes.push(KeyChange::Moved { from, to });
                trashed += 1;
            }
            Ok(TrashOutcome::Deleted { key: removed }) => {
                tracker.add_success(
                    &key,
                    Some(json!({ "action": "deleted", "key": removed })),
                );
                changes.push(KeyChange::Removed { key: removed });
                deleted += 1;
            }
            Ok(TrashOutcome::Missing { .. }) => {
                tracker.add_failed(&key, CoreError::NotFound(key.clone()), false)
            }
            Err(err) => record_error(&mut tracker, &key, err),
        }
    }

    if !purge.is_empty() {
        match ctx.trash.purge(&purge).await {
            Ok(()) => {
                for key in purge {
                    tracker.add_success(
                        &key,
                        Some(json!({ "action": "deleted", "key": key })),
                    );
                    changes.push(KeyChange::Removed { key });
                    deleted += 1;
                }
            }
            Err(err) => {
                for key in &purge {
                    tracker.add_failed(key, &err, err.is_retryable());
                }
            }
        }
    }

    let warnings = apply_key_changes(ctx, &changes).await;
    finish(
        "delete",
        tracker,
        &[("trashed", trashed), ("deleted", deleted)],
        warnings,
    )
}

/// Bring trashed objects back to their original keys.
pub async fn restore_objects(ctx: &CoreContext, keys: &[String]) -> OperationReport {
    let mut tracker = BatchTracker::new(None);
    let mut changes = Vec::new();
    let mut restored = 0;

    for key in validate_keys(&mut tracker, keys) {
        tracker.begin(&key);
        match ctx.trash.restore_from_trash(&key).await {
            Ok(RestoreOutcome::Restored { from, to, original }) => {
                tracker.add_success(
                    &key,
                    Some(json!({
                        "action": "restored",
                        "from": from,
                        "to": to,
                        "original": original,
                    })),
                );
                changes.push(KeyChange::Moved { from, to });
                restored += 1;
            }
            Ok(RestoreOutcome::NotTrash { .. }) => tracker.add_skipped(&key, Some("not in trash")),
            Ok(RestoreOutcome::Missing { .. }) => {
                tracker.add_failed(&key, CoreError::NotFound(key.clone()), false)
            }
            Err(err) => record_error(&mut tracker, &key, err),
        }
    }

    let warnings = apply_key_changes(ctx, &changes).await;
    finish("restore", tracker, &[("restored", restored)], warnings)
}

/// Plan and run a set of `(from, to)` relocations.
///
/// Planning happens before any mutation: identical pairs, trashed sources
/// and a second claim on the same target are skipped. Execution checks each
/// target and fails the item, non-retryably, if it already exists.
async fn relocate_all(
    ctx: &CoreContext,
    tracker: &mut BatchTracker,
    pairs: Vec<(String, String)>,
) -> Vec<KeyChange> {
    let mut claimed = HashSet::new();
    let mut planned = Vec::with_capacity(pairs.len());
    for (from, to) in pairs {
        if from == to {
            tracker.add_skipped(&from, Some("source and target are the same"));
        } else if is_trash_key(&from) || is_trash_key(&to) {
            tracker.add_skipped(&from, Some("trash entries are moved by delete and restore"));
        } else if !claimed.insert(to.clone()) {
            tracker.add_skipped(&from, Some(&format!("duplicate target `{to}`")));
        } else {
            tracker.begin(&from);
            planned.push((from, to));
        }
    }

    let mut changes = Vec::new();
    for (from, to) in planned {
        match ctx.store.head(&to).await {
            Ok(Some(_)) => {
                tracker.add_failed(&from, CoreError::TargetExists(to), false);
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                record_error(tracker, &from, err.into());
                continue;
            }
        }
        match ctx.trash.relocate(&from, &to).await {
            Ok(()) => {
                tracker.add_success(&from, Some(json!({ "from": from, "to": to })));
                changes.push(KeyChange::Moved { from, to });
            }
            Err(err) => record_error(tracker, &from, err),
        }
    }
    changes
}

/// Move objects into `target_folder` (empty string for the root), keeping
/// their file names.
pub async fn move_objects(
    ctx: &CoreContext,
    keys: &[String],
    target_folder: &str,
) -> OperationReport {
    let mut tracker = BatchTracker::new(None);
    let folder = clean_key(target_folder).trim_end_matches('/').to_string();

    if !folder.is_empty()
        && (!is_valid_folder_path(&folder) || is_trash_key(&format!("{folder}/")))
    {
        let reason = format!("invalid target folder `{target_folder}`");
        for key in keys {
            tracker.add_skipped(key, Some(&reason));
        }
        return finish("move", tracker, &[("moved", 0)], Vec::new());
    }

    let pairs = validate_keys(&mut tracker, keys)
        .into_iter()
        .map(|key| {
            let target = join_key(&folder, base_name(&key));
            (key, target)
        })
        .collect();
    let changes = relocate_all(ctx, &mut tracker, pairs).await;
    let moved = changes.len();

    let mut warnings = apply_key_changes(ctx, &changes).await;
    if moved > 0 && !folder.is_empty() {
        if let Err(err) = ctx
            .meta
            .update::<FolderMeta, _>(|meta| meta.add(&folder))
            .await
        {
            warnings.push(degrade(FolderMeta::KEY, &err));
        }
    }
    finish("move", tracker, &[("moved", moved)], warnings)
}

/// Rename objects to explicit target keys.
pub async fn rename_objects(ctx: &CoreContext, items: &[RenameItem]) -> OperationReport {
    let mut tracker = BatchTracker::new(None);
    let mut sources = HashSet::new();
    let mut pairs = Vec::with_capacity(items.len());

    for item in items {
        let from = match ensure_safe_object_key(&item.from) {
            Ok(from) => from,
            Err(reason) => {
                tracker.add_skipped(&item.from, Some(&reason.to_string()));
                continue;
            }
        };
        let to = match ensure_safe_object_key(&item.to) {
            Ok(to) => to,
            Err(reason) => {
                tracker.add_skipped(&from, Some(&format!("invalid target: {reason}")));
                continue;
            }
        };
        if !sources.insert(from.clone()) {
            tracker.add_skipped(&from, Some("duplicate key"));
            continue;
        }
        pairs.push((from, to));
    }

    let changes = relocate_all(ctx, &mut tracker, pairs).await;
    let renamed = changes.len();
    let warnings = apply_key_changes(ctx, &changes).await;
    finish("rename", tracker, &[("renamed", renamed)], warnings)
}

/// Edit tags and the favorite flag of existing objects.
///
/// Here the metadata write is the operation itself, so a failed save fails
/// every item that reached it.
pub async fn retag_objects(
    ctx: &CoreContext,
    keys: &[String],
    opts: &RetagOptions,
) -> OperationReport {
    let mut tracker = BatchTracker::new(None);
    let mut pending = Vec::new();

    for key in validate_keys(&mut tracker, keys) {
        match ctx.store.head(&key).await {
            Ok(Some(_)) => {
                tracker.begin(&key);
                pending.push(key);
            }
            Ok(None) => tracker.add_failed(&key, CoreError::NotFound(key.clone()), false),
            Err(err) => record_error(&mut tracker, &key, err.into()),
        }
    }

    let mut entries = Vec::with_capacity(pending.len());
    let saved = if pending.is_empty() {
        Ok(false)
    } else {
        ctx.meta
            .update::<ImageMeta, _>(|meta| {
                let mut changed = false;
                for key in &pending {
                    let mut entry = meta.get(key).cloned().unwrap_or_default();
                    opts.apply(&mut entry);
                    changed |= meta.set(key, entry.clone());
                    entries.push(entry);
                }
                changed
            })
            .await
    };

    let updated = match saved {
        Ok(_) => {
            for (key, entry) in pending.iter().zip(&entries) {
                tracker.add_success(
                    key,
                    Some(json!({ "tags": entry.tags, "favorite": entry.favorite })),
                );
            }
            pending.len()
        }
        Err(err) => {
            warn!("retag could not save {}: {}", ImageMeta::KEY, err);
            for key in &pending {
                tracker.add_failed(key, &err, err.is_retryable());
            }
            0
        }
    };

    finish("retag", tracker, &[("updated", updated)], Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            blob::{CustomMetadata, PutOptions},
            metadata::HashEntry,
            operation::ItemStatus,
        },
        services::{
            blob_store::{BlobStore, MemoryBlobStore},
            trash::ORIGINAL_KEY_ATTR,
        },
    };
    use bytes::Bytes;
    use std::sync::Arc;

    async fn context(keys: &[&str]) -> (Arc<MemoryBlobStore>, CoreContext) {
        let blobs = Arc::new(MemoryBlobStore::new());
        for key in keys {
            blobs
                .put(key, Bytes::from(key.to_string()), PutOptions::default())
                .await
                .unwrap();
        }
        (blobs.clone(), CoreContext::new(blobs))
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn validation_skips_invalid_and_duplicate_keys() {
        let (_, ctx) = context(&["a.png"]).await;
        let report =
            delete_objects(&ctx, &keys(&["a.png", "/a.png", ".config/x.json", "../b"])).await;
        assert_eq!(report.result.succeeded, 1);
        assert_eq!(report.result.skipped, 3);
        assert!(report.result.ok);
        assert_eq!(report.count("trashed"), 1);
    }

    #[tokio::test]
    async fn delete_missing_is_a_non_retryable_failure() {
        let (_, ctx) = context(&[]).await;
        let report = delete_objects(&ctx, &keys(&["ghost.png"])).await;
        assert!(!report.result.ok);
        assert_eq!(report.result.failed, 1);
        assert!(report.result.retryable.is_empty());
    }

    #[tokio::test]
    async fn permanent_delete_drops_metadata_entries() {
        let (_, ctx) = context(&["trash/a.png"]).await;
        ctx.meta
            .update::<HashMeta, _>(|m| {
                m.hashes.insert(
                    "trash/a.png".into(),
                    HashEntry {
                        hash: "ab".into(),
                        size: Some(1),
                        uploaded_at: None,
                    },
                );
                true
            })
            .await
            .unwrap();

        let report = delete_objects(&ctx, &keys(&["trash/a.png"])).await;
        assert_eq!(report.count("deleted"), 1);
        assert_eq!(report.count("trashed"), 0);
        let hashes = ctx.meta.get_hash_meta().await.unwrap();
        assert!(hashes.payload.hashes.is_empty());
    }

    #[tokio::test]
    async fn restore_skips_live_keys() {
        let (_, ctx) = context(&["a.png"]).await;
        let report = restore_objects(&ctx, &keys(&["a.png"])).await;
        assert_eq!(report.result.skipped, 1);
        assert_eq!(report.result.details[0].status, ItemStatus::Skipped);
        assert!(report.result.ok);
    }

    #[tokio::test]
    async fn move_into_folder_registers_folder_and_migrates_meta() {
        let (blobs, ctx) = context(&["a.png", "b.png"]).await;
        ctx.meta
            .update::<ImageMeta, _>(|m| {
                m.set(
                    "a.png",
                    ImageEntry {
                        tags: vec!["red".into()],
                        favorite: false,
                    },
                )
            })
            .await
            .unwrap();

        let report = move_objects(&ctx, &keys(&["a.png", "b.png"]), "trips/2026").await;
        assert_eq!(report.count("moved"), 2);
        assert!(blobs.head("trips/2026/a.png").await.unwrap().is_some());
        assert!(blobs.head("a.png").await.unwrap().is_none());

        let images = ctx.meta.get_image_meta().await.unwrap();
        assert!(images.payload.get("a.png").is_none());
        assert_eq!(images.payload.get("trips/2026/a.png").unwrap().tags, ["red"]);
        let folders = ctx.meta.get_folder_meta().await.unwrap();
        assert!(folders.payload.contains("trips/2026"));
    }

    #[tokio::test]
    async fn move_rejects_invalid_folder_without_touching_store() {
        let (blobs, ctx) = context(&["a.png"]).await;
        for folder in ["bad folder!", "trash", "trash/x"] {
            let report = move_objects(&ctx, &keys(&["a.png"]), folder).await;
            assert_eq!(report.result.skipped, 1, "folder {folder}");
        }
        assert!(blobs.head("a.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn move_to_same_place_is_skipped() {
        let (_, ctx) = context(&["trips/a.png"]).await;
        let report = move_objects(&ctx, &keys(&["trips/a.png"]), "trips").await;
        assert_eq!(report.result.skipped, 1);
        assert_eq!(report.count("moved"), 0);
    }

    #[tokio::test]
    async fn unchanged_documents_are_not_rewritten() {
        let (_, ctx) = context(&["a.png"]).await;
        delete_objects(&ctx, &keys(&["a.png"])).await;
        assert_eq!(ctx.meta.get_image_meta().await.unwrap().version, 1);
        assert_eq!(ctx.meta.get_share_meta().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn retag_applies_edits_in_order() {
        let (_, ctx) = context(&["a.png", "b.png"]).await;
        let opts = RetagOptions {
            add: vec!["blue".into(), " red ".into()],
            remove: vec!["old".into()],
            replace: Some(vec!["old".into(), "red".into()]),
            favorite: Some(true),
        };
        let report = retag_objects(&ctx, &keys(&["a.png", "missing.png"]), &opts).await;
        assert_eq!(report.count("updated"), 1);
        assert_eq!(report.result.failed, 1);
        assert!(report.result.retryable.is_empty());

        let images = ctx.meta.get_image_meta().await.unwrap();
        let entry = images.payload.get("a.png").unwrap();
        assert_eq!(entry.tags, ["red", "blue"]);
        assert!(entry.favorite);

        let clear = RetagOptions {
            replace: Some(Vec::new()),
            favorite: Some(false),
            ..RetagOptions::default()
        };
        retag_objects(&ctx, &keys(&["a.png"]), &clear).await;
        let images = ctx.meta.get_image_meta().await.unwrap();
        assert!(images.payload.get("a.png").is_none());
    }

    #[tokio::test]
    async fn restore_with_tampered_original_is_skipped() {
        let (blobs, ctx) = context(&[]).await;
        for (key, original) in [("trash/a.png", "../etc/a.png"), ("trash/b.png", "trash/b.png")] {
            let mut custom = CustomMetadata::new();
            custom.insert(ORIGINAL_KEY_ATTR.into(), original.into());
            blobs
                .put(
                    key,
                    Bytes::from_static(b"x"),
                    PutOptions {
                        http_metadata: None,
                        custom_metadata: Some(custom),
                    },
                )
                .await
                .unwrap();
        }

        let report = restore_objects(&ctx, &keys(&["trash/a.png", "trash/b.png"])).await;

        assert!(report.result.ok);
        assert_eq!(report.result.skipped, 2);
        assert_eq!(report.result.failed, 0);
        assert!(report.result.retryable.is_empty());
        assert_eq!(report.count("restored"), 0);
        assert!(
            report
                .result
                .details
                .iter()
                .all(|d| d.status == ItemStatus::Skipped && d.error.is_some())
        );
        assert_eq!(blobs.keys().await, ["trash/a.png", "trash/b.png"]);
    }

    #[tokio::test]
    async fn delete_purges_trashed_keys_in_request_order() {
        let (blobs, ctx) = context(&["trash/old.png", "a.png", "trash/older.png"]).await;

        let report =
            delete_objects(&ctx, &keys(&["trash/old.png", "a.png", "trash/older.png"])).await;

        assert!(report.result.ok);
        assert_eq!(report.count("deleted"), 2);
        assert_eq!(report.count("trashed"), 1);
        let order: Vec<_> = report.result.details.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(order, ["trash/old.png", "a.png", "trash/older.png"]);
        assert_eq!(report.result.details[0].data.as_ref().unwrap()["action"], "deleted");
        assert_eq!(blobs.keys().await, ["trash/a.png"]);
    }
}
