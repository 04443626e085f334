//! Folder registry and visible listings.
//!
//! Folders are implicit in object keys; the folder document additionally
//! remembers folders created explicitly, so empty ones survive.

use crate::{
    config::CoreContext,
    errors::{CoreError, CoreResult},
    models::{blob::ListPage, metadata::FolderMeta},
    services::keys::{
        KeyRejection, TRASH_PREFIX, clean_key, is_hidden_object_key, is_reserved_key, is_trash_key,
        is_valid_folder_path, normalize_folder_path,
    },
};
use std::collections::BTreeSet;

/// Whether `key` is shown in normal browsing.
pub fn is_visible_key(key: &str) -> bool {
    !is_reserved_key(key) && !is_hidden_object_key(key) && !is_trash_key(key)
}

fn is_trash_folder(folder: &str) -> bool {
    folder == TRASH_PREFIX.trim_end_matches('/') || is_trash_key(folder)
}

/// Register an explicit folder. Returns the normalized name.
pub async fn create_folder(ctx: &CoreContext, raw: &str) -> CoreResult<String> {
    let folder = normalize_folder_path(raw);
    if !is_valid_folder_path(&folder) {
        return Err(CoreError::invalid_key(raw, KeyRejection::InvalidFolderName));
    }
    if is_trash_folder(&folder) {
        return Err(CoreError::invalid_key(raw, KeyRejection::Reserved));
    }
    ctx.meta
        .update::<FolderMeta, _>(|meta| meta.add(&folder))
        .await?;
    Ok(folder)
}

/// Unregister an explicit folder that holds no objects.
pub async fn remove_folder(ctx: &CoreContext, raw: &str) -> CoreResult<bool> {
    let folder = clean_key(raw).trim_end_matches('/').to_string();
    if !is_valid_folder_path(&folder) {
        return Err(CoreError::invalid_key(raw, KeyRejection::InvalidFolderName));
    }
    let page = ctx
        .meta
        .list_objects_page(&format!("{folder}/"), None, 1)
        .await?;
    if !page.objects.is_empty() {
        return Err(CoreError::FolderNotEmpty(folder));
    }
    ctx.meta
        .update::<FolderMeta, _>(|meta| meta.remove(&folder))
        .await
}

/// Explicit folders plus every folder implied by a visible object key.
pub async fn list_folders(ctx: &CoreContext) -> CoreResult<Vec<String>> {
    let mut folders: BTreeSet<String> = ctx
        .meta
        .get_folder_meta()
        .await?
        .payload
        .folders
        .into_iter()
        .collect();

    for head in ctx.meta.list_all_objects("").await? {
        if !is_visible_key(&head.key) {
            continue;
        }
        let segments: Vec<&str> = head.key.split('/').collect();
        for depth in 1..segments.len() {
            folders.insert(segments[..depth].join("/"));
        }
    }
    Ok(folders.into_iter().collect())
}

/// One listing page with hidden and reserved keys removed. Trash entries are
/// only shown when listing under the trash root.
pub async fn list_visible_page(
    ctx: &CoreContext,
    prefix: &str,
    cursor: Option<String>,
    limit: usize,
) -> CoreResult<ListPage> {
    let prefix = clean_key(prefix);
    let in_trash = is_trash_key(&prefix);
    let mut page = ctx.meta.list_objects_page(&prefix, cursor, limit).await?;
    page.objects.retain(|obj| {
        !is_reserved_key(&obj.key)
            && !is_hidden_object_key(&obj.key)
            && (in_trash || !is_trash_key(&obj.key))
    });
    Ok(page)
}
