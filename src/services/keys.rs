//! Object key namespace: the legal shape of keys, reserved and hidden
//! prefixes, and the trash/restore key derivation scheme.
//!
//! Everything here is pure and synchronous. The cascade coordinator and the
//! HTTP layer both call into this module, so there is exactly one definition
//! of what a valid key looks like.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Root under which metadata documents and other internal config live.
pub const CONFIG_PREFIX: &str = ".config/";
/// Root under which soft-deleted objects are parked.
pub const TRASH_PREFIX: &str = "trash/";
/// Generated thumbnails; hidden, but writable by the thumbnail upload path.
pub const THUMBS_PREFIX: &str = ".thumbs/";

pub const DELETED_MARKER: &str = "__deleted_";
pub const RESTORED_MARKER: &str = "__restored_";

const MAX_FILE_NAME_LEN: usize = 255;

/// Why a key was refused by [`ensure_safe_object_key`] or [`ensure_safe_upload_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRejection {
    #[error("key is empty")]
    Empty,
    #[error("key contains a path traversal segment")]
    PathTraversal,
    #[error("key contains control characters or backslashes")]
    InvalidCharacter,
    #[error("key falls under the reserved configuration root")]
    Reserved,
    #[error("key contains a hidden segment")]
    Hidden,
    #[error("folder names must match [A-Za-z0-9][A-Za-z0-9_-]* per segment")]
    InvalidFolderName,
    #[error("key is not in the trash")]
    NotTrash,
}

/// Trim whitespace, strip leading slashes and collapse repeated slashes.
pub fn clean_key(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('/');
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// True if `key` is the configuration root itself or anything beneath it.
pub fn is_reserved_key(key: &str) -> bool {
    key == CONFIG_PREFIX.trim_end_matches('/') || key.starts_with(CONFIG_PREFIX)
}

/// True if any path segment of `key` starts with a dot.
pub fn is_hidden_object_key(key: &str) -> bool {
    key.split('/').any(|segment| segment.starts_with('.'))
}

pub fn is_trash_key(key: &str) -> bool {
    key.starts_with(TRASH_PREFIX)
}

/// Validate a key that must never touch internal config or hidden assets.
///
/// The key is cleaned first; on success the cleaned form is returned.
pub fn ensure_safe_object_key(raw: &str) -> Result<String, KeyRejection> {
    let key = clean_key(raw);
    if key.is_empty() {
        return Err(KeyRejection::Empty);
    }
    if key.contains("..") {
        return Err(KeyRejection::PathTraversal);
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(KeyRejection::InvalidCharacter);
    }
    if is_reserved_key(&key) {
        return Err(KeyRejection::Reserved);
    }
    if is_hidden_object_key(&key) {
        return Err(KeyRejection::Hidden);
    }
    Ok(key)
}

/// Like [`ensure_safe_object_key`], but admits keys under `.thumbs/` when
/// `allow_thumbs` is set. The remainder after the prefix must itself be safe.
pub fn ensure_safe_upload_key(raw: &str, allow_thumbs: bool) -> Result<String, KeyRejection> {
    let key = clean_key(raw);
    if allow_thumbs {
        if let Some(rest) = key.strip_prefix(THUMBS_PREFIX) {
            ensure_safe_object_key(rest)?;
            return Ok(key);
        }
    }
    ensure_safe_object_key(&key)
}

fn is_folder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Replace characters outside `[A-Za-z0-9_-]` with `-` and drop leading
/// characters that cannot start a segment.
pub fn normalize_folder_segment(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .chars()
        .map(|c| if is_folder_char(c) { c } else { '-' })
        .collect();
    replaced
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// `[A-Za-z0-9][A-Za-z0-9_-]*`
pub fn is_valid_folder_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => chars.all(is_folder_char),
        _ => false,
    }
}

pub fn normalize_folder_path(raw: &str) -> String {
    raw.split('/')
        .map(normalize_folder_segment)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn is_valid_folder_path(path: &str) -> bool {
    !path.is_empty() && path.split('/').all(is_valid_folder_segment)
}

/// Keep `[A-Za-z0-9._-]`, strip leading underscores, cap at 255 characters.
pub fn normalize_file_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_start_matches('_')
        .chars()
        .take(MAX_FILE_NAME_LEN)
        .collect()
}

/// Last path segment of a key.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Lower-cased extension of the last path segment, or `""`.
pub fn file_ext_from_key(key: &str) -> String {
    let name = base_name(key);
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => name[idx + 1..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Join a (possibly empty) folder path and a file name into a key.
pub fn join_key(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

/// Split a key into `(everything before the extension dot, ".ext")`.
///
/// A leading dot in the last segment does not start an extension.
fn split_extension(key: &str) -> (&str, &str) {
    let name_start = key.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match key[name_start..].rfind('.') {
        Some(idx) if idx > 0 => key.split_at(name_start + idx),
        _ => (key, ""),
    }
}

/// Insert `insert` just before the extension of the last segment.
pub fn insert_before_extension(key: &str, insert: &str) -> String {
    let (stem, ext) = split_extension(key);
    format!("{stem}{insert}{ext}")
}

/// Timestamp used in collision suffixes (millisecond granularity).
pub fn suffix_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// First-choice trash key: the object's file name under the trash root.
pub fn trash_key_for(key: &str) -> String {
    format!("{TRASH_PREFIX}{}", base_name(key))
}

pub fn deleted_variant(trash_key: &str, now: DateTime<Utc>) -> String {
    insert_before_extension(
        trash_key,
        &format!("{DELETED_MARKER}{}", suffix_timestamp(now)),
    )
}

pub fn restored_variant(key: &str, now: DateTime<Utc>) -> String {
    insert_before_extension(key, &format!("{RESTORED_MARKER}{}", suffix_timestamp(now)))
}

/// Final fallback when even the timestamped candidate is taken.
pub fn counter_variant(candidate: &str, attempt: u32) -> String {
    insert_before_extension(candidate, &format!("_{attempt}"))
}

/// Derive the live key of a trash key without the stored attribute: strip
/// the trash root and any `__deleted_<ts>` suffix (including a trailing
/// collision counter). Returns `None` for keys outside the trash root.
pub fn original_key_from_trash(trash_key: &str) -> Option<String> {
    let rest = trash_key.strip_prefix(TRASH_PREFIX)?;
    let (stem, ext) = split_extension(rest);
    let name_start = stem.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    let stem = match stem[name_start..].rfind(DELETED_MARKER) {
        Some(idx) => &stem[..name_start + idx],
        None => stem,
    };
    let original = format!("{stem}{ext}");
    if original.is_empty() {
        None
    } else {
        Some(original)
    }
}
