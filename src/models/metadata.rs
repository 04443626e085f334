//! JSON side-documents stored next to the objects they describe.
//!
//! Every document is `{version, updatedAt, <payload>}`. Reading always goes
//! through normalization: whatever is in the blob (partial, corrupt, wrong
//! types) comes back as the full shape with defaults filled in.

use crate::services::keys::{is_valid_folder_path, normalize_folder_path};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const IMAGE_META_KEY: &str = ".config/image-meta.json";
pub const HASH_META_KEY: &str = ".config/image-hashes.json";
pub const SHARE_META_KEY: &str = ".config/share-meta.json";
pub const FOLDER_META_KEY: &str = ".config/folders.json";
pub const MAINTENANCE_META_KEY: &str = ".config/maintenance.json";

/// `updatedAt` of a document that has never been written.
pub const NEVER_UPDATED: &str = "1970-01-01T00:00:00.000Z";

/// The payload half of a metadata document.
pub trait DocumentPayload: Serialize + Default + Clone + Send + Sync + 'static {
    /// Blob key the document lives at.
    const KEY: &'static str;

    /// Build the payload from the raw document object, dropping anything
    /// that does not fit.
    fn from_value(doc: &Value) -> Self;
}

/// Payloads whose entries are addressed by object key and must follow
/// those objects through moves and deletes.
pub trait KeyedIndex {
    /// Re-point references from `from` to `to`. Returns true if anything changed.
    fn migrate_key(&mut self, from: &str, to: &str) -> bool;

    /// Drop references to `key`. Returns true if anything changed.
    fn remove_key(&mut self, key: &str) -> bool;
}

/// A metadata document: version header plus payload.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<P> {
    pub version: u64,
    pub updated_at: String,
    #[serde(flatten)]
    pub payload: P,
}

impl<P: DocumentPayload> Versioned<P> {
    pub fn empty() -> Self {
        Self {
            version: 1,
            updated_at: NEVER_UPDATED.to_string(),
            payload: P::default(),
        }
    }

    /// Normalize a parsed document of any shape.
    pub fn from_value(doc: &Value) -> Self {
        let version = doc.get("version").and_then(coerce_u64).unwrap_or(1).max(1);
        let updated_at = doc
            .get("updatedAt")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(NEVER_UPDATED)
            .to_string();
        Self {
            version,
            updated_at,
            payload: P::from_value(doc),
        }
    }

    /// Parse raw blob bytes; unparsable input yields the empty document.
    pub fn from_slice(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::empty(),
        }
    }
}

/// Parse a JSON number or numeric string into a non-negative integer.
/// Non-finite values are rejected; negatives clamp to zero.
pub(crate) fn coerce_u64(value: &Value) -> Option<u64> {
    let float = match value {
        Value::Number(n) => {
            if let Some(int) = n.as_u64() {
                return Some(int);
            }
            n.as_f64()?
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !float.is_finite() {
        return None;
    }
    Some(float.max(0.0).min(u64::MAX as f64).floor() as u64)
}

fn string_field(entry: &Value, field: &str) -> String {
    entry
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_string(entry: &Value, field: &str) -> Option<String> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn object_entries<'a>(
    doc: &'a Value,
    field: &str,
) -> impl Iterator<Item = (&'a String, &'a Value)> {
    doc.get(field)
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|map| map.iter())
}

// --- image meta -----------------------------------------------------------

/// Tags and favorite flag of one image.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageEntry {
    pub tags: Vec<String>,
    pub favorite: bool,
}

impl ImageEntry {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && !self.favorite
    }
}

/// Normalize a list of tags: trimmed, empty tags dropped.
pub fn clean_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ImageMeta {
    pub images: BTreeMap<String, ImageEntry>,
}

impl ImageMeta {
    pub fn get(&self, key: &str) -> Option<&ImageEntry> {
        self.images.get(key)
    }

    /// Store `entry` under `key`; an empty entry removes the key instead.
    pub fn set(&mut self, key: &str, entry: ImageEntry) -> bool {
        if entry.is_empty() {
            return self.images.remove(key).is_some();
        }
        match self.images.get(key) {
            Some(existing) if *existing == entry => false,
            _ => {
                self.images.insert(key.to_string(), entry);
                true
            }
        }
    }
}

impl DocumentPayload for ImageMeta {
    const KEY: &'static str = IMAGE_META_KEY;

    fn from_value(doc: &Value) -> Self {
        let images = object_entries(doc, "images")
            .map(|(key, entry)| {
                let tags = clean_tags(string_list(entry.get("tags")));
                let favorite = entry.get("favorite").and_then(Value::as_bool).unwrap_or(false);
                (key.clone(), ImageEntry { tags, favorite })
            })
            .filter(|(_, entry)| !entry.is_empty())
            .collect();
        Self { images }
    }
}

impl KeyedIndex for ImageMeta {
    fn migrate_key(&mut self, from: &str, to: &str) -> bool {
        match self.images.remove(from) {
            Some(entry) => {
                self.images.insert(to.to_string(), entry);
                true
            }
            None => false,
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.images.remove(key).is_some()
    }
}

// --- hash meta ------------------------------------------------------------

/// Content hash of one object.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HashEntry {
    pub hash: String,
    pub size: Option<u64>,
    pub uploaded_at: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct HashMeta {
    pub hashes: BTreeMap<String, HashEntry>,
}

impl DocumentPayload for HashMeta {
    const KEY: &'static str = HASH_META_KEY;

    fn from_value(doc: &Value) -> Self {
        let hashes = object_entries(doc, "hashes")
            .filter_map(|(key, entry)| {
                let hash = entry
                    .get("hash")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|h| !h.is_empty() && h.chars().all(|c| c.is_ascii_hexdigit()))?
                    .to_ascii_lowercase();
                Some((
                    key.clone(),
                    HashEntry {
                        hash,
                        size: entry.get("size").and_then(coerce_u64),
                        uploaded_at: optional_string(entry, "uploadedAt"),
                    },
                ))
            })
            .collect();
        Self { hashes }
    }
}

impl KeyedIndex for HashMeta {
    fn migrate_key(&mut self, from: &str, to: &str) -> bool {
        match self.hashes.remove(from) {
            Some(entry) => {
                self.hashes.insert(to.to_string(), entry);
                true
            }
            None => false,
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.hashes.remove(key).is_some()
    }
}

// --- share meta -----------------------------------------------------------

/// A share (delivery) definition: a titled set of object keys.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShareEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    pub items: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_salt: Option<String>,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ShareMeta {
    pub shares: BTreeMap<String, ShareEntry>,
}

impl DocumentPayload for ShareMeta {
    const KEY: &'static str = SHARE_META_KEY;

    fn from_value(doc: &Value) -> Self {
        let shares = object_entries(doc, "shares")
            .filter(|(_, entry)| entry.is_object())
            .map(|(id, entry)| {
                let share = ShareEntry {
                    id: optional_string(entry, "id").unwrap_or_else(|| id.clone()),
                    title: string_field(entry, "title"),
                    description: string_field(entry, "description"),
                    items: string_list(entry.get("items")),
                    created_at: string_field(entry, "createdAt"),
                    updated_at: string_field(entry, "updatedAt"),
                    password_hash: optional_string(entry, "passwordHash"),
                    password_salt: optional_string(entry, "passwordSalt"),
                    domain: string_field(entry, "domain"),
                    folder: optional_string(entry, "folder"),
                };
                (id.clone(), share)
            })
            .collect();
        Self { shares }
    }
}

impl KeyedIndex for ShareMeta {
    fn migrate_key(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for share in self.shares.values_mut() {
            if !share.items.iter().any(|item| item == from) {
                continue;
            }
            let mut seen = BTreeSet::new();
            let items = std::mem::take(&mut share.items);
            share.items = items
                .into_iter()
                .map(|item| if item == from { to.to_string() } else { item })
                .filter(|item| seen.insert(item.clone()))
                .collect();
            changed = true;
        }
        changed
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let mut changed = false;
        for share in self.shares.values_mut() {
            let before = share.items.len();
            share.items.retain(|item| item != key);
            changed |= share.items.len() != before;
        }
        changed
    }
}

// --- folder meta ----------------------------------------------------------

/// Explicitly created folders (including empty ones).
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct FolderMeta {
    pub folders: Vec<String>,
}

impl FolderMeta {
    pub fn contains(&self, folder: &str) -> bool {
        self.folders.iter().any(|f| f == folder)
    }

    /// Insert keeping the list sorted and unique.
    pub fn add(&mut self, folder: &str) -> bool {
        match self.folders.binary_search_by(|f| f.as_str().cmp(folder)) {
            Ok(_) => false,
            Err(pos) => {
                self.folders.insert(pos, folder.to_string());
                true
            }
        }
    }

    pub fn remove(&mut self, folder: &str) -> bool {
        let before = self.folders.len();
        self.folders.retain(|f| f != folder);
        self.folders.len() != before
    }
}

impl DocumentPayload for FolderMeta {
    const KEY: &'static str = FOLDER_META_KEY;

    fn from_value(doc: &Value) -> Self {
        let folders: BTreeSet<String> = string_list(doc.get("folders"))
            .iter()
            .map(|raw| normalize_folder_path(raw))
            .filter(|folder| is_valid_folder_path(folder))
            .collect();
        Self {
            folders: folders.into_iter().collect(),
        }
    }
}

// --- maintenance meta -----------------------------------------------------

/// Last-run timestamps of maintenance jobs.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct MaintenanceMeta {
    pub jobs: BTreeMap<String, String>,
}

impl DocumentPayload for MaintenanceMeta {
    const KEY: &'static str = MAINTENANCE_META_KEY;

    fn from_value(doc: &Value) -> Self {
        let jobs = object_entries(doc, "jobs")
            .filter_map(|(job, ts)| Some((job.clone(), ts.as_str()?.to_string())))
            .collect();
        Self { jobs }
    }
}

pub type ImageMetaDoc = Versioned<ImageMeta>;
pub type HashMetaDoc = Versioned<HashMeta>;
pub type ShareMetaDoc = Versioned<ShareMeta>;
pub type FolderMetaDoc = Versioned<FolderMeta>;
pub type MaintenanceMetaDoc = Versioned<MaintenanceMeta>;
