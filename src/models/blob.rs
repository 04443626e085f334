//! Value types exchanged with a blob store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Custom (user-defined) attributes stored alongside a blob.
pub type CustomMetadata = BTreeMap<String, String>;

/// HTTP-level metadata preserved across moves.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMetadata {
    pub content_type: Option<String>,
}

/// Lowercase hex MD5 of a payload, as stored in blob etags.
pub fn payload_etag(body: &[u8]) -> String {
    format!("{:x}", md5::compute(body))
}

/// A blob with its body, as returned by `get`.
#[derive(Clone, Debug)]
pub struct BlobObject {
    pub key: String,
    pub body: Bytes,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
    pub size: u64,
    /// Lowercase hex MD5 of the body.
    pub etag: String,
    pub uploaded: DateTime<Utc>,
}

/// Blob attributes without the body, as returned by `head` and `list`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobHead {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub uploaded: DateTime<Utc>,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
}

impl From<&BlobObject> for BlobHead {
    fn from(obj: &BlobObject) -> Self {
        Self {
            key: obj.key.clone(),
            size: obj.size,
            etag: obj.etag.clone(),
            uploaded: obj.uploaded,
            http_metadata: obj.http_metadata.clone(),
            custom_metadata: obj.custom_metadata.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub http_metadata: Option<HttpMetadata>,
    pub custom_metadata: Option<CustomMetadata>,
}

impl PutOptions {
    /// Options for a JSON document write.
    pub fn json() -> Self {
        Self {
            http_metadata: Some(HttpMetadata {
                content_type: Some("application/json".into()),
            }),
            custom_metadata: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: usize,
}

/// One page of a listing.
#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub objects: Vec<BlobHead>,
    pub truncated: bool,
    pub cursor: Option<String>,
}
