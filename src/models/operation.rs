//! Result shapes of multi-item operations.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

/// Outcome of one item in a batch.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ItemDetail {
    pub key: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Immutable summary of a finished batch.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub operation_id: String,
    pub ok: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub details: Vec<ItemDetail>,
    /// Keys whose failure may succeed on resubmission.
    pub retryable: Vec<String>,
    pub duration_ms: u64,
}

/// A metadata document the cascade could not update. The object-store
/// action it followed has already happened and stands.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeWarning {
    pub document: String,
    pub error: String,
    pub retryable: bool,
}

/// What every coordinator operation returns: the batch result, the flat
/// counters older clients read (`moved`, `trashed`, ...), and any degraded
/// cascade steps.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    #[serde(flatten)]
    pub result: BatchResult,
    #[serde(flatten)]
    pub counts: BTreeMap<&'static str, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<CascadeWarning>,
}

impl OperationReport {
    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}
