//! Per-item outcome tracking for batch requests.

use crate::models::operation::{BatchResult, ItemDetail, ItemStatus};
use serde_json::Value;
use std::{fmt::Display, time::Instant};
use uuid::Uuid;

/// Collects one outcome per processed item and folds them into a
/// [`BatchResult`]. Lives for a single request.
#[derive(Debug)]
pub struct BatchTracker {
    id: String,
    started: Instant,
    items: Vec<ItemDetail>,
    retryable: Vec<String>,
}

impl BatchTracker {
    pub fn new(id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            started: Instant::now(),
            items: Vec::new(),
            retryable: Vec::new(),
        }
    }

    /// Mark `key` as in flight. The next outcome recorded for it replaces
    /// the pending entry.
    pub fn begin(&mut self, key: &str) {
        self.items.push(ItemDetail {
            key: key.to_string(),
            status: ItemStatus::Pending,
            error: None,
            data: None,
        });
    }

    pub fn add_success(&mut self, key: &str, data: Option<Value>) {
        self.record(ItemDetail {
            key: key.to_string(),
            status: ItemStatus::Success,
            error: None,
            data,
        });
    }

    pub fn add_failed(&mut self, key: &str, error: impl Display, retryable: bool) {
        self.record(ItemDetail {
            key: key.to_string(),
            status: ItemStatus::Failed,
            error: Some(error.to_string()),
            data: None,
        });
        if retryable && !self.retryable.iter().any(|k| k == key) {
            self.retryable.push(key.to_string());
        }
    }

    pub fn add_skipped(&mut self, key: &str, reason: Option<&str>) {
        self.record(ItemDetail {
            key: key.to_string(),
            status: ItemStatus::Skipped,
            error: reason.map(str::to_string),
            data: None,
        });
    }

    fn record(&mut self, detail: ItemDetail) {
        let pending = self
            .items
            .iter_mut()
            .rev()
            .find(|item| item.key == detail.key && item.status == ItemStatus::Pending);
        match pending {
            Some(slot) => *slot = detail,
            None => self.items.push(detail),
        }
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    pub fn result(&self) -> BatchResult {
        let failed = self.count(ItemStatus::Failed);
        BatchResult {
            operation_id: self.id.clone(),
            ok: failed == 0,
            total: self.items.len(),
            succeeded: self.count(ItemStatus::Success),
            failed,
            skipped: self.count(ItemStatus::Skipped),
            details: self.items.clone(),
            retryable: self.retryable.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::new(None)
    }
}
