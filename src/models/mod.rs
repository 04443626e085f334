//! Data models for the object lifecycle core.
//!
//! `blob` mirrors the contract of the underlying key-value blob store,
//! `metadata` holds the JSON side-documents kept in that same store, and
//! `operation` is the per-item result shape returned by every batch call.

pub mod blob;
pub mod metadata;
pub mod operation;
