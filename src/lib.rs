//! Object lifecycle and metadata-consistency core of an image-hosting
//! admin console.
//!
//! Objects live in a key-value blob store. Deletion parks them under
//! `trash/`, restore brings them back, and move/rename relocate them; after
//! every batch the JSON metadata documents kept in the same store are
//! re-keyed so tags, hashes and shares follow their files.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use config::{AppConfig, CoreContext};
pub use errors::{AppError, CoreError, CoreResult, StorageError};
