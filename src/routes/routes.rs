//! Route table for the admin API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Objects**
//!   - `GET    /api/objects`: visible listing (prefix, cursor, limit)
//!   - `POST   /api/objects/delete`: trash, or purge keys already in trash
//!   - `POST   /api/objects/restore`
//!   - `POST   /api/objects/move`
//!   - `POST   /api/objects/rename`
//!   - `POST   /api/objects/retag`
//!
//! - **Folders**
//!   - `GET    /api/folders`, `POST /api/folders`
//!   - `DELETE /api/folders/{*name}`: nested names like `trips/2025`

use crate::{
    config::CoreContext,
    handlers::{
        folder_handlers::{create_folder, list_folders, remove_folder},
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_objects, list_objects, move_objects, rename_objects, restore_objects,
            retag_objects,
        },
    },
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build the router. State (`CoreContext`) is attached by the caller.
pub fn routes() -> Router<CoreContext> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/objects", get(list_objects))
        .route("/api/objects/delete", post(delete_objects))
        .route("/api/objects/restore", post(restore_objects))
        .route("/api/objects/move", post(move_objects))
        .route("/api/objects/rename", post(rename_objects))
        .route("/api/objects/retag", post(retag_objects))
        .route("/api/folders", get(list_folders).post(create_folder))
        .route("/api/folders/{*name}", delete(remove_folder))
}
