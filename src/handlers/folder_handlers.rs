use crate::{config::CoreContext, errors::AppError, services::folders};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct FolderList {
    pub folders: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FolderResponse {
    pub folder: String,
    pub removed: bool,
}

/// `GET /api/folders`
pub async fn list_folders(State(ctx): State<CoreContext>) -> Result<Json<FolderList>, AppError> {
    let folders = folders::list_folders(&ctx).await?;
    Ok(Json(FolderList { folders }))
}

/// `POST /api/folders`
pub async fn create_folder(
    State(ctx): State<CoreContext>,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<FolderResponse>), AppError> {
    let folder = folders::create_folder(&ctx, &req.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(FolderResponse {
            folder,
            removed: false,
        }),
    ))
}

/// `DELETE /api/folders/{*name}`
pub async fn remove_folder(
    State(ctx): State<CoreContext>,
    Path(name): Path<String>,
) -> Result<Json<FolderResponse>, AppError> {
    let removed = folders::remove_folder(&ctx, &name).await?;
    Ok(Json(FolderResponse {
        folder: name,
        removed,
    }))
}
