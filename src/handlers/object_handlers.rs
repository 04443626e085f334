//! HTTP handlers for object listing and the batch lifecycle operations.
//!
//! Batch handlers always answer 200 with an [`OperationReport`]; per-item
//! failures live inside the report. Only malformed requests and listing
//! failures map to error statuses.

use crate::{
    config::CoreContext,
    errors::AppError,
    models::{blob::ListPage, operation::OperationReport},
    services::{
        cascade::{self, RenameItem, RetagOptions},
        folders,
    },
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct KeysRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub keys: Vec<String>,
    /// Empty or absent moves to the root.
    #[serde(default)]
    pub target_folder: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub items: Vec<RenameItem>,
}

#[derive(Debug, Deserialize)]
pub struct RetagRequest {
    pub keys: Vec<String>,
    #[serde(flatten)]
    pub options: RetagOptions,
}

fn require_items<T>(items: &[T]) -> Result<(), AppError> {
    if items.is_empty() {
        return Err(AppError::bad_request("request names no objects"));
    }
    Ok(())
}

/// `GET /api/objects?prefix=&cursor=&limit=`
pub async fn list_objects(
    State(ctx): State<CoreContext>,
    Query(query): Query<ListObjectsQuery>,
) -> Result<Json<ListPage>, AppError> {
    let prefix = query.prefix.unwrap_or_default();
    let page = folders::list_visible_page(
        &ctx,
        &prefix,
        query.cursor,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    )
    .await?;
    Ok(Json(page))
}

/// `POST /api/objects/delete`
pub async fn delete_objects(
    State(ctx): State<CoreContext>,
    Json(req): Json<KeysRequest>,
) -> Result<Json<OperationReport>, AppError> {
    require_items(&req.keys)?;
    Ok(Json(cascade::delete_objects(&ctx, &req.keys).await))
}

/// `POST /api/objects/restore`
pub async fn restore_objects(
    State(ctx): State<CoreContext>,
    Json(req): Json<KeysRequest>,
) -> Result<Json<OperationReport>, AppError> {
    require_items(&req.keys)?;
    Ok(Json(cascade::restore_objects(&ctx, &req.keys).await))
}

/// `POST /api/objects/move`
pub async fn move_objects(
    State(ctx): State<CoreContext>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<OperationReport>, AppError> {
    require_items(&req.keys)?;
    Ok(Json(
        cascade::move_objects(&ctx, &req.keys, &req.target_folder).await,
    ))
}

/// `POST /api/objects/rename`
pub async fn rename_objects(
    State(ctx): State<CoreContext>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<OperationReport>, AppError> {
    require_items(&req.items)?;
    Ok(Json(cascade::rename_objects(&ctx, &req.items).await))
}

/// `POST /api/objects/retag`
pub async fn retag_objects(
    State(ctx): State<CoreContext>,
    Json(req): Json<RetagRequest>,
) -> Result<Json<OperationReport>, AppError> {
    require_items(&req.keys)?;
    Ok(Json(
        cascade::retag_objects(&ctx, &req.keys, &req.options).await,
    ))
}
