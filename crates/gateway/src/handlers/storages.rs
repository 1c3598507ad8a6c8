//! Storage catalog handlers

use super::{double_option, validate_update, ValidatedJson};
use crate::app::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use cevra_common::{db::models::Storage, errors::Result};
use cevra_ingestion::StorageView;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateStorageRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(length(max = 500))]
    pub description: Option<String>,
}

/// Partial update; `description: null` clears the description
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateStorageRequest {
    pub name: Option<String>,

    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

pub async fn create_storage(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateStorageRequest>,
) -> Result<(StatusCode, Json<Storage>)> {
    let storage = state
        .catalog
        .create_storage(req.name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(storage)))
}

pub async fn list_storages(State(state): State<AppState>) -> Result<Json<Vec<StorageView>>> {
    Ok(Json(state.catalog.list_storages().await?))
}

pub async fn get_storage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StorageView>> {
    Ok(Json(state.catalog.get_storage(id).await?))
}

pub async fn update_storage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateStorageRequest>,
) -> Result<Json<Storage>> {
    validate_update(req.name.as_deref(), &req.description)?;

    let storage = state
        .catalog
        .update_storage(id, req.name, req.description)
        .await?;
    Ok(Json(storage))
}

pub async fn delete_storage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.catalog.delete_storage(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
