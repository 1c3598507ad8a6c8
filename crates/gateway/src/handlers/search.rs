//! Similarity search handler

use super::ValidatedJson;
use crate::app::AppState;
use axum::{extract::State, Json};
use cevra_common::errors::Result;
use cevra_search::SearchHit;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    pub storage_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub count: usize,
}

/// Top-k chunks of one storage, best match first
pub async fn search(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let results = state.retrieval.search(&req.query, req.storage_id).await?;

    Ok(Json(SearchResponse {
        count: results.len(),
        results,
    }))
}
