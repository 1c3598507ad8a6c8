//! Chat handlers: CRUD plus blocking and streamed responses

use super::{double_option, validate_update, ValidatedJson};
use crate::app::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cevra_agent::ChatDetail;
use cevra_common::{
    db::models::{Chat, ChatMessage},
    db::ChatSummary,
    errors::Result,
};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(length(max = 500))]
    pub description: Option<String>,

    pub storage_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateChatRequest {
    pub name: Option<String>,

    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueryRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    pub chat_id: Uuid,
}

pub async fn create_chat(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>)> {
    let chat = state
        .chats
        .create_chat(req.name, req.description, req.storage_id)
        .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn list_chats(State(state): State<AppState>) -> Result<Json<Vec<ChatSummary>>> {
    Ok(Json(state.chats.list_chats().await?))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatDetail>> {
    Ok(Json(state.chats.get_chat(id).await?))
}

pub async fn update_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateChatRequest>,
) -> Result<Json<Chat>> {
    validate_update(req.name.as_deref(), &req.description)?;

    let chat = state
        .chats
        .update_chat(id, req.name, req.description)
        .await?;
    Ok(Json(chat))
}

pub async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.chats.delete_chat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run one agent turn and return the persisted assistant message
pub async fn respond(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ChatQueryRequest>,
) -> Result<Json<ChatMessage>> {
    Ok(Json(state.chats.respond(&req.query, req.chat_id).await?))
}

/// Run one agent turn, forwarding every step as an NDJSON line. Dropping
/// the connection drops the body stream, which cancels the agent.
pub async fn stream(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ChatQueryRequest>,
) -> Result<Response> {
    let events = state.chats.stream(&req.query, req.chat_id).await?;
    let body = Body::from_stream(events.into_ndjson().map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
