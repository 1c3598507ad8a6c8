//! Storage item handlers: upload, listing and removal

use crate::app::AppState;
use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use cevra_common::{
    db::models::Item,
    errors::{AppError, Result},
};
use cevra_ingestion::{ItemListing, UploadedFile};
use regex_lite::Regex;
use uuid::Uuid;

/// Multipart field carrying the document
pub const FILE_FIELD: &str = "file";

const SUSPICIOUS_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "scr", "pif", "com", "js", "vbs", "sh",
];

/// Accept one PDF for background ingestion. The item is returned in the
/// pending state; poll the item to follow its progress.
pub async fn upload_item(
    State(state): State<AppState>,
    Path(storage_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Item>)> {
    let limit = state.pipeline.max_file_size();
    let mut upload: Option<UploadedFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if upload.is_some() {
            return Err(AppError::validation(
                FILE_FIELD,
                "exactly one file must be uploaded",
            ));
        }

        let original = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| AppError::validation(FILE_FIELD, "the file has no name"))?;
        reject_suspicious_extension(&original)?;

        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, limit))?;

        upload = Some(UploadedFile::new(sanitize_filename(&original)?, mime_type, bytes));
    }

    let file = upload.ok_or_else(|| AppError::MissingField {
        field: FILE_FIELD.to_string(),
    })?;

    let item = state.pipeline.submit(file, storage_id).await?;
    Ok((StatusCode::ACCEPTED, Json(item)))
}

pub async fn list_items(
    State(state): State<AppState>,
    Path(storage_id): Path<Uuid>,
) -> Result<Json<ItemListing>> {
    Ok(Json(state.catalog.list_items(storage_id).await?))
}

pub async fn get_item(
    State(state): State<AppState>,
    Path((storage_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Item>> {
    Ok(Json(state.catalog.get_item(storage_id, item_id).await?))
}

pub async fn delete_item(
    State(state): State<AppState>,
    Path((storage_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode> {
    state.catalog.delete_item(storage_id, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn multipart_error(err: MultipartError, limit: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge { limit };
    }
    AppError::Validation {
        message: err.body_text(),
        field: Some(FILE_FIELD.to_string()),
    }
}

fn reject_suspicious_extension(filename: &str) -> Result<()> {
    let Some((_, extension)) = filename.rsplit_once('.') else {
        return Ok(());
    };

    let extension = extension.to_ascii_lowercase();
    if SUSPICIOUS_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::validation(
            FILE_FIELD,
            format!("file extension .{} is not allowed", extension),
        ));
    }
    Ok(())
}

fn sanitize_filename(filename: &str) -> Result<String> {
    let unsafe_chars = Regex::new(r"[^a-zA-Z0-9.-]").map_err(|e| AppError::Internal {
        message: format!("filename pattern: {}", e),
    })?;
    Ok(unsafe_chars.replace_all(filename, "_").into_owned())
}
